//! Realm persistence — subdomain claims under platform roots and
//! user-backend zones

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{AuditEntry, Store};
use crate::{Error, Result};

/// How the zone gate treats the realm's authoritative name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealmType {
    /// Target must equal the authoritative zone exactly
    Host,
    /// Target may be the zone or any strict subdomain of it
    Subdomain,
}

impl RealmType {
    /// Stable storage identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Subdomain => "subdomain",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Self::Host),
            "subdomain" => Some(Self::Subdomain),
            _ => None,
        }
    }
}

/// A scope of authority for tokens issued by one account.
///
/// Exactly one of `domain_root_id` (platform-managed) and
/// `user_backend_id` (bring-your-own-DNS) is set; the schema enforces the
/// exclusive-or.
#[derive(Debug, Clone)]
pub struct Realm {
    /// Row id
    pub id: i64,
    /// Owning account
    pub account_id: i64,
    /// Claimed label chain, or empty for an apex realm
    pub realm_value: String,
    /// Host vs subdomain gate semantics
    pub realm_type: RealmType,
    /// Zone the realm sits under, for user-backend realms
    pub domain: Option<String>,
    /// Platform-managed root link
    pub domain_root_id: Option<i64>,
    /// User-backend link
    pub user_backend_id: Option<i64>,
    /// Soft-delete flag
    pub is_active: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Parameters for a realm claim.
#[derive(Debug, Clone)]
pub struct NewRealm {
    /// Owning account
    pub account_id: i64,
    /// Claimed label chain (may be empty for apex)
    pub realm_value: String,
    /// Gate semantics
    pub realm_type: RealmType,
    /// Zone for user-backend realms
    pub domain: Option<String>,
    /// Platform root link (XOR with `user_backend_id`)
    pub domain_root_id: Option<i64>,
    /// User backend link (XOR with `domain_root_id`)
    pub user_backend_id: Option<i64>,
}

fn from_row(row: &SqliteRow) -> Result<Realm> {
    let realm_type: String = row.try_get("realm_type")?;
    Ok(Realm {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        realm_value: row.try_get("realm_value")?,
        realm_type: RealmType::parse(&realm_type)
            .ok_or_else(|| Error::StorageError(format!("bad realm_type {realm_type}")))?,
        domain: row.try_get("domain")?,
        domain_root_id: row.try_get("domain_root_id")?,
        user_backend_id: row.try_get("user_backend_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Claim a realm. The unique indices make a double claim an atomic
    /// `conflict`; the first committer wins.
    pub async fn claim_realm(&self, new: &NewRealm, audit: AuditEntry) -> Result<Realm> {
        if new.domain_root_id.is_some() == new.user_backend_id.is_some() {
            return Err(Error::MalformedRequest(
                "realm must link exactly one of domain root and user backend".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO realms (account_id, realm_value, realm_type, domain, domain_root_id,
                                 user_backend_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(new.account_id)
        .bind(&new.realm_value)
        .bind(new.realm_type.as_str())
        .bind(&new.domain)
        .bind(new.domain_root_id)
        .bind(new.user_backend_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.realm_by_id(id).await
    }

    /// Fetch a realm by id.
    pub async fn realm_by_id(&self, id: i64) -> Result<Realm> {
        let row = sqlx::query("SELECT * FROM realms WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("realm {id}")))?;
        from_row(&row)
    }

    /// Active realms owned by one account.
    pub async fn realms_for_account(&self, account_id: i64) -> Result<Vec<Realm>> {
        let rows =
            sqlx::query("SELECT * FROM realms WHERE account_id = ?1 AND is_active = 1 ORDER BY id")
                .bind(account_id)
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(from_row).collect()
    }

    /// Toggle the active flag. Deactivation immediately denies dependent
    /// tokens without touching them.
    pub async fn set_realm_active(&self, realm_id: i64, active: bool, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE realms SET is_active = ?2 WHERE id = ?1")
            .bind(realm_id)
            .bind(active)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("realm {realm_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a realm; cascades to its tokens in the same transaction.
    pub async fn delete_realm(&self, realm_id: i64, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM tokens WHERE realm_id = ?1")
            .bind(realm_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM realms WHERE id = ?1")
            .bind(realm_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("realm {realm_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }
}
