//! API token persistence

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{json_string_vec, to_json_text, AuditEntry, Store};
use crate::{Error, Result};

/// DNS operation kinds a token may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read zone info and record sets
    Read,
    /// Create records
    Create,
    /// Update records
    Update,
    /// Delete records
    Delete,
}

impl Operation {
    /// Stable identifier used in storage and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An API credential bound to one realm.
#[derive(Debug, Clone)]
pub struct Token {
    /// Row id
    pub id: i64,
    /// Indexed lookup prefix; the only token material ever logged
    pub token_prefix: String,
    /// bcrypt hash over the full plaintext
    pub token_hash: String,
    /// Owning realm
    pub realm_id: i64,
    /// Allowed record types; empty inherits from realm/root
    pub record_types: Vec<String>,
    /// Allowed operations; empty inherits from realm/root
    pub operations: Vec<Operation>,
    /// CIDR and hostname origin allowlist; empty means any origin
    pub allowed_origins: Vec<String>,
    /// Expiry instant
    pub expires_at: Option<DateTime<Utc>>,
    /// Soft-delete / revocation flag
    pub is_active: bool,
    /// Notify the owning account on every use
    pub email_on_use: bool,
    /// Last successful authentication
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Whether the token is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Parameters for token creation.
#[derive(Debug, Clone, Default)]
pub struct NewToken {
    /// Owning realm
    pub realm_id: i64,
    /// Allowed record types (empty = inherit)
    pub record_types: Vec<String>,
    /// Allowed operations (empty = inherit)
    pub operations: Vec<Operation>,
    /// Origin allowlist (empty = any)
    pub allowed_origins: Vec<String>,
    /// Optional expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Notify owner on use
    pub email_on_use: bool,
}

fn from_row(row: &SqliteRow) -> Result<Token> {
    let operations = json_string_vec(row.try_get("operations")?)
        .iter()
        .filter_map(|s| Operation::parse(s))
        .collect();
    Ok(Token {
        id: row.try_get("id")?,
        token_prefix: row.try_get("token_prefix")?,
        token_hash: row.try_get("token_hash")?,
        realm_id: row.try_get("realm_id")?,
        record_types: json_string_vec(row.try_get("record_types")?),
        operations,
        allowed_origins: json_string_vec(row.try_get("allowed_origins")?),
        expires_at: row.try_get("expires_at")?,
        is_active: row.try_get("is_active")?,
        email_on_use: row.try_get("email_on_use")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Persist a new token. The audit entry commits in the same
    /// transaction; a duplicate prefix surfaces as `conflict`.
    pub async fn create_token(
        &self,
        new: &NewToken,
        prefix: &str,
        hash: &str,
        audit: AuditEntry,
    ) -> Result<Token> {
        let ops: Vec<&str> = new.operations.iter().map(|o| o.as_str()).collect();
        let mut tx = self.pool().begin().await?;

        let id = sqlx::query(
            "INSERT INTO tokens (token_prefix, token_hash, realm_id, record_types, operations,
                                 allowed_origins, expires_at, email_on_use, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(prefix)
        .bind(hash)
        .bind(new.realm_id)
        .bind(to_json_text(&new.record_types))
        .bind(to_json_text(&ops))
        .bind(to_json_text(&new.allowed_origins))
        .bind(new.expires_at)
        .bind(new.email_on_use)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.token_by_id(id).await
    }

    /// Fetch a token by id.
    pub async fn token_by_id(&self, id: i64) -> Result<Token> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("token {id}")))?;
        from_row(&row)
    }

    /// Hot-path lookup by prefix. Returns `None` for unknown prefixes; the
    /// caller burns a dummy bcrypt verification in that case.
    pub async fn token_by_prefix(&self, prefix: &str) -> Result<Option<Token>> {
        let row = sqlx::query("SELECT * FROM tokens WHERE token_prefix = ?1")
            .bind(prefix)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    /// Tokens under one realm.
    pub async fn tokens_for_realm(&self, realm_id: i64) -> Result<Vec<Token>> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE realm_id = ?1 ORDER BY id")
            .bind(realm_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(from_row).collect()
    }

    /// Stamp last-use after successful authentication.
    pub async fn touch_token(&self, token_id: i64) -> Result<()> {
        sqlx::query("UPDATE tokens SET last_used_at = ?2 WHERE id = ?1")
            .bind(token_id)
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Revoke (soft-delete) a token.
    pub async fn revoke_token(&self, token_id: i64, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE tokens SET is_active = 0 WHERE id = ?1")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("token {token_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_identifiers_round_trip() {
        for op in [
            Operation::Read,
            Operation::Create,
            Operation::Update,
            Operation::Delete,
        ] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("drop"), None);
    }

    #[test]
    fn expiry_check_uses_supplied_clock() {
        let now = Utc::now();
        let token = Token {
            id: 1,
            token_prefix: "p".into(),
            token_hash: String::new(),
            realm_id: 1,
            record_types: vec![],
            operations: vec![],
            allowed_origins: vec![],
            expires_at: Some(now),
            is_active: true,
            email_on_use: false,
            last_used_at: None,
            created_at: now,
        };
        assert!(token.is_expired(now));
        assert!(!token.is_expired(now - chrono::Duration::seconds(1)));
    }
}
