//! Provider registry rows, backend services, domain roots, and grants

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{json_string_vec, to_json_text, AuditEntry, Store};
use crate::{Error, Result};

/// Who owns a backend service's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    /// Operated by the platform; usable through managed domain roots
    Platform,
    /// Bring-your-own-DNS credentials of one account
    User,
}

impl OwnerType {
    /// Stable storage identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::User => "user",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "platform" => Some(Self::Platform),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Who may see and claim under a managed domain root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Any account may claim
    Public,
    /// Admin approval required
    Private,
    /// Claimable only with an explicit grant
    Invite,
}

impl Visibility {
    /// Stable storage identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Invite => "invite",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "invite" => Some(Self::Invite),
            _ => None,
        }
    }
}

/// Grant flavor on a domain root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Ordinary claim permission
    Standard,
    /// Management rights over the root
    Admin,
    /// Access to an invite-only root
    InviteOnly,
}

impl GrantType {
    /// Stable storage identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Admin => "admin",
            Self::InviteOnly => "invite_only",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "admin" => Some(Self::Admin),
            "invite_only" => Some(Self::InviteOnly),
            _ => None,
        }
    }
}

/// Capability flags a provider implementation declares.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProviderCaps {
    /// Can enumerate zones
    pub zone_list: bool,
    /// Can create zones
    pub zone_create: bool,
    /// Exposes DNSSEC state
    pub dnssec: bool,
    /// Record types the provider accepts
    pub record_types: Vec<String>,
}

/// Registry entry for a DNS provider implementation.
#[derive(Debug, Clone)]
pub struct BackendProvider {
    /// Row id
    pub id: i64,
    /// Stable code, e.g. `netcup`, `powerdns`
    pub provider_code: String,
    /// Human-readable name
    pub display_name: String,
    /// JSON Schema every service config must satisfy
    pub config_schema: serde_json::Value,
    /// Declared capabilities
    pub caps: ProviderCaps,
    /// Registry toggle
    pub is_enabled: bool,
}

/// A stored credential set for one provider instance.
#[derive(Debug, Clone)]
pub struct BackendService {
    /// Row id
    pub id: i64,
    /// Provider registry link
    pub provider_id: i64,
    /// Unique service name
    pub service_name: String,
    /// Platform- or user-owned
    pub owner_type: OwnerType,
    /// Owning account for user services
    pub owner_id: Option<i64>,
    /// Schema-validated provider configuration
    pub config: serde_json::Value,
    /// Soft-delete flag
    pub is_active: bool,
    /// Default service for the owner
    pub is_default_for_owner: bool,
    /// Outcome of the last connection test
    pub last_test_status: Option<String>,
    /// Message from the last connection test
    pub last_test_message: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// A platform-administered zone under which accounts claim subdomains.
#[derive(Debug, Clone)]
pub struct ManagedDomainRoot {
    /// Row id
    pub id: i64,
    /// Backend service that answers for the zone
    pub backend_service_id: i64,
    /// Public suffix users claim under
    pub root_domain: String,
    /// Upstream zone name (may differ from `root_domain`)
    pub dns_zone: String,
    /// Claim visibility
    pub visibility: Visibility,
    /// Whether an apex realm may be claimed
    pub allow_apex_access: bool,
    /// Minimum label depth of a claim (apex counts as 0)
    pub min_subdomain_depth: i64,
    /// Maximum label depth of a claim
    pub max_subdomain_depth: i64,
    /// Record types the root policy allows; empty allows all
    pub allowed_record_types: Vec<String>,
    /// Operations the root policy allows; empty allows all
    pub allowed_operations: Vec<String>,
    /// Soft-delete flag
    pub is_active: bool,
    /// Ownership verification instant
    pub verified_at: Option<DateTime<Utc>>,
}

/// An account's permission on a domain root.
#[derive(Debug, Clone)]
pub struct DomainRootGrant {
    /// Row id
    pub id: i64,
    /// Root the grant applies to
    pub domain_root_id: i64,
    /// Grantee
    pub account_id: i64,
    /// Grant flavor
    pub grant_type: GrantType,
    /// Per-grant policy overrides
    pub overrides: serde_json::Value,
    /// Granting admin
    pub granted_by: Option<i64>,
    /// Expiry instant
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation instant
    pub revoked_at: Option<DateTime<Utc>>,
}

impl DomainRootGrant {
    /// Whether the grant currently applies.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

fn provider_from_row(row: &SqliteRow) -> Result<BackendProvider> {
    let schema_text: String = row.try_get("config_schema")?;
    Ok(BackendProvider {
        id: row.try_get("id")?,
        provider_code: row.try_get("provider_code")?,
        display_name: row.try_get("display_name")?,
        config_schema: serde_json::from_str(&schema_text)?,
        caps: ProviderCaps {
            zone_list: row.try_get("cap_zone_list")?,
            zone_create: row.try_get("cap_zone_create")?,
            dnssec: row.try_get("cap_dnssec")?,
            record_types: json_string_vec(row.try_get("cap_record_types")?),
        },
        is_enabled: row.try_get("is_enabled")?,
    })
}

fn service_from_row(row: &SqliteRow) -> Result<BackendService> {
    let owner_type: String = row.try_get("owner_type")?;
    let config_text: String = row.try_get("config")?;
    Ok(BackendService {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        service_name: row.try_get("service_name")?,
        owner_type: OwnerType::parse(&owner_type)
            .ok_or_else(|| Error::StorageError(format!("bad owner_type {owner_type}")))?,
        owner_id: row.try_get("owner_id")?,
        config: serde_json::from_str(&config_text)?,
        is_active: row.try_get("is_active")?,
        is_default_for_owner: row.try_get("is_default_for_owner")?,
        last_test_status: row.try_get("last_test_status")?,
        last_test_message: row.try_get("last_test_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn root_from_row(row: &SqliteRow) -> Result<ManagedDomainRoot> {
    let visibility: String = row.try_get("visibility")?;
    Ok(ManagedDomainRoot {
        id: row.try_get("id")?,
        backend_service_id: row.try_get("backend_service_id")?,
        root_domain: row.try_get("root_domain")?,
        dns_zone: row.try_get("dns_zone")?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| Error::StorageError(format!("bad visibility {visibility}")))?,
        allow_apex_access: row.try_get("allow_apex_access")?,
        min_subdomain_depth: row.try_get("min_subdomain_depth")?,
        max_subdomain_depth: row.try_get("max_subdomain_depth")?,
        allowed_record_types: json_string_vec(row.try_get("allowed_record_types")?),
        allowed_operations: json_string_vec(row.try_get("allowed_operations")?),
        is_active: row.try_get("is_active")?,
        verified_at: row.try_get("verified_at")?,
    })
}

fn grant_from_row(row: &SqliteRow) -> Result<DomainRootGrant> {
    let grant_type: String = row.try_get("grant_type")?;
    let overrides_text: String = row.try_get("overrides")?;
    Ok(DomainRootGrant {
        id: row.try_get("id")?,
        domain_root_id: row.try_get("domain_root_id")?,
        account_id: row.try_get("account_id")?,
        grant_type: GrantType::parse(&grant_type)
            .ok_or_else(|| Error::StorageError(format!("bad grant_type {grant_type}")))?,
        overrides: serde_json::from_str(&overrides_text)?,
        granted_by: row.try_get("granted_by")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

impl Store {
    /// Install or refresh a provider registry row (bootstrap path).
    pub async fn upsert_provider(
        &self,
        code: &str,
        display_name: &str,
        schema: &serde_json::Value,
        caps: &ProviderCaps,
        enabled: bool,
    ) -> Result<BackendProvider> {
        sqlx::query(
            "INSERT INTO backend_providers (provider_code, display_name, config_schema,
                 cap_zone_list, cap_zone_create, cap_dnssec, cap_record_types, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(provider_code) DO UPDATE SET
                 display_name = excluded.display_name,
                 config_schema = excluded.config_schema,
                 cap_zone_list = excluded.cap_zone_list,
                 cap_zone_create = excluded.cap_zone_create,
                 cap_dnssec = excluded.cap_dnssec,
                 cap_record_types = excluded.cap_record_types,
                 is_enabled = excluded.is_enabled",
        )
        .bind(code)
        .bind(display_name)
        .bind(schema.to_string())
        .bind(caps.zone_list)
        .bind(caps.zone_create)
        .bind(caps.dnssec)
        .bind(to_json_text(&caps.record_types))
        .bind(enabled)
        .execute(self.pool())
        .await?;

        self.provider_by_code(code)
            .await?
            .ok_or_else(|| Error::Internal(format!("provider {code} vanished after upsert")))
    }

    /// Look up a provider by code.
    pub async fn provider_by_code(&self, code: &str) -> Result<Option<BackendProvider>> {
        let row = sqlx::query("SELECT * FROM backend_providers WHERE provider_code = ?1")
            .bind(code)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(provider_from_row).transpose()
    }

    /// Look up a provider by id.
    pub async fn provider_by_id(&self, id: i64) -> Result<BackendProvider> {
        let row = sqlx::query("SELECT * FROM backend_providers WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("provider {id}")))?;
        provider_from_row(&row)
    }

    /// All registered providers.
    pub async fn list_providers(&self) -> Result<Vec<BackendProvider>> {
        let rows = sqlx::query("SELECT * FROM backend_providers ORDER BY provider_code")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(provider_from_row).collect()
    }

    /// Create a backend service. The caller validates `config` against the
    /// provider schema first.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_backend_service(
        &self,
        provider_id: i64,
        service_name: &str,
        owner_type: OwnerType,
        owner_id: Option<i64>,
        config: &serde_json::Value,
        is_default_for_owner: bool,
        audit: AuditEntry,
    ) -> Result<BackendService> {
        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO backend_services (provider_id, service_name, owner_type, owner_id,
                 config, is_default_for_owner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(provider_id)
        .bind(service_name)
        .bind(owner_type.as_str())
        .bind(owner_id)
        .bind(config.to_string())
        .bind(is_default_for_owner)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.backend_service_by_id(id).await
    }

    /// Fetch a backend service by id.
    pub async fn backend_service_by_id(&self, id: i64) -> Result<BackendService> {
        let row = sqlx::query("SELECT * FROM backend_services WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("backend service {id}")))?;
        service_from_row(&row)
    }

    /// All backend services, optionally only one owner's.
    pub async fn list_backend_services(&self, owner_id: Option<i64>) -> Result<Vec<BackendService>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query("SELECT * FROM backend_services WHERE owner_id = ?1 ORDER BY id")
                    .bind(owner)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM backend_services ORDER BY id")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(service_from_row).collect()
    }

    /// Record the outcome of a connection test.
    pub async fn set_service_test_result(
        &self,
        service_id: i64,
        status: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backend_services SET last_test_status = ?2, last_test_message = ?3 WHERE id = ?1",
        )
        .bind(service_id)
        .bind(status)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Toggle a service's active flag.
    pub async fn set_service_active(
        &self,
        service_id: i64,
        active: bool,
        audit: AuditEntry,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE backend_services SET is_active = ?2 WHERE id = ?1")
            .bind(service_id)
            .bind(active)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("backend service {service_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create a managed domain root.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_domain_root(
        &self,
        backend_service_id: i64,
        root_domain: &str,
        dns_zone: &str,
        visibility: Visibility,
        allow_apex_access: bool,
        depth: (i64, i64),
        allowed_record_types: &[String],
        allowed_operations: &[String],
        audit: AuditEntry,
    ) -> Result<ManagedDomainRoot> {
        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO domain_roots (backend_service_id, root_domain, dns_zone, visibility,
                 allow_apex_access, min_subdomain_depth, max_subdomain_depth,
                 allowed_record_types, allowed_operations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(backend_service_id)
        .bind(root_domain)
        .bind(dns_zone)
        .bind(visibility.as_str())
        .bind(allow_apex_access)
        .bind(depth.0)
        .bind(depth.1)
        .bind(to_json_text(&allowed_record_types))
        .bind(to_json_text(&allowed_operations))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.domain_root_by_id(id).await
    }

    /// Fetch a domain root by id.
    pub async fn domain_root_by_id(&self, id: i64) -> Result<ManagedDomainRoot> {
        let row = sqlx::query("SELECT * FROM domain_roots WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("domain root {id}")))?;
        root_from_row(&row)
    }

    /// Active roots the account may claim under: public roots plus any the
    /// account holds a live grant on.
    pub async fn roots_visible_to_account(&self, account_id: i64) -> Result<Vec<ManagedDomainRoot>> {
        let rows = sqlx::query(
            "SELECT DISTINCT r.* FROM domain_roots r
             LEFT JOIN domain_root_grants g
                 ON g.domain_root_id = r.id AND g.account_id = ?1 AND g.revoked_at IS NULL
             WHERE r.is_active = 1 AND (r.visibility = 'public' OR g.id IS NOT NULL)
             ORDER BY r.root_domain",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(root_from_row).collect()
    }

    /// Toggle a root's active flag.
    pub async fn set_root_active(&self, root_id: i64, active: bool, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE domain_roots SET is_active = ?2 WHERE id = ?1")
            .bind(root_id)
            .bind(active)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("domain root {root_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Issue a grant on a domain root.
    pub async fn create_grant(
        &self,
        domain_root_id: i64,
        account_id: i64,
        grant_type: GrantType,
        granted_by: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
        audit: AuditEntry,
    ) -> Result<DomainRootGrant> {
        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO domain_root_grants (domain_root_id, account_id, grant_type, granted_by, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(domain_root_id)
        .bind(account_id)
        .bind(grant_type.as_str())
        .bind(granted_by)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        let row = sqlx::query("SELECT * FROM domain_root_grants WHERE id = ?1")
            .bind(id)
            .fetch_one(self.pool())
            .await?;
        grant_from_row(&row)
    }

    /// Live grants an account holds on one root.
    pub async fn grants_for_account(
        &self,
        domain_root_id: i64,
        account_id: i64,
    ) -> Result<Vec<DomainRootGrant>> {
        let rows = sqlx::query(
            "SELECT * FROM domain_root_grants
             WHERE domain_root_id = ?1 AND account_id = ?2 AND revoked_at IS NULL",
        )
        .bind(domain_root_id)
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(grant_from_row).collect()
    }

    /// Revoke a grant.
    pub async fn revoke_grant(&self, grant_id: i64, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE domain_root_grants SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
        )
        .bind(grant_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("grant {grant_id}")));
        }
        self.insert_audit_tx(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }
}
