//! Database schema initialization and migrations
//!
//! Migrations are one-way and versioned. The current version lives in the
//! single `schema_version` row; a state file written by a newer binary
//! refuses to open. Each migration runs inside one transaction together
//! with the version bump.

use sqlx::{Row, SqlitePool};

use crate::{Error, Result};

/// Schema version this binary writes.
pub const SCHEMA_VERSION: i64 = 2;

const MIGRATIONS: &[(i64, &str)] = &[
    (1, MIGRATION_V1),
    (2, MIGRATION_V2),
];

const MIGRATION_V1: &str = "
CREATE TABLE accounts (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    must_change_password INTEGER NOT NULL DEFAULT 0,
    is_admin INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    totp_secret TEXT,
    totp_enabled INTEGER NOT NULL DEFAULT 0,
    totp_last_step INTEGER,
    recovery_codes TEXT NOT NULL DEFAULT '[]',
    failed_login_count INTEGER NOT NULL DEFAULT 0,
    failed_window_start TEXT,
    locked_until TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE backend_providers (
    id INTEGER PRIMARY KEY,
    provider_code TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    config_schema TEXT NOT NULL,
    cap_zone_list INTEGER NOT NULL DEFAULT 0,
    cap_zone_create INTEGER NOT NULL DEFAULT 0,
    cap_dnssec INTEGER NOT NULL DEFAULT 0,
    cap_record_types TEXT NOT NULL DEFAULT '[]',
    is_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE backend_services (
    id INTEGER PRIMARY KEY,
    provider_id INTEGER NOT NULL REFERENCES backend_providers(id),
    service_name TEXT NOT NULL UNIQUE,
    owner_type TEXT NOT NULL,
    owner_id INTEGER REFERENCES accounts(id),
    config TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_default_for_owner INTEGER NOT NULL DEFAULT 0,
    last_test_status TEXT,
    last_test_message TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE domain_roots (
    id INTEGER PRIMARY KEY,
    backend_service_id INTEGER NOT NULL REFERENCES backend_services(id),
    root_domain TEXT NOT NULL,
    dns_zone TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'public',
    allow_apex_access INTEGER NOT NULL DEFAULT 0,
    min_subdomain_depth INTEGER NOT NULL DEFAULT 1,
    max_subdomain_depth INTEGER NOT NULL DEFAULT 1,
    allowed_record_types TEXT NOT NULL DEFAULT '[]',
    allowed_operations TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    verified_at TEXT,
    UNIQUE (backend_service_id, root_domain)
);

CREATE TABLE domain_root_grants (
    id INTEGER PRIMARY KEY,
    domain_root_id INTEGER NOT NULL REFERENCES domain_roots(id),
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    grant_type TEXT NOT NULL DEFAULT 'standard',
    overrides TEXT NOT NULL DEFAULT '{}',
    granted_by INTEGER REFERENCES accounts(id),
    expires_at TEXT,
    revoked_at TEXT
);

CREATE TABLE realms (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    realm_value TEXT NOT NULL,
    realm_type TEXT NOT NULL DEFAULT 'host',
    domain TEXT,
    domain_root_id INTEGER REFERENCES domain_roots(id),
    user_backend_id INTEGER REFERENCES backend_services(id),
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    CHECK ((domain_root_id IS NULL) <> (user_backend_id IS NULL))
);
CREATE UNIQUE INDEX idx_realms_root_claim
    ON realms (domain_root_id, realm_value) WHERE domain_root_id IS NOT NULL;
CREATE UNIQUE INDEX idx_realms_user_claim
    ON realms (user_backend_id, account_id, domain, realm_value)
    WHERE user_backend_id IS NOT NULL;

CREATE TABLE tokens (
    id INTEGER PRIMARY KEY,
    token_prefix TEXT NOT NULL UNIQUE,
    token_hash TEXT NOT NULL,
    realm_id INTEGER NOT NULL REFERENCES realms(id),
    record_types TEXT NOT NULL DEFAULT '[]',
    operations TEXT NOT NULL DEFAULT '[]',
    allowed_origins TEXT NOT NULL DEFAULT '[]',
    expires_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    email_on_use INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_tokens_prefix ON tokens (token_prefix);
CREATE INDEX idx_tokens_realm ON tokens (realm_id);

CREATE TABLE audit_records (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    token_prefix TEXT,
    account_id INTEGER,
    source_ip TEXT NOT NULL,
    operation TEXT NOT NULL,
    domain TEXT NOT NULL DEFAULT '',
    record_details TEXT,
    outcome TEXT NOT NULL,
    error_kind TEXT,
    latency_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_audit_timestamp ON audit_records (timestamp);
CREATE INDEX idx_audit_token ON audit_records (token_prefix);
";

const MIGRATION_V2: &str = "
CREATE TABLE enum_values (
    domain TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (domain, value)
);
";

/// Apply pending migrations, creating the version table on first start.
///
/// # Errors
///
/// [`Error::Migration`] when the stored version is newer than
/// [`SCHEMA_VERSION`] or a migration statement fails.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    let current: i64 = sqlx::query("SELECT version FROM schema_version")
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::Migration(e.to_string()))?
        .map_or(Ok(0), |row| row.try_get("version"))
        .map_err(|e| Error::Migration(e.to_string()))?;

    if current > SCHEMA_VERSION {
        return Err(Error::Migration(format!(
            "state file schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;

        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Migration(format!("migration v{version}: {e}")))?;
        }

        sqlx::query("DELETE FROM schema_version")
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        tracing::info!(version, "Applied schema migration");
    }

    Ok(())
}

/// Split a migration script on top-level semicolons. Good enough for this
/// schema: no triggers, no semicolons inside literals.
fn split_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn migrate_from_empty_reaches_current_version() {
        // GIVEN: an empty database file
        let (_dir, pool) = temp_pool().await;

        // WHEN: migrating
        migrate(&pool).await.unwrap();

        // THEN: the version row matches and core tables exist
        let version: i64 = sqlx::query("SELECT version FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("version")
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        sqlx::query("SELECT count(*) FROM tokens")
            .fetch_one(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (_dir, pool) = temp_pool().await;
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn newer_schema_refuses_to_open() {
        // GIVEN: a state file claiming a future schema version
        let (_dir, pool) = temp_pool().await;
        migrate(&pool).await.unwrap();
        sqlx::query("UPDATE schema_version SET version = ?1")
            .bind(SCHEMA_VERSION + 10)
            .execute(&pool)
            .await
            .unwrap();

        // WHEN/THEN: migration refuses
        let err = migrate(&pool).await.unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }

    #[tokio::test]
    async fn realm_xor_constraint_holds() {
        // GIVEN: a migrated schema
        let (_dir, pool) = temp_pool().await;
        migrate(&pool).await.unwrap();

        // WHEN: inserting a realm with both link columns set
        let res = sqlx::query(
            "INSERT INTO realms (account_id, realm_value, realm_type, domain_root_id, user_backend_id, created_at)
             VALUES (1, 'home', 'host', 1, 1, '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await;

        // THEN: the CHECK constraint rejects it
        assert!(res.is_err());
    }
}
