//! Deterministic first-start seeding
//!
//! Runs after migrations, before the listener opens. One transaction
//! creates the enum rows, installs the built-in providers with their
//! schemas, creates the default admin (`must_change_password` set), and,
//! when `SEED_SAMPLE` signals so, a sample platform service, public
//! domain root, demo realm and read-only test token. Idempotent: the
//! presence of an admin row skips re-seeding entirely.

use chrono::Utc;
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};

use crate::backend::ProviderRegistry;
use crate::config::Config;
use crate::secrets::SecretEngine;
use crate::store::Store;
use crate::{Error, Result};

const ENUM_ROWS: &[(&str, &[&str])] = &[
    ("operation", &["read", "create", "update", "delete"]),
    ("visibility", &["public", "private", "invite"]),
    ("grant_type", &["standard", "admin", "invite_only"]),
    ("owner_type", &["platform", "user"]),
    ("test_status", &["ok", "failed"]),
];

/// Seed the state file on first start.
///
/// # Errors
///
/// Propagates storage errors; a seeding failure aborts startup.
pub async fn run(
    store: &Store,
    registry: &ProviderRegistry,
    config: &Config,
    secrets: &SecretEngine,
) -> Result<()> {
    let admins: i64 = sqlx::query("SELECT count(*) AS n FROM accounts WHERE is_admin = 1")
        .fetch_one(store.pool())
        .await?
        .try_get("n")?;
    if admins > 0 {
        info!("Bootstrap already applied, skipping");
        return Ok(());
    }

    if config.admin_password.len() < 12 {
        return Err(Error::Config(
            "ADMIN_PASSWORD must be at least 12 characters".to_string(),
        ));
    }

    // Hashing happens outside the transaction; bcrypt is slow on purpose.
    let admin_hash = secrets.hash_password(&config.admin_password).await?;
    let sample_token = if config.seed_sample {
        Some(secrets.generate_token().await?)
    } else {
        None
    };

    let now = Utc::now();
    let mut tx = store.pool().begin().await?;

    for &(domain, values) in ENUM_ROWS {
        for value in values {
            sqlx::query("INSERT OR IGNORE INTO enum_values (domain, value) VALUES (?1, ?2)")
                .bind(domain)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
    }

    for spec in registry.specs() {
        sqlx::query(
            "INSERT INTO backend_providers (provider_code, display_name, config_schema,
                 cap_zone_list, cap_zone_create, cap_dnssec, cap_record_types, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(provider_code) DO UPDATE SET
                 display_name = excluded.display_name,
                 config_schema = excluded.config_schema",
        )
        .bind(spec.code)
        .bind(spec.display_name)
        .bind(spec.config_schema.to_string())
        .bind(spec.caps.zone_list)
        .bind(spec.caps.zone_create)
        .bind(spec.caps.dnssec)
        .bind(json!(spec.caps.record_types).to_string())
        .execute(&mut *tx)
        .await?;
    }

    let admin_username = config.admin_username.to_lowercase();
    let admin_id = sqlx::query(
        "INSERT INTO accounts (username, email, password_hash, must_change_password, is_admin,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, 1, ?4, ?4)",
    )
    .bind(&admin_username)
    .bind(format!("{admin_username}@localhost"))
    .bind(&admin_hash)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let mut seeded_sample = false;
    if let Some(ref generated) = sample_token {
        match seed_sample(&mut tx, registry, admin_id, generated).await {
            Ok(()) => seeded_sample = true,
            Err(e) => warn!(error = %e, "sample seeding skipped"),
        }
    }

    sqlx::query(
        "INSERT INTO audit_records (timestamp, source_ip, operation, domain, record_details, outcome, latency_ms)
         VALUES (?1, 'local', 'bootstrap', '', ?2, 'success', 0)",
    )
    .bind(now)
    .bind(json!({"admin": admin_username, "sample": seeded_sample}).to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(admin = %admin_username, "Bootstrap complete, admin must change password on first login");
    if seeded_sample {
        if let Some(generated) = sample_token {
            // Shown once, like any other token plaintext.
            info!(token = %generated.plaintext, "Sample read-only API token created");
        }
    }
    Ok(())
}

/// Sample rows for a demo setup: a platform PowerDNS service, a public
/// root, a demo realm, and a read-only token on it.
async fn seed_sample(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    registry: &ProviderRegistry,
    admin_id: i64,
    generated: &crate::secrets::GeneratedToken,
) -> Result<()> {
    let spec = registry
        .spec("powerdns")
        .or_else(|| registry.spec("netcup"))
        .ok_or_else(|| Error::Config("no provider enabled for sample seeding".to_string()))?;

    let provider_id: i64 = sqlx::query("SELECT id FROM backend_providers WHERE provider_code = ?1")
        .bind(spec.code)
        .fetch_one(&mut **tx)
        .await?
        .try_get("id")?;

    let sample_config = match spec.code {
        "powerdns" => json!({
            "api_url": "http://127.0.0.1:8081/api/v1",
            "api_key": "sample-api-key",
        }),
        _ => json!({
            "customernumber": "000000",
            "apikey": "sample-api-key",
            "apipassword": "sample-api-password",
        }),
    };

    let now = Utc::now();
    let service_id = sqlx::query(
        "INSERT INTO backend_services (provider_id, service_name, owner_type, config, created_at)
         VALUES (?1, 'sample-platform-dns', 'platform', ?2, ?3)",
    )
    .bind(provider_id)
    .bind(sample_config.to_string())
    .bind(now)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    let root_id = sqlx::query(
        "INSERT INTO domain_roots (backend_service_id, root_domain, dns_zone, visibility,
             min_subdomain_depth, max_subdomain_depth)
         VALUES (?1, 'dyn.example.org', 'dyn.example.org', 'public', 1, 1)",
    )
    .bind(service_id)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    let realm_id = sqlx::query(
        "INSERT INTO realms (account_id, realm_value, realm_type, domain_root_id, created_at)
         VALUES (?1, 'demo', 'host', ?2, ?3)",
    )
    .bind(admin_id)
    .bind(root_id)
    .bind(now)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        "INSERT INTO tokens (token_prefix, token_hash, realm_id, operations, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&generated.prefix)
    .bind(&generated.hash)
    .bind(realm_id)
    .bind(json!(["read"]).to_string())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
