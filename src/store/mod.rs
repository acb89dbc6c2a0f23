//! Identity store — ACID persistence for accounts, realms, tokens,
//! backend services, domain roots, grants, and audit records.
//!
//! Backed by a single-file SQLite database (WAL mode). All queries are
//! explicit string SQL with bound parameters; every cross-entity access is
//! an explicit store operation, no lazy loading. Soft-delete is a boolean
//! column, and authorization reads always filter on it.
//!
//! Writes that mutate authorization state (token, realm, grant, backend,
//! root) take an [`AuditEntry`] and persist it in the same transaction.

mod account;
mod audit;
mod backend;
mod realm;
mod schema;
mod token;

pub use account::Account;
pub use audit::{AuditEntry, AuditFilter, AuditRecord, Outcome};
pub use backend::{
    BackendProvider, BackendService, DomainRootGrant, GrantType, ManagedDomainRoot, OwnerType,
    ProviderCaps, Visibility,
};
pub use realm::{NewRealm, Realm, RealmType};
pub use token::{NewToken, Operation, Token};

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::{Error, Result};

/// Handle to the identity store.
///
/// Cheap to clone: the pool is internally reference-counted and the audit
/// mirror file is shared behind a mutex.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    mirror: std::sync::Arc<Mutex<std::fs::File>>,
    mirror_path: PathBuf,
}

impl Store {
    /// Open (or create) the state file, switch it to WAL mode, and run
    /// pending schema migrations.
    ///
    /// # Errors
    ///
    /// [`Error::StorageError`] when the file cannot be opened,
    /// [`Error::Migration`] when the schema version is ahead of this binary
    /// or a migration fails.
    pub async fn open(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| Error::StorageError(format!("invalid DB_PATH: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageError(format!("open {db_path}: {e}")))?;

        schema::migrate(&pool).await?;

        let mirror_path = PathBuf::from(format!("{db_path}.audit.log"));
        let mirror = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&mirror_path)
            .map_err(|e| Error::StorageError(format!("open audit mirror: {e}")))?;

        info!(db = %db_path, "Identity store ready");
        Ok(Self {
            pool,
            mirror: std::sync::Arc::new(Mutex::new(mirror)),
            mirror_path,
        })
    }

    /// The underlying pool, for modules that compose multi-statement
    /// transactions (bootstrap).
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path of the append-only audit mirror.
    #[must_use]
    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    /// Append one structured line to the audit text mirror. Failures are
    /// logged, never propagated: the database row is the authoritative copy.
    pub(crate) fn mirror_line(&self, line: &str) {
        let mut file = self.mirror.lock();
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "audit mirror append failed");
        }
    }
}

/// Decode a JSON text column into a string vector. NULL and malformed
/// values decode to empty, which every policy reads as "inherit".
pub(crate) fn json_string_vec(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Encode a string vector as a JSON text column.
pub(crate) fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}
