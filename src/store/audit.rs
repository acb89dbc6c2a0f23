//! Audit record persistence and the append-only text mirror
//!
//! Every request that passes the body-size check produces exactly one
//! audit row. Authorization-state writes persist their row in the same
//! transaction as the state change; API reads write best-effort after the
//! response. Record details are masked before they reach storage: no
//! plaintext tokens, passwords, or recovery codes, ever.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::Store;
use crate::Result;

/// Terminal classification of an audited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Request completed
    Success,
    /// Authentication or authorization refused it
    Denied,
    /// It failed for any other reason
    Error,
}

impl Outcome {
    /// Stable storage identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }

    /// Parse from the stable identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "denied" => Some(Self::Denied),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// An audit row as persisted.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    /// Monotonic id (commit order)
    pub id: i64,
    /// Event instant
    pub timestamp: DateTime<Utc>,
    /// Token prefix, never the plaintext
    pub token_prefix: Option<String>,
    /// Acting account for interactive operations
    pub account_id: Option<i64>,
    /// Caller network origin
    pub source_ip: String,
    /// Operation name (API action or admin verb)
    pub operation: String,
    /// Target domain, empty for non-zone operations
    pub domain: String,
    /// Masked request/response detail
    pub record_details: Option<Value>,
    /// Terminal classification
    pub outcome: Outcome,
    /// Error taxonomy kind for non-success outcomes
    pub error_kind: Option<String>,
    /// Wall time spent serving the request
    pub latency_ms: i64,
}

/// Input for one audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Token prefix, never the plaintext
    pub token_prefix: Option<String>,
    /// Acting account
    pub account_id: Option<i64>,
    /// Caller network origin
    pub source_ip: String,
    /// Operation name
    pub operation: String,
    /// Target domain
    pub domain: String,
    /// Detail payload; masked on insert
    pub record_details: Option<Value>,
    /// Terminal classification
    pub outcome: Outcome,
    /// Error taxonomy kind
    pub error_kind: Option<String>,
    /// Wall time in milliseconds
    pub latency_ms: i64,
}

impl AuditEntry {
    /// A successful operation.
    #[must_use]
    pub fn success(operation: impl Into<String>, source_ip: impl Into<String>) -> Self {
        Self {
            token_prefix: None,
            account_id: None,
            source_ip: source_ip.into(),
            operation: operation.into(),
            domain: String::new(),
            record_details: None,
            outcome: Outcome::Success,
            error_kind: None,
            latency_ms: 0,
        }
    }

    /// A denied operation with its taxonomy kind.
    #[must_use]
    pub fn denied(
        operation: impl Into<String>,
        source_ip: impl Into<String>,
        error_kind: impl Into<String>,
    ) -> Self {
        Self {
            outcome: Outcome::Denied,
            error_kind: Some(error_kind.into()),
            ..Self::success(operation, source_ip)
        }
    }

    /// A failed operation with its taxonomy kind.
    #[must_use]
    pub fn error(
        operation: impl Into<String>,
        source_ip: impl Into<String>,
        error_kind: impl Into<String>,
    ) -> Self {
        Self {
            outcome: Outcome::Error,
            error_kind: Some(error_kind.into()),
            ..Self::success(operation, source_ip)
        }
    }

    /// Attach the token prefix.
    #[must_use]
    pub fn token(mut self, prefix: impl Into<String>) -> Self {
        self.token_prefix = Some(prefix.into());
        self
    }

    /// Attach the acting account.
    #[must_use]
    pub fn account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Attach the target domain.
    #[must_use]
    pub fn target(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Attach detail; masked on insert.
    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.record_details = Some(details);
        self
    }

    /// Attach latency.
    #[must_use]
    pub fn latency(mut self, ms: i64) -> Self {
        self.latency_ms = ms;
        self
    }
}

/// Filters for audit queries.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AuditFilter {
    /// Restrict to one token prefix
    pub token_prefix: Option<String>,
    /// Restrict to one account
    pub account_id: Option<i64>,
    /// Restrict to one outcome
    pub outcome: Option<String>,
    /// Restrict to one target domain
    pub domain: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    /// Row cap, defaults to 100
    pub limit: Option<i64>,
}

/// Replace values of secret-bearing keys anywhere in the detail tree.
#[must_use]
pub fn mask_details(value: &Value) -> Value {
    const SECRET_KEYS: &[&str] = &[
        "password",
        "secret",
        "token",
        "apikey",
        "api_key",
        "apipassword",
        "recovery",
        "credential",
    ];
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let lowered = key.to_lowercase();
                if SECRET_KEYS.iter().any(|s| lowered.contains(s)) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), mask_details(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_details).collect()),
        other => other.clone(),
    }
}

fn from_row(row: &SqliteRow) -> Result<AuditRecord> {
    let outcome: String = row.try_get("outcome")?;
    let details: Option<String> = row.try_get("record_details")?;
    Ok(AuditRecord {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        token_prefix: row.try_get("token_prefix")?,
        account_id: row.try_get("account_id")?,
        source_ip: row.try_get("source_ip")?,
        operation: row.try_get("operation")?,
        domain: row.try_get("domain")?,
        record_details: details.and_then(|d| serde_json::from_str(&d).ok()),
        outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Error),
        error_kind: row.try_get("error_kind")?,
        latency_ms: row.try_get("latency_ms")?,
    })
}

impl Store {
    /// Insert an audit row in its own transaction (API request path).
    pub async fn insert_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let id = self.insert_audit_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Insert an audit row inside an open transaction (state-change path).
    ///
    /// The text mirror is appended immediately and is best-effort; the
    /// database row is the authoritative copy.
    pub(crate) async fn insert_audit_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &AuditEntry,
    ) -> Result<i64> {
        let timestamp = Utc::now();
        let masked = entry.record_details.as_ref().map(mask_details);
        let details_text = masked.as_ref().map(std::string::ToString::to_string);

        let id = sqlx::query(
            "INSERT INTO audit_records (timestamp, token_prefix, account_id, source_ip,
                 operation, domain, record_details, outcome, error_kind, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(timestamp)
        .bind(&entry.token_prefix)
        .bind(entry.account_id)
        .bind(&entry.source_ip)
        .bind(&entry.operation)
        .bind(&entry.domain)
        .bind(&details_text)
        .bind(entry.outcome.as_str())
        .bind(&entry.error_kind)
        .bind(entry.latency_ms)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();

        let line = serde_json::json!({
            "ts": timestamp.to_rfc3339(),
            "id": id,
            "op": entry.operation,
            "domain": entry.domain,
            "outcome": entry.outcome.as_str(),
            "error_kind": entry.error_kind,
            "token_prefix": entry.token_prefix,
            "source_ip": entry.source_ip,
            "latency_ms": entry.latency_ms,
        });
        self.mirror_line(&line.to_string());
        tracing::info!(audit = %line, "audit");

        Ok(id)
    }

    /// Query audit rows, newest first.
    pub async fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let rows = sqlx::query(
            "SELECT * FROM audit_records
             WHERE (?1 IS NULL OR token_prefix = ?1)
               AND (?2 IS NULL OR account_id = ?2)
               AND (?3 IS NULL OR outcome = ?3)
               AND (?4 IS NULL OR domain = ?4)
               AND (?5 IS NULL OR timestamp >= ?5)
               AND (?6 IS NULL OR timestamp < ?6)
             ORDER BY id DESC LIMIT ?7",
        )
        .bind(&filter.token_prefix)
        .bind(filter.account_id)
        .bind(&filter.outcome)
        .bind(&filter.domain)
        .bind(filter.since)
        .bind(filter.until)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(from_row).collect()
    }
}
