//! Configuration management
//!
//! All configuration comes from the process environment (optionally loaded
//! from a `.env` file first). Policy is fail-fast: a missing required
//! variable aborts startup with a message naming the variable, exit code 1.

use figment::{Figment, providers::Env};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum bcrypt cost accepted for password and token hashing.
pub const MIN_BCRYPT_COST: u32 = 12;

/// Minimum entropy for the session HMAC key, in bytes.
pub const MIN_SECRET_KEY_BYTES: usize = 32;

/// `COOKIE_SECURE` policy for the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CookieSecure {
    /// Mark the cookie `Secure` when the request chain indicates HTTPS
    /// (`X-Forwarded-Proto: https` or direct TLS).
    #[default]
    Auto,
    /// Always mark the cookie `Secure`.
    True,
    /// Never mark the cookie `Secure`.
    False,
}

/// Main configuration
///
/// Field names map 1:1 to environment variables (upper-cased): `db_path`
/// is `DB_PATH`, `rate_limit_per_min` is `RATE_LIMIT_PER_MIN`, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Location of the SQLite state file (`DB_PATH`, required)
    pub db_path: String,
    /// HMAC key for session cookies (`SECRET_KEY`, required, >= 32 bytes)
    pub secret_key: String,
    /// Seed admin username (`ADMIN_USERNAME`, required)
    pub admin_username: String,
    /// Seed admin password (`ADMIN_PASSWORD`, required)
    pub admin_password: String,

    /// Listening address (`BIND_ADDR`)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Listening port (`BIND_PORT`)
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Per-request deadline in milliseconds (`DEADLINE_MS_API`)
    #[serde(default = "default_deadline_api")]
    pub deadline_ms_api: u64,
    /// Per-upstream-call deadline in milliseconds (`DEADLINE_MS_BACKEND`)
    #[serde(default = "default_deadline_backend")]
    pub deadline_ms_backend: u64,

    /// Maximum request body size in bytes (`MAX_BODY_BYTES`)
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
    /// Maximum records per `updateDnsRecords` request (`MAX_RECORDS_PER_REQUEST`)
    #[serde(default = "default_max_records")]
    pub max_records_per_request: usize,

    /// Per-IP requests per minute (`RATE_LIMIT_PER_MIN`)
    #[serde(default = "default_rate_min")]
    pub rate_limit_per_min: u32,
    /// Per-IP requests per hour (`RATE_LIMIT_PER_HOUR`)
    #[serde(default = "default_rate_hour")]
    pub rate_limit_per_hour: u32,

    /// Session idle timeout in seconds (`SESSION_IDLE_SEC`)
    #[serde(default = "default_session_idle")]
    pub session_idle_sec: u64,
    /// Session absolute lifetime in seconds (`SESSION_ABSOLUTE_SEC`)
    #[serde(default = "default_session_absolute")]
    pub session_absolute_sec: u64,
    /// Session cookie `Secure` policy (`COOKIE_SECURE`)
    #[serde(default)]
    pub cookie_secure: CookieSecure,

    /// Failed logins before lockout (`LOGIN_LOCKOUT_FAILS`)
    #[serde(default = "default_lockout_fails")]
    pub login_lockout_fails: u32,
    /// Window in which failures accumulate, seconds (`LOGIN_LOCKOUT_WINDOW_SEC`)
    #[serde(default = "default_lockout_window")]
    pub login_lockout_window_sec: u64,
    /// Lockout duration in seconds (`LOGIN_LOCKOUT_DURATION_SEC`)
    #[serde(default = "default_lockout_duration")]
    pub login_lockout_duration_sec: u64,

    /// bcrypt cost for passwords, tokens, recovery codes (`BCRYPT_COST`)
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Create the sample backend service, domain root and read-only token
    /// on first start (`SEED_SAMPLE`)
    #[serde(default)]
    pub seed_sample: bool,

    /// Netcup provider toggle (`PROVIDER_NETCUP_ENABLED`)
    #[serde(default = "default_true")]
    pub provider_netcup_enabled: bool,
    /// PowerDNS provider toggle (`PROVIDER_POWERDNS_ENABLED`)
    #[serde(default = "default_true")]
    pub provider_powerdns_enabled: bool,

    /// SMTP relay host (`SMTP_HOST`); absent disables notifications
    #[serde(default)]
    pub smtp_host: Option<String>,
    /// SMTP relay port (`SMTP_PORT`)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username (`SMTP_USERNAME`)
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// SMTP password (`SMTP_PASSWORD`)
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// Sender address (`SMTP_FROM`)
    #[serde(default)]
    pub smtp_from: Option<String>,
    /// Admin security-event recipient (`SMTP_ADMIN_TO`)
    #[serde(default)]
    pub smtp_admin_to: Option<String>,
    /// Delay between outgoing messages in milliseconds (`SMTP_SEND_DELAY_MS`)
    #[serde(default = "default_smtp_delay")]
    pub smtp_send_delay_ms: u64,
    /// SMTP worker count, clamped to 1..=4 (`SMTP_WORKERS`)
    #[serde(default = "default_smtp_workers")]
    pub smtp_workers: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_port() -> u16 {
    8053
}
fn default_deadline_api() -> u64 {
    10_000
}
fn default_deadline_backend() -> u64 {
    8_000
}
fn default_max_body() -> usize {
    65_536
}
fn default_max_records() -> usize {
    50
}
fn default_rate_min() -> u32 {
    50
}
fn default_rate_hour() -> u32 {
    1_000
}
fn default_session_idle() -> u64 {
    1_800
}
fn default_session_absolute() -> u64 {
    43_200
}
fn default_lockout_fails() -> u32 {
    5
}
fn default_lockout_window() -> u64 {
    900
}
fn default_lockout_duration() -> u64 {
    900
}
fn default_bcrypt_cost() -> u32 {
    MIN_BCRYPT_COST
}
fn default_true() -> bool {
    true
}
fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_delay() -> u64 {
    200
}
fn default_smtp_workers() -> usize {
    2
}

/// Assembled SMTP transport settings, present only when `SMTP_HOST` is set.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay hostname
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Optional credentials
    pub credentials: Option<(String, String)>,
    /// Sender address
    pub from: String,
    /// Admin security-event recipient
    pub admin_to: Option<String>,
    /// Per-message send delay
    pub send_delay_ms: u64,
    /// Worker count (1..=4)
    pub workers: usize,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the missing or invalid variable.
    pub fn load() -> Result<Self> {
        let figment = Figment::new().merge(Env::raw());

        let config: Self = figment.extract().map_err(|e| {
            // figment reports serde field names; surface the env var name
            let msg = e.to_string();
            let named = msg
                .split_whitespace()
                .find(|w| w.starts_with('`'))
                .map(|w| w.trim_matches(['`', ',']).to_uppercase());
            match named {
                Some(var) => Error::Config(format!("missing or invalid environment variable {var}")),
                None => Error::Config(msg),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on violation.
    pub fn validate(&self) -> Result<()> {
        if self.secret_key.len() < MIN_SECRET_KEY_BYTES {
            return Err(Error::Config(format!(
                "SECRET_KEY must be at least {MIN_SECRET_KEY_BYTES} bytes"
            )));
        }
        if self.bcrypt_cost < MIN_BCRYPT_COST {
            return Err(Error::Config(format!(
                "BCRYPT_COST must be at least {MIN_BCRYPT_COST}"
            )));
        }
        if self.max_records_per_request == 0 {
            return Err(Error::Config(
                "MAX_RECORDS_PER_REQUEST must be positive".to_string(),
            ));
        }
        if self.rate_limit_per_min == 0 || self.rate_limit_per_hour == 0 {
            return Err(Error::Config(
                "rate limits must be positive".to_string(),
            ));
        }
        if self.smtp_host.is_some() && self.smtp_from.is_none() {
            return Err(Error::Config(
                "SMTP_FROM is required when SMTP_HOST is set".to_string(),
            ));
        }
        Ok(())
    }

    /// SMTP settings, or `None` when notifications are disabled.
    #[must_use]
    pub fn smtp(&self) -> Option<SmtpConfig> {
        let host = self.smtp_host.clone()?;
        let from = self.smtp_from.clone()?;
        let credentials = match (&self.smtp_username, &self.smtp_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Some(SmtpConfig {
            host,
            port: self.smtp_port,
            credentials,
            from,
            admin_to: self.smtp_admin_to.clone(),
            send_delay_ms: self.smtp_send_delay_ms,
            workers: self.smtp_workers.clamp(1, 4),
        })
    }
}
