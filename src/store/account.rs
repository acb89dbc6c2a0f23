//! Account persistence and login bookkeeping

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{json_string_vec, to_json_text, Store};
use crate::{Error, Result};

/// A principal: human admin or API user.
#[derive(Debug, Clone)]
pub struct Account {
    /// Row id
    pub id: i64,
    /// Unique lowercased username, `[a-z0-9._-]{3,64}`
    pub username: String,
    /// Contact address for notifications
    pub email: String,
    /// bcrypt hash
    pub password_hash: String,
    /// When set, every operation except the change-password flow is refused
    pub must_change_password: bool,
    /// Admin flag
    pub is_admin: bool,
    /// Soft-delete flag
    pub is_active: bool,
    /// base32 TOTP secret, present whenever `totp_enabled`
    pub totp_secret: Option<String>,
    /// TOTP enrollment completed
    pub totp_enabled: bool,
    /// Last accepted TOTP step counter, for replay refusal
    pub totp_last_step: Option<i64>,
    /// bcrypt hashes of unused recovery codes
    pub recovery_codes: Vec<String>,
    /// Failures inside the current lockout window
    pub failed_login_count: i64,
    /// Start of the current lockout window
    pub failed_window_start: Option<DateTime<Utc>>,
    /// Lockout expiry; authentication is refused until this passes
    pub locked_until: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last mutation instant
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Whether the account is currently locked out.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

fn from_row(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        must_change_password: row.try_get("must_change_password")?,
        is_admin: row.try_get("is_admin")?,
        is_active: row.try_get("is_active")?,
        totp_secret: row.try_get("totp_secret")?,
        totp_enabled: row.try_get("totp_enabled")?,
        totp_last_step: row.try_get("totp_last_step")?,
        recovery_codes: json_string_vec(row.try_get("recovery_codes")?),
        failed_login_count: row.try_get("failed_login_count")?,
        failed_window_start: row.try_get("failed_window_start")?,
        locked_until: row.try_get("locked_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Username shape enforced at the store boundary.
pub(crate) fn validate_username(username: &str) -> Result<()> {
    let ok = (3..=64).contains(&username.len())
        && username
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(Error::MalformedRequest(
            "username must match [a-z0-9._-]{3,64}".to_string(),
        ))
    }
}

impl Store {
    /// Create an account. The username is stored lowercased.
    pub async fn create_account(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        is_admin: bool,
        must_change_password: bool,
    ) -> Result<Account> {
        let username = username.to_lowercase();
        validate_username(&username)?;
        let now = Utc::now();

        let id = sqlx::query(
            "INSERT INTO accounts (username, email, password_hash, must_change_password, is_admin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&username)
        .bind(email)
        .bind(password_hash)
        .bind(must_change_password)
        .bind(is_admin)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.account_by_id(id).await
    }

    /// Fetch an account by id.
    pub async fn account_by_id(&self, id: i64) -> Result<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        from_row(&row)
    }

    /// Fetch an account by username (case-insensitive via lowercasing).
    pub async fn account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE username = ?1")
            .bind(username.to_lowercase())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    /// List all accounts, admins first.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY is_admin DESC, username")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(from_row).collect()
    }

    /// Count active admin accounts.
    pub async fn active_admin_count(&self) -> Result<i64> {
        let row =
            sqlx::query("SELECT count(*) AS n FROM accounts WHERE is_admin = 1 AND is_active = 1")
                .fetch_one(self.pool())
                .await?;
        Ok(row.try_get("n")?)
    }

    /// Replace the password hash; clears `must_change_password`.
    pub async fn set_password(&self, account_id: i64, password_hash: &str) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET password_hash = ?2, must_change_password = 0, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(account_id)
        .bind(password_hash)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record one failed login. Returns the lockout expiry if this failure
    /// crossed the threshold.
    ///
    /// Failures accumulate inside a sliding window: a failure after the
    /// window expired restarts the count at 1.
    pub async fn record_login_failure(
        &self,
        account_id: i64,
        threshold: u32,
        window: Duration,
        lockout: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let account = self.account_by_id(account_id).await?;
        let now = Utc::now();

        let in_window = account
            .failed_window_start
            .is_some_and(|start| now - start < window);
        let count = if in_window {
            account.failed_login_count + 1
        } else {
            1
        };
        let window_start = if in_window {
            account.failed_window_start.unwrap_or(now)
        } else {
            now
        };

        let locked_until = if count >= i64::from(threshold) {
            Some(now + lockout)
        } else {
            None
        };

        sqlx::query(
            "UPDATE accounts SET failed_login_count = ?2, failed_window_start = ?3,
             locked_until = COALESCE(?4, locked_until), updated_at = ?5 WHERE id = ?1",
        )
        .bind(account_id)
        .bind(count)
        .bind(window_start)
        .bind(locked_until)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(locked_until)
    }

    /// Reset the failure counter after a successful password check.
    pub async fn reset_login_failures(&self, account_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET failed_login_count = 0, failed_window_start = NULL,
             locked_until = NULL, updated_at = ?2 WHERE id = ?1",
        )
        .bind(account_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store a pending TOTP secret (enrollment not yet confirmed).
    pub async fn set_totp_secret(&self, account_id: i64, secret: &str) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET totp_secret = ?2, totp_enabled = 0, updated_at = ?3 WHERE id = ?1",
        )
        .bind(account_id)
        .bind(secret)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Confirm TOTP enrollment and store the recovery-code hashes.
    pub async fn enable_totp(&self, account_id: i64, recovery_hashes: &[String]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET totp_enabled = 1, recovery_codes = ?2, updated_at = ?3
             WHERE id = ?1 AND totp_secret IS NOT NULL",
        )
        .bind(account_id)
        .bind(to_json_text(&recovery_hashes))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Conflict(
                "TOTP enrollment has no pending secret".to_string(),
            ));
        }
        Ok(())
    }

    /// Persist the last accepted TOTP step counter.
    pub async fn set_totp_last_step(&self, account_id: i64, step: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET totp_last_step = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(account_id)
            .bind(step)
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Atomically consume one recovery code hash.
    ///
    /// Compare-and-swap on the full JSON column makes consumption
    /// single-use even under concurrent attempts. Returns the number of
    /// codes remaining, or `None` when the swap lost the race.
    pub async fn consume_recovery_code(
        &self,
        account_id: i64,
        all_hashes: &[String],
        used_index: usize,
    ) -> Result<Option<usize>> {
        let remaining: Vec<&String> = all_hashes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != used_index)
            .map(|(_, h)| h)
            .collect();

        let result = sqlx::query(
            "UPDATE accounts SET recovery_codes = ?3, updated_at = ?4
             WHERE id = ?1 AND recovery_codes = ?2",
        )
        .bind(account_id)
        .bind(to_json_text(&all_hashes))
        .bind(to_json_text(&remaining))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(remaining.len()))
        } else {
            Ok(None)
        }
    }

    /// Toggle the active flag.
    ///
    /// The ≥1-active-admin invariant is part of the statement itself, not
    /// a separate read: disabling an active admin only matches when
    /// another active admin remains, so two concurrent disables cannot
    /// both observe a stale count. The same guard-in-the-write pattern as
    /// the realm claim indices.
    pub async fn set_account_active(&self, account_id: i64, active: bool) -> Result<()> {
        let result = if active {
            sqlx::query("UPDATE accounts SET is_active = 1, updated_at = ?2 WHERE id = ?1")
                .bind(account_id)
                .bind(Utc::now())
                .execute(self.pool())
                .await?
        } else {
            sqlx::query(
                "UPDATE accounts SET is_active = 0, updated_at = ?2
                 WHERE id = ?1 AND (is_admin = 0 OR is_active = 0
                    OR (SELECT count(*) FROM accounts
                        WHERE is_admin = 1 AND is_active = 1) > 1)",
            )
            .bind(account_id)
            .bind(Utc::now())
            .execute(self.pool())
            .await?
        };

        if result.rows_affected() == 0 {
            // the account exists but the guard refused, or it is gone
            self.account_by_id(account_id).await?;
            return Err(Error::Conflict(
                "cannot disable the last active admin".to_string(),
            ));
        }
        Ok(())
    }

    /// Delete an account. Refused while any owned realm, token, or backend
    /// service remains, and refused for the last active admin; the admin
    /// guard rides inside the DELETE so concurrent deletions cannot race
    /// past it.
    pub async fn delete_account(&self, account_id: i64) -> Result<()> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM realms WHERE account_id = ?1) AS realms,
                (SELECT count(*) FROM tokens t JOIN realms r ON t.realm_id = r.id
                 WHERE r.account_id = ?1) AS tokens,
                (SELECT count(*) FROM backend_services WHERE owner_id = ?1) AS services",
        )
        .bind(account_id)
        .fetch_one(self.pool())
        .await?;
        let realms: i64 = row.try_get("realms")?;
        let tokens: i64 = row.try_get("tokens")?;
        let services: i64 = row.try_get("services")?;
        if realms + tokens + services > 0 {
            return Err(Error::Conflict(format!(
                "account still owns {realms} realm(s), {tokens} token(s), {services} service(s)"
            )));
        }

        let result = sqlx::query(
            "DELETE FROM accounts
             WHERE id = ?1 AND (is_admin = 0 OR is_active = 0
                OR (SELECT count(*) FROM accounts
                    WHERE is_admin = 1 AND is_active = 1 AND id <> ?1) > 0)",
        )
        .bind(account_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            self.account_by_id(account_id).await?;
            return Err(Error::Conflict(
                "cannot delete the last active admin".to_string(),
            ));
        }
        Ok(())
    }
}
