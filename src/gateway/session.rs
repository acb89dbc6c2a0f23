//! Interactive sessions and the login / 2FA state machine
//!
//! Login walks `anonymous → password_verified → password_change_required?
//! → totp_required? → active`. The session cookie carries an opaque
//! 192-bit id signed with the `SECRET_KEY` HMAC; the server-side store is
//! the only session state. The cookie exists from the first successful
//! password check so the multi-step flow has a correlator, but a session
//! parked before `active` is refused by every endpoint except the one
//! that advances its stage — it carries no authority. Cookies are
//! `HttpOnly; SameSite=Lax` and `Secure` when the request chain indicates
//! HTTPS. Every interactive write requires the per-session CSRF token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, KeyInit, Mac};
use rand::RngExt;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use super::{App, HandlerResult};
use crate::config::CookieSecure;
use crate::error::DenyReason;
use crate::notify::Notification;
use crate::secrets;
use crate::store::AuditEntry;
use crate::{Error, Result};

const COOKIE_NAME: &str = "gw_session";

/// Where a session sits in the login state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    /// Password accepted, but the account must set a new one first
    PasswordChangeRequired,
    /// Password accepted, second factor outstanding
    TotpRequired,
    /// Fully authenticated
    Active,
}

/// One server-side session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque 192-bit id (cookie value carries it signed)
    pub id: String,
    /// Authenticated account
    pub account_id: i64,
    /// Per-session CSRF token
    pub csrf: String,
    /// State-machine position
    pub stage: SessionStage,
    created: Instant,
    last_seen: Instant,
}

struct Inner {
    by_id: DashMap<String, Session>,
    key: Vec<u8>,
    idle: Duration,
    absolute: Duration,
}

/// Session store with HMAC-signed cookie codec and expiry reaping.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Create a store keyed with the configured secret.
    #[must_use]
    pub fn new(key: &[u8], idle: Duration, absolute: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                by_id: DashMap::new(),
                key: key.to_vec(),
                idle,
                absolute,
            }),
        }
    }

    /// Open a session; returns the signed cookie value.
    pub fn create(&self, account_id: i64, stage: SessionStage) -> (Session, String) {
        let id = random_token(24);
        let csrf = random_token(24);
        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            account_id,
            csrf,
            stage,
            created: now,
            last_seen: now,
        };
        self.inner.by_id.insert(id.clone(), session.clone());
        (session, self.sign(&id))
    }

    /// Resolve a signed cookie value to its live session, refreshing the
    /// idle timer. Expired sessions evict lazily.
    pub fn fetch(&self, cookie_value: &str) -> Option<Session> {
        let id = self.verify(cookie_value)?;
        let mut entry = self.inner.by_id.get_mut(&id)?;
        let now = Instant::now();
        if now.duration_since(entry.last_seen) > self.inner.idle
            || now.duration_since(entry.created) > self.inner.absolute
        {
            drop(entry);
            self.inner.by_id.remove(&id);
            debug!("lazy-evicted expired session");
            return None;
        }
        entry.last_seen = now;
        Some(entry.clone())
    }

    /// Advance the state machine.
    pub fn set_stage(&self, session_id: &str, stage: SessionStage) {
        if let Some(mut entry) = self.inner.by_id.get_mut(session_id) {
            entry.stage = stage;
        }
    }

    /// Terminate a session.
    pub fn remove(&self, session_id: &str) {
        self.inner.by_id.remove(session_id);
    }

    /// Remove every expired session. Called by the background reaper.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .inner
            .by_id
            .iter()
            .filter(|entry| {
                now.duration_since(entry.last_seen) > self.inner.idle
                    || now.duration_since(entry.created) > self.inner.absolute
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.inner.by_id.remove(&id);
        }
        count
    }

    fn sign(&self, id: &str) -> String {
        format!("{id}.{}", self.mac(id))
    }

    fn verify(&self, cookie_value: &str) -> Option<String> {
        let (id, sig) = cookie_value.split_once('.')?;
        if secrets::constant_time_str_eq(&self.mac(id), sig) {
            Some(id.to_string())
        } else {
            None
        }
    }

    fn mac(&self, id: &str) -> String {
        let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(&self.inner.key)
            .expect("hmac accepts any key length");
        mac.update(id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(&mut buf[..]);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Spawn a background task that reaps expired sessions every `interval`.
pub fn spawn_reaper(
    store: SessionStore,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

fn cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == COOKIE_NAME).then(|| value.to_string())
    })
}

/// Resolve the caller's session at any stage.
pub(super) fn current_session(app: &App, headers: &HeaderMap) -> Result<Session> {
    cookie_from_headers(headers)
        .and_then(|value| app.sessions.fetch(&value))
        .ok_or(Error::InvalidToken)
}

/// Resolve the caller's session, requiring the `active` stage.
pub(super) fn active_session(app: &App, headers: &HeaderMap) -> Result<Session> {
    let session = current_session(app, headers)?;
    match session.stage {
        SessionStage::Active => Ok(session),
        SessionStage::PasswordChangeRequired | SessionStage::TotpRequired => {
            Err(Error::PermissionDenied(DenyReason::OperationNotAllowed))
        }
    }
}

/// Enforce the CSRF header on an interactive write.
pub(super) fn check_csrf(session: &Session, headers: &HeaderMap) -> Result<()> {
    let presented = headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secrets::constant_time_str_eq(&session.csrf, presented) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(DenyReason::OperationNotAllowed))
    }
}

fn https_indicated(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

fn set_cookie_header(app: &App, headers: &HeaderMap, value: &str, expire: bool) -> String {
    let secure = match app.config.cookie_secure {
        CookieSecure::True => true,
        CookieSecure::False => false,
        CookieSecure::Auto => https_indicated(headers),
    };
    let mut cookie = format!("{COOKIE_NAME}={value}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    if expire {
        cookie.push_str("; Max-Age=0");
    }
    cookie
}

fn with_cookie(body: serde_json::Value, cookie: String) -> Response {
    let mut response = Json(body).into_response();
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert("set-cookie", value);
    }
    response
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub(super) struct LoginBody {
    username: String,
    password: String,
}

/// `POST /session/login`
pub(super) async fn login(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> HandlerResult<Response> {
    let source_ip = addr.ip().to_string();
    let account = app
        .store
        .account_by_username(&body.username)
        .await?
        .ok_or(Error::InvalidToken)?;

    if !account.is_active {
        audit_login(&app, &source_ip, account.id, "account_disabled").await;
        return Err(Error::AccountDisabled.into());
    }
    if account.is_locked(Utc::now()) {
        audit_login(&app, &source_ip, account.id, "account_locked").await;
        return Err(Error::AccountLocked.into());
    }

    let verified = app
        .secrets
        .verify_password(&body.password, &account.password_hash)
        .await?;
    if !verified {
        let locked = app
            .store
            .record_login_failure(
                account.id,
                app.config.login_lockout_fails,
                chrono::Duration::seconds(app.config.login_lockout_window_sec as i64),
                chrono::Duration::seconds(app.config.login_lockout_duration_sec as i64),
            )
            .await?;
        if let Some(until) = locked {
            warn!(account = account.id, %until, "account locked out");
            app.notifier.enqueue(Notification::Security {
                subject: format!("account '{}' locked out", account.username),
                body: format!(
                    "Account '{}' was locked until {until} after repeated failed logins from {source_ip}.",
                    account.username
                ),
            });
        }
        audit_login(&app, &source_ip, account.id, "invalid_token").await;
        return Err(Error::InvalidToken.into());
    }

    app.store.reset_login_failures(account.id).await?;

    let stage = if account.must_change_password {
        SessionStage::PasswordChangeRequired
    } else if account.totp_enabled {
        SessionStage::TotpRequired
    } else {
        SessionStage::Active
    };
    let (session, cookie_value) = app.sessions.create(account.id, stage);

    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("login", &source_ip)
                .account(account.id)
                .details(json!({"stage": stage})),
        )
        .await;

    let cookie = set_cookie_header(&app, &headers, &cookie_value, false);
    Ok(with_cookie(
        json!({"status": "success", "stage": stage, "csrf_token": session.csrf}),
        cookie,
    ))
}

/// `POST /session/logout`
pub(super) async fn logout(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Response> {
    if let Ok(session) = current_session(&app, &headers) {
        check_csrf(&session, &headers)?;
        app.sessions.remove(&session.id);
    }
    let cookie = set_cookie_header(&app, &headers, "", true);
    Ok(with_cookie(json!({"status": "success"}), cookie))
}

#[derive(serde::Deserialize)]
pub(super) struct PasswordBody {
    current_password: String,
    new_password: String,
}

/// `POST /session/password` — the one operation allowed while
/// `must_change_password` is set.
pub(super) async fn change_password(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PasswordBody>,
) -> HandlerResult<Json<serde_json::Value>> {
    let session = current_session(&app, &headers)?;
    check_csrf(&session, &headers)?;

    let account = app.store.account_by_id(session.account_id).await?;
    let verified = app
        .secrets
        .verify_password(&body.current_password, &account.password_hash)
        .await?;
    if !verified {
        return Err(Error::InvalidToken.into());
    }
    if body.new_password.len() < 12 {
        return Err(Error::MalformedRequest(
            "new password must be at least 12 characters".to_string(),
        )
        .into());
    }

    let hash = app.secrets.hash_password(&body.new_password).await?;
    app.store.set_password(account.id, &hash).await?;

    // must_change_password cleared; the TOTP gate still applies
    let next = if session.stage == SessionStage::PasswordChangeRequired {
        if account.totp_enabled {
            SessionStage::TotpRequired
        } else {
            SessionStage::Active
        }
    } else {
        session.stage
    };
    app.sessions.set_stage(&session.id, next);

    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("change_password", addr.ip().to_string()).account(account.id),
        )
        .await;

    Ok(Json(json!({"status": "success", "stage": next})))
}

/// `POST /session/totp/setup` — begin enrollment; returns the secret and
/// provisioning URI exactly once.
pub(super) async fn totp_setup(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<serde_json::Value>> {
    let session = active_session(&app, &headers)?;
    check_csrf(&session, &headers)?;

    let account = app.store.account_by_id(session.account_id).await?;
    let secret = secrets::generate_totp_secret();
    app.store.set_totp_secret(account.id, &secret).await?;

    let uri = secrets::totp_provisioning_uri(&secret, &account.username, "dns-gateway");
    Ok(Json(
        json!({"status": "success", "secret": secret, "otpauth_uri": uri}),
    ))
}

#[derive(serde::Deserialize)]
pub(super) struct TotpCodeBody {
    code: String,
}

/// `POST /session/totp/enable` — confirm enrollment with a first valid
/// code; returns the recovery codes exactly once.
pub(super) async fn totp_enable(
    State(app): State<App>,
    headers: HeaderMap,
    Json(body): Json<TotpCodeBody>,
) -> HandlerResult<Json<serde_json::Value>> {
    let session = active_session(&app, &headers)?;
    check_csrf(&session, &headers)?;

    let account = app.store.account_by_id(session.account_id).await?;
    let secret = account
        .totp_secret
        .as_deref()
        .ok_or_else(|| Error::Conflict("no pending TOTP enrollment".to_string()))?;

    let now = Utc::now().timestamp().max(0) as u64;
    let step = secrets::totp_verify(secret, &body.code, now, None)?
        .ok_or(Error::InvalidToken)?;

    let (codes, hashes) = app.secrets.generate_recovery_codes().await?;
    app.store.enable_totp(account.id, &hashes).await?;
    app.store.set_totp_last_step(account.id, step as i64).await?;

    Ok(Json(
        json!({"status": "success", "recovery_codes": codes}),
    ))
}

#[derive(serde::Deserialize)]
pub(super) struct TotpVerifyBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    recovery_code: Option<String>,
}

/// `POST /session/totp/verify` — second factor: a TOTP code or a
/// single-use recovery code. Failures feed the login lockout counter.
pub(super) async fn totp_verify(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TotpVerifyBody>,
) -> HandlerResult<Json<serde_json::Value>> {
    let session = current_session(&app, &headers)?;
    if session.stage != SessionStage::TotpRequired {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let account = app.store.account_by_id(session.account_id).await?;
    let source_ip = addr.ip().to_string();

    let accepted = match (&body.code, &body.recovery_code) {
        (Some(code), _) => {
            let secret = account
                .totp_secret
                .as_deref()
                .ok_or_else(|| Error::Internal("totp enabled without secret".to_string()))?;
            let now = Utc::now().timestamp().max(0) as u64;
            match secrets::totp_verify(secret, code, now, account.totp_last_step.map(|s| s as u64))? {
                Some(step) => {
                    app.store.set_totp_last_step(account.id, step as i64).await?;
                    true
                }
                None => false,
            }
        }
        (None, Some(recovery)) => {
            consume_recovery(&app, account.id, &account.recovery_codes, recovery, &source_ip)
                .await?
        }
        (None, None) => {
            return Err(Error::MalformedRequest(
                "code or recovery_code is required".to_string(),
            )
            .into());
        }
    };

    if !accepted {
        let locked = app
            .store
            .record_login_failure(
                account.id,
                app.config.login_lockout_fails,
                chrono::Duration::seconds(app.config.login_lockout_window_sec as i64),
                chrono::Duration::seconds(app.config.login_lockout_duration_sec as i64),
            )
            .await?;
        if locked.is_some() {
            app.sessions.remove(&session.id);
        }
        audit_login(&app, &source_ip, account.id, "invalid_token").await;
        return Err(Error::InvalidToken.into());
    }

    app.store.reset_login_failures(account.id).await?;
    app.sessions.set_stage(&session.id, SessionStage::Active);

    let _ = app
        .store
        .insert_audit(&AuditEntry::success("totp_verify", &source_ip).account(account.id))
        .await;

    Ok(Json(json!({"status": "success", "stage": SessionStage::Active})))
}

/// Check a presented recovery code against the stored hashes and consume
/// it atomically. Running out of codes raises an admin security event.
async fn consume_recovery(
    app: &App,
    account_id: i64,
    hashes: &[String],
    presented: &str,
    source_ip: &str,
) -> Result<bool> {
    for (index, hash) in hashes.iter().enumerate() {
        if app.secrets.verify_password(presented, hash).await? {
            let Some(remaining) = app
                .store
                .consume_recovery_code(account_id, hashes, index)
                .await?
            else {
                // lost the compare-and-swap race; treat as spent
                return Ok(false);
            };
            let _ = app
                .store
                .insert_audit(
                    &AuditEntry::success("recovery_code_used", source_ip).account(account_id),
                )
                .await;
            if remaining == 0 {
                warn!(account = account_id, "recovery codes exhausted");
                app.notifier.enqueue(Notification::Security {
                    subject: format!("recovery codes exhausted for account {account_id}"),
                    body: format!(
                        "Account {account_id} used its final recovery code from {source_ip}."
                    ),
                });
            }
            return Ok(true);
        }
    }
    Ok(false)
}

async fn audit_login(app: &App, source_ip: &str, account_id: i64, kind: &str) {
    let _ = app
        .store
        .insert_audit(&AuditEntry::denied("login", source_ip, kind).account(account_id))
        .await;
}
