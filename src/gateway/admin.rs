//! Admin and self-service CRUD surface
//!
//! JSON endpoints consumed by the external UI: accounts, realms, tokens,
//! backend services, domain roots, grants, and audit queries. Reads need
//! an active session; writes additionally need the session's CSRF token.
//! Admin-only routes check the account flag. Every authorization-state
//! write carries its audit entry into the store so row and state commit
//! together.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::session::{active_session, check_csrf, Session};
use super::{App, HandlerResult};
use crate::error::DenyReason;
use crate::resolver::validate_realm_value;
use crate::store::{
    Account, AuditEntry, AuditFilter, GrantType, NewRealm, NewToken, Operation, OwnerType,
    RealmType, Visibility,
};
use crate::{Error, Result};

async fn admin_session(app: &App, headers: &HeaderMap) -> Result<(Session, Account)> {
    let session = active_session(app, headers)?;
    let account = app.store.account_by_id(session.account_id).await?;
    if !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed));
    }
    Ok((session, account))
}

async fn user_session(app: &App, headers: &HeaderMap) -> Result<(Session, Account)> {
    let session = active_session(app, headers)?;
    let account = app.store.account_by_id(session.account_id).await?;
    if account.must_change_password {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed));
    }
    Ok((session, account))
}

fn account_to_json(account: &Account) -> Value {
    json!({
        "id": account.id,
        "username": account.username,
        "email": account.email,
        "is_admin": account.is_admin,
        "is_active": account.is_active,
        "must_change_password": account.must_change_password,
        "totp_enabled": account.totp_enabled,
        "created_at": account.created_at,
    })
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// `GET /admin/accounts`
pub(super) async fn list_accounts(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let _ = admin_session(&app, &headers).await?;
    let accounts = app.store.list_accounts().await?;
    Ok(Json(json!({
        "status": "success",
        "accounts": accounts.iter().map(account_to_json).collect::<Vec<_>>(),
    })))
}

#[derive(serde::Deserialize)]
pub(super) struct CreateAccountBody {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

/// `POST /admin/accounts`
pub(super) async fn create_account(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountBody>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let hash = app.secrets.hash_password(&body.password).await?;
    let account = app
        .store
        .create_account(&body.username, &body.email, &hash, body.is_admin, true)
        .await?;
    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("account_create", addr.ip().to_string())
                .account(admin.id)
                .details(json!({"username": account.username, "is_admin": account.is_admin})),
        )
        .await;
    Ok(Json(json!({"status": "success", "account": account_to_json(&account)})))
}

#[derive(serde::Deserialize)]
pub(super) struct PatchAccountBody {
    is_active: bool,
}

/// `PATCH /admin/accounts/{id}` — active toggle; the store's guarded
/// write refuses to disable the last active admin.
pub(super) async fn patch_account(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(account_id): Path<i64>,
    Json(body): Json<PatchAccountBody>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    app.store.set_account_active(account_id, body.is_active).await?;
    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("account_set_active", addr.ip().to_string())
                .account(admin.id)
                .details(json!({"target": account_id, "is_active": body.is_active})),
        )
        .await;
    Ok(Json(json!({"status": "success"})))
}

/// `DELETE /admin/accounts/{id}` — the store's guarded delete refuses
/// the last active admin.
pub(super) async fn delete_account(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(account_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    app.store.delete_account(account_id).await?;
    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("account_delete", addr.ip().to_string())
                .account(admin.id)
                .details(json!({"target": account_id})),
        )
        .await;
    Ok(Json(json!({"status": "success"})))
}

// ---------------------------------------------------------------------------
// Realms
// ---------------------------------------------------------------------------

/// `GET /admin/realms` — the caller's active realms.
pub(super) async fn list_realms(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let (_, account) = user_session(&app, &headers).await?;
    let realms = app.store.realms_for_account(account.id).await?;
    let out: Vec<Value> = realms
        .iter()
        .map(|realm| {
            json!({
                "id": realm.id,
                "realm_value": realm.realm_value,
                "realm_type": realm.realm_type.as_str(),
                "domain": realm.domain,
                "domain_root_id": realm.domain_root_id,
                "user_backend_id": realm.user_backend_id,
                "created_at": realm.created_at,
            })
        })
        .collect();
    Ok(Json(json!({"status": "success", "realms": out})))
}

#[derive(serde::Deserialize)]
pub(super) struct ClaimRealmBody {
    realm_value: String,
    #[serde(default)]
    realm_type: Option<String>,
    #[serde(default)]
    domain_root_id: Option<i64>,
    #[serde(default)]
    user_backend_id: Option<i64>,
    #[serde(default)]
    domain: Option<String>,
}

/// `POST /admin/realms` — self-service claim. Honors root visibility and
/// grants; the unique index makes a concurrent double-claim a `conflict`
/// and the first committer wins.
pub(super) async fn claim_realm(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ClaimRealmBody>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let realm_type = match body.realm_type.as_deref() {
        None => RealmType::Host,
        Some(raw) => RealmType::parse(raw)
            .ok_or_else(|| Error::MalformedRequest(format!("unknown realm_type '{raw}'")))?,
    };
    let realm_value = body.realm_value.trim_end_matches('.').to_ascii_lowercase();

    let new = match (body.domain_root_id, body.user_backend_id) {
        (Some(root_id), None) => {
            let root = app.store.domain_root_by_id(root_id).await?;
            if !root.is_active {
                return Err(Error::NotFound(format!("domain root {root_id}")).into());
            }
            let granted = app
                .store
                .grants_for_account(root_id, account.id)
                .await?
                .iter()
                .any(|g| g.is_live(Utc::now()));
            let allowed = match root.visibility {
                Visibility::Public => true,
                Visibility::Private => account.is_admin || granted,
                Visibility::Invite => granted,
            };
            if !allowed {
                return Err(Error::PermissionDenied(DenyReason::RootPolicyRefused).into());
            }
            validate_realm_value(&realm_value, &root)?;
            NewRealm {
                account_id: account.id,
                realm_value,
                realm_type,
                domain: None,
                domain_root_id: Some(root_id),
                user_backend_id: None,
            }
        }
        (None, Some(service_id)) => {
            let service = app.store.backend_service_by_id(service_id).await?;
            if service.owner_type != OwnerType::User || service.owner_id != Some(account.id) {
                return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
            }
            let domain = body
                .domain
                .as_deref()
                .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .ok_or_else(|| {
                    Error::MalformedRequest("domain is required for user-backend realms".to_string())
                })?;
            for label in realm_value.split('.').filter(|l| !l.is_empty()) {
                if !crate::resolver::is_valid_label(label) {
                    return Err(Error::MalformedRequest(format!("invalid label '{label}'")).into());
                }
            }
            NewRealm {
                account_id: account.id,
                realm_value,
                realm_type,
                domain: Some(domain),
                domain_root_id: None,
                user_backend_id: Some(service_id),
            }
        }
        _ => {
            return Err(Error::MalformedRequest(
                "exactly one of domain_root_id and user_backend_id is required".to_string(),
            )
            .into());
        }
    };

    let audit = AuditEntry::success("realm_claim", addr.ip().to_string())
        .account(account.id)
        .details(json!({"realm_value": new.realm_value, "domain_root_id": new.domain_root_id}));
    let realm = app.store.claim_realm(&new, audit).await?;
    Ok(Json(json!({"status": "success", "realm": {"id": realm.id}})))
}

/// `DELETE /admin/realms/{id}` — cascades to the realm's tokens.
pub(super) async fn delete_realm(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(realm_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let realm = app.store.realm_by_id(realm_id).await?;
    if realm.account_id != account.id && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let audit = AuditEntry::success("realm_delete", addr.ip().to_string())
        .account(account.id)
        .details(json!({"realm_id": realm_id}));
    app.store.delete_realm(realm_id, audit).await?;
    Ok(Json(json!({"status": "success"})))
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub(super) struct CreateTokenBody {
    realm_id: i64,
    #[serde(default)]
    record_types: Vec<String>,
    #[serde(default)]
    operations: Vec<String>,
    #[serde(default)]
    allowed_origins: Vec<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    email_on_use: bool,
}

/// `POST /admin/tokens` — the plaintext is returned exactly once.
pub(super) async fn create_token(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenBody>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let realm = app.store.realm_by_id(body.realm_id).await?;
    if realm.account_id != account.id && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let operations: Vec<Operation> = body
        .operations
        .iter()
        .map(|raw| {
            Operation::parse(raw)
                .ok_or_else(|| Error::MalformedRequest(format!("unknown operation '{raw}'")))
        })
        .collect::<Result<_>>()?;

    let generated = app.secrets.generate_token().await?;
    let new = NewToken {
        realm_id: realm.id,
        record_types: body.record_types,
        operations,
        allowed_origins: body.allowed_origins,
        expires_at: body.expires_at,
        email_on_use: body.email_on_use,
    };
    let audit = AuditEntry::success("token_create", addr.ip().to_string())
        .account(account.id)
        .token(generated.prefix.clone())
        .details(json!({"realm_id": realm.id}));
    let token = app
        .store
        .create_token(&new, &generated.prefix, &generated.hash, audit)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "token": generated.plaintext,
        "token_prefix": token.token_prefix,
        "token_id": token.id,
    })))
}

/// `GET /admin/realms/{id}/tokens`
pub(super) async fn list_tokens(
    State(app): State<App>,
    headers: HeaderMap,
    Path(realm_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (_, account) = user_session(&app, &headers).await?;
    let realm = app.store.realm_by_id(realm_id).await?;
    if realm.account_id != account.id && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let tokens = app.store.tokens_for_realm(realm_id).await?;
    let out: Vec<Value> = tokens
        .iter()
        .map(|token| {
            json!({
                "id": token.id,
                "token_prefix": token.token_prefix,
                "record_types": token.record_types,
                "operations": token.operations.iter().map(|o| o.as_str()).collect::<Vec<_>>(),
                "allowed_origins": token.allowed_origins,
                "expires_at": token.expires_at,
                "is_active": token.is_active,
                "email_on_use": token.email_on_use,
                "last_used_at": token.last_used_at,
            })
        })
        .collect();
    Ok(Json(json!({"status": "success", "tokens": out})))
}

/// `DELETE /admin/tokens/{id}` — revoke.
pub(super) async fn revoke_token(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(token_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let token = app.store.token_by_id(token_id).await?;
    let realm = app.store.realm_by_id(token.realm_id).await?;
    if realm.account_id != account.id && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let audit = AuditEntry::success("token_revoke", addr.ip().to_string())
        .account(account.id)
        .token(token.token_prefix.clone());
    app.store.revoke_token(token_id, audit).await?;
    Ok(Json(json!({"status": "success"})))
}

// ---------------------------------------------------------------------------
// Backend services & providers
// ---------------------------------------------------------------------------

/// `GET /admin/providers`
pub(super) async fn list_providers(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let _ = user_session(&app, &headers).await?;
    let providers = app.store.list_providers().await?;
    let out: Vec<Value> = providers
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "provider_code": p.provider_code,
                "display_name": p.display_name,
                "config_schema": p.config_schema,
                "caps": p.caps,
                "is_enabled": p.is_enabled,
            })
        })
        .collect();
    Ok(Json(json!({"status": "success", "providers": out})))
}

#[derive(serde::Deserialize)]
pub(super) struct CreateServiceBody {
    provider_code: String,
    service_name: String,
    owner_type: String,
    config: Value,
    #[serde(default)]
    is_default_for_owner: bool,
}

/// `POST /admin/services` — platform services are admin-only; user
/// services belong to the caller. The config is schema-validated first.
pub(super) async fn create_service(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateServiceBody>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let owner_type = OwnerType::parse(&body.owner_type)
        .ok_or_else(|| Error::MalformedRequest(format!("unknown owner_type '{}'", body.owner_type)))?;
    if owner_type == OwnerType::Platform && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }
    let owner_id = match owner_type {
        OwnerType::Platform => None,
        OwnerType::User => Some(account.id),
    };

    let provider = app
        .store
        .provider_by_code(&body.provider_code)
        .await?
        .filter(|p| p.is_enabled)
        .ok_or_else(|| Error::Config(format!("unknown provider '{}'", body.provider_code)))?;
    app.registry.validate_config(&provider.provider_code, &body.config)?;

    let audit = AuditEntry::success("service_create", addr.ip().to_string())
        .account(account.id)
        .details(json!({
            "service_name": body.service_name,
            "provider": provider.provider_code,
            "config": body.config,
        }));
    let service = app
        .store
        .create_backend_service(
            provider.id,
            &body.service_name,
            owner_type,
            owner_id,
            &body.config,
            body.is_default_for_owner,
            audit,
        )
        .await?;
    Ok(Json(json!({"status": "success", "service": {"id": service.id}})))
}

/// `GET /admin/services`
pub(super) async fn list_services(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let (_, account) = user_session(&app, &headers).await?;
    let services = if account.is_admin {
        app.store.list_backend_services(None).await?
    } else {
        app.store.list_backend_services(Some(account.id)).await?
    };
    let out: Vec<Value> = services
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "service_name": s.service_name,
                "provider_id": s.provider_id,
                "owner_type": s.owner_type.as_str(),
                "owner_id": s.owner_id,
                "is_active": s.is_active,
                "is_default_for_owner": s.is_default_for_owner,
                "last_test_status": s.last_test_status,
                "last_test_message": s.last_test_message,
            })
        })
        .collect();
    Ok(Json(json!({"status": "success", "services": out})))
}

/// `POST /admin/services/{id}/test` — run and record a connection test.
pub(super) async fn test_service(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(service_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let service = app.store.backend_service_by_id(service_id).await?;
    if service.owner_id != Some(account.id) && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }
    let provider = app.store.provider_by_id(service.provider_id).await?;
    let backend = app.registry.instantiate(&provider.provider_code, &service)?;

    let outcome = backend.test_connection().await;
    let status = if outcome.ok { "ok" } else { "failed" };
    app.store
        .set_service_test_result(service_id, status, &outcome.message)
        .await?;
    let _ = app
        .store
        .insert_audit(
            &AuditEntry::success("service_test", addr.ip().to_string())
                .account(account.id)
                .details(json!({"service_id": service_id, "result": status})),
        )
        .await;
    Ok(Json(
        json!({"status": "success", "test": {"ok": outcome.ok, "message": outcome.message}}),
    ))
}

#[derive(serde::Deserialize)]
pub(super) struct PatchServiceBody {
    is_active: bool,
}

/// `PATCH /admin/services/{id}` — active toggle; dependent realms deny
/// immediately while inactive.
pub(super) async fn patch_service(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(service_id): Path<i64>,
    Json(body): Json<PatchServiceBody>,
) -> HandlerResult<Json<Value>> {
    let (session, account) = user_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let service = app.store.backend_service_by_id(service_id).await?;
    if service.owner_id != Some(account.id) && !account.is_admin {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed).into());
    }

    let audit = AuditEntry::success("service_set_active", addr.ip().to_string())
        .account(account.id)
        .details(json!({"service_id": service_id, "is_active": body.is_active}));
    app.store.set_service_active(service_id, body.is_active, audit).await?;
    app.registry.invalidate(service_id);
    Ok(Json(json!({"status": "success"})))
}

// ---------------------------------------------------------------------------
// Domain roots & grants
// ---------------------------------------------------------------------------

/// `GET /admin/roots` — roots visible to the caller.
pub(super) async fn list_roots(
    State(app): State<App>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let (_, account) = user_session(&app, &headers).await?;
    let roots = app.store.roots_visible_to_account(account.id).await?;
    let out: Vec<Value> = roots
        .iter()
        .map(|root| {
            json!({
                "id": root.id,
                "root_domain": root.root_domain,
                "visibility": root.visibility.as_str(),
                "allow_apex_access": root.allow_apex_access,
                "min_subdomain_depth": root.min_subdomain_depth,
                "max_subdomain_depth": root.max_subdomain_depth,
                "allowed_record_types": root.allowed_record_types,
                "allowed_operations": root.allowed_operations,
            })
        })
        .collect();
    Ok(Json(json!({"status": "success", "roots": out})))
}

#[derive(serde::Deserialize)]
pub(super) struct CreateRootBody {
    backend_service_id: i64,
    root_domain: String,
    #[serde(default)]
    dns_zone: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    allow_apex_access: bool,
    #[serde(default = "default_depth_min")]
    min_subdomain_depth: i64,
    #[serde(default = "default_depth_max")]
    max_subdomain_depth: i64,
    #[serde(default)]
    allowed_record_types: Vec<String>,
    #[serde(default)]
    allowed_operations: Vec<String>,
}

fn default_depth_min() -> i64 {
    1
}
fn default_depth_max() -> i64 {
    1
}

/// `POST /admin/roots` — admin only.
pub(super) async fn create_root(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateRootBody>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let visibility = match body.visibility.as_deref() {
        None => Visibility::Public,
        Some(raw) => Visibility::parse(raw)
            .ok_or_else(|| Error::MalformedRequest(format!("unknown visibility '{raw}'")))?,
    };
    if body.min_subdomain_depth < 0 || body.max_subdomain_depth < body.min_subdomain_depth {
        return Err(Error::MalformedRequest("invalid subdomain depth window".to_string()).into());
    }
    let root_domain = body.root_domain.trim_end_matches('.').to_ascii_lowercase();
    let dns_zone = body
        .dns_zone
        .as_deref()
        .map(|z| z.trim_end_matches('.').to_ascii_lowercase())
        .unwrap_or_else(|| root_domain.clone());

    // the root's service must exist and be platform-owned
    let service = app.store.backend_service_by_id(body.backend_service_id).await?;
    if service.owner_type != OwnerType::Platform {
        return Err(Error::MalformedRequest(
            "domain roots must use a platform-owned backend service".to_string(),
        )
        .into());
    }

    let audit = AuditEntry::success("root_create", addr.ip().to_string())
        .account(admin.id)
        .target(root_domain.clone())
        .details(json!({"visibility": visibility.as_str()}));
    let root = app
        .store
        .create_domain_root(
            body.backend_service_id,
            &root_domain,
            &dns_zone,
            visibility,
            body.allow_apex_access,
            (body.min_subdomain_depth, body.max_subdomain_depth),
            &body.allowed_record_types,
            &body.allowed_operations,
            audit,
        )
        .await?;
    Ok(Json(json!({"status": "success", "root": {"id": root.id}})))
}

#[derive(serde::Deserialize)]
pub(super) struct PatchRootBody {
    is_active: bool,
}

/// `PATCH /admin/roots/{id}` — admin only.
pub(super) async fn patch_root(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(root_id): Path<i64>,
    Json(body): Json<PatchRootBody>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let audit = AuditEntry::success("root_set_active", addr.ip().to_string())
        .account(admin.id)
        .details(json!({"root_id": root_id, "is_active": body.is_active}));
    app.store.set_root_active(root_id, body.is_active, audit).await?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(serde::Deserialize)]
pub(super) struct CreateGrantBody {
    domain_root_id: i64,
    account_id: i64,
    #[serde(default)]
    grant_type: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// `POST /admin/grants` — admin only.
pub(super) async fn create_grant(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateGrantBody>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let grant_type = match body.grant_type.as_deref() {
        None => GrantType::Standard,
        Some(raw) => GrantType::parse(raw)
            .ok_or_else(|| Error::MalformedRequest(format!("unknown grant_type '{raw}'")))?,
    };

    let audit = AuditEntry::success("grant_create", addr.ip().to_string())
        .account(admin.id)
        .details(json!({
            "domain_root_id": body.domain_root_id,
            "grantee": body.account_id,
            "grant_type": grant_type.as_str(),
        }));
    let grant = app
        .store
        .create_grant(
            body.domain_root_id,
            body.account_id,
            grant_type,
            Some(admin.id),
            body.expires_at,
            audit,
        )
        .await?;
    Ok(Json(json!({"status": "success", "grant": {"id": grant.id}})))
}

/// `DELETE /admin/grants/{id}` — admin only.
pub(super) async fn revoke_grant(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(grant_id): Path<i64>,
) -> HandlerResult<Json<Value>> {
    let (session, admin) = admin_session(&app, &headers).await?;
    check_csrf(&session, &headers)?;

    let audit = AuditEntry::success("grant_revoke", addr.ip().to_string())
        .account(admin.id)
        .details(json!({"grant_id": grant_id}));
    app.store.revoke_grant(grant_id, audit).await?;
    Ok(Json(json!({"status": "success"})))
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// `GET /admin/audit` — admin only, filterable.
pub(super) async fn query_audit(
    State(app): State<App>,
    headers: HeaderMap,
    Query(filter): Query<AuditFilter>,
) -> HandlerResult<Json<Value>> {
    let _ = admin_session(&app, &headers).await?;
    let records = app.store.audit_query(&filter).await?;
    Ok(Json(json!({"status": "success", "records": records})))
}
