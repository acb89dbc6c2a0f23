//! The DNS API request pipeline
//!
//! `POST /api` carries the vendor-compatible envelope
//! `{"action": ..., "param": ...}`. Each request walks a fixed state
//! machine: received → authenticated → authorized → dispatched → filtered
//! → responded, short-circuiting to `failed(reason)` on the first error.
//! Exactly one audit record is written per request that passes the
//! body-size check, whatever the outcome.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use super::{App, Failure};
use crate::backend::{fqdn, DnsRecord};
use crate::error::DenyReason;
use crate::notify::Notification;
use crate::policy::PermissionCtx;
use crate::resolver::ResolvedRealm;
use crate::store::{AuditEntry, Operation, Outcome, Token};
use crate::{Error, Result};

/// Fields the single audit record accumulates while the pipeline runs.
struct AuditScope {
    token_prefix: Option<String>,
    account_id: Option<i64>,
    domain: String,
    details: Value,
}

#[derive(serde::Deserialize)]
struct ApiRequest {
    action: String,
    #[serde(default)]
    param: Value,
}

/// `POST /api`
pub(super) async fn handle_api(
    State(app): State<App>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let source_ip = addr.ip();

    // Rate limit before any parsing; the refusal itself is audited.
    if let Err(retry_after) = app.limiter.check(source_ip) {
        let entry = AuditEntry::error("api", source_ip.to_string(), "rate_limited")
            .latency(elapsed_ms(started));
        let _ = app.store.insert_audit(&entry).await;
        return Failure(Error::RateLimited(retry_after)).into_response();
    }

    let mut scope = AuditScope {
        token_prefix: None,
        account_id: None,
        domain: String::new(),
        details: Value::Null,
    };

    let (action, outcome) = match serde_json::from_slice::<ApiRequest>(&body) {
        Ok(request) => {
            let action = request.action.clone();
            let outcome = process(&app, &headers, query.as_deref(), source_ip, request, &mut scope)
                .await;
            (action, outcome)
        }
        Err(e) => (
            "api".to_string(),
            Err(Error::MalformedRequest(format!("invalid JSON body: {e}"))),
        ),
    };

    let entry = AuditEntry {
        token_prefix: scope.token_prefix.clone(),
        account_id: scope.account_id,
        source_ip: source_ip.to_string(),
        operation: action,
        domain: scope.domain.clone(),
        record_details: (!scope.details.is_null()).then(|| scope.details.clone()),
        outcome: match &outcome {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::parse(e.outcome()).unwrap_or(Outcome::Error),
        },
        error_kind: outcome.as_ref().err().map(|e| e.reason().to_string()),
        latency_ms: elapsed_ms(started),
    };
    // Best-effort after the upstream work; the row is still awaited so the
    // audit-completeness invariant holds on the happy path.
    if let Err(e) = app.store.insert_audit(&entry).await {
        warn!(error = %e, "audit insert failed");
    }

    match outcome {
        Ok(responsedata) => Json(json!({
            "status": "success",
            "responsedata": responsedata,
            "message": "ok",
        }))
        .into_response(),
        Err(e) => Failure(e).into_response(),
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Pull the token from `Authorization: Bearer`, then `X-API-Token`, then
/// the `token` query parameter. The fallback paths are flagged as
/// insecure transport in the audit detail.
fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Result<(String, bool)> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return Ok((bearer.trim().to_string(), false));
        }
    }
    if let Some(value) = headers.get("x-api-token").and_then(|v| v.to_str().ok()) {
        return Ok((value.trim().to_string(), true));
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((name, value)) = pair.split_once('=') {
                if name == "token" {
                    return Ok((value.to_string(), true));
                }
            }
        }
    }
    Err(Error::InvalidToken)
}

/// Content limits run before authentication: the body-size half is the
/// innermost middleware layer, the record-cap half is checked here as
/// soon as the body has parsed.
fn check_record_cap(app: &App, request: &ApiRequest) -> Result<()> {
    let count = request
        .param
        .get("dnsrecordset")
        .and_then(|set| set.get("dnsrecords"))
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if count > app.config.max_records_per_request {
        return Err(Error::MalformedRequest(format!(
            "record set exceeds the per-request cap of {}",
            app.config.max_records_per_request
        )));
    }
    Ok(())
}

async fn process(
    app: &App,
    headers: &HeaderMap,
    query: Option<&str>,
    source_ip: std::net::IpAddr,
    request: ApiRequest,
    scope: &mut AuditScope,
) -> Result<Value> {
    // Content limits
    check_record_cap(app, &request)?;

    // Authenticate
    let (plaintext, insecure_transport) = extract_token(headers, query)?;
    if insecure_transport {
        warn!(%source_ip, "API token presented outside the Authorization header");
    }
    let token = authenticate(app, &plaintext).await?;
    scope.token_prefix = Some(token.token_prefix.clone());
    scope.details = json!({"insecure_transport": insecure_transport});

    // Resolve realm + backend
    let resolved = app.resolver.resolve(&token).await?;
    scope.account_id = Some(resolved.account_id);

    // The owning account must be live and past any forced password change
    let account = app.store.account_by_id(resolved.account_id).await?;
    if !account.is_active {
        return Err(Error::AccountDisabled);
    }
    if account.must_change_password {
        return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed));
    }

    // Authorize
    let origin_allowed = app
        .origins
        .origin_allowed(&token.allowed_origins, source_ip)
        .await;
    let ctx = PermissionCtx::new(
        &token,
        resolved.zone.clone(),
        resolved.realm_type,
        resolved.root_policy.clone(),
        origin_allowed,
        Utc::now(),
    );

    let deadline = Duration::from_millis(app.config.deadline_ms_backend);
    let result = match request.action.as_str() {
        "infoDnsZone" => {
            let domainname = domain_param(&request.param, scope)?;
            ctx.check_request(Operation::Read, &domainname)?;
            require_in_base(&resolved, &domainname)?;
            info_dns_zone(&resolved, &domainname, deadline).await
        }
        "infoDnsRecords" => {
            let domainname = domain_param(&request.param, scope)?;
            ctx.check_request(Operation::Read, &domainname)?;
            require_in_base(&resolved, &domainname)?;
            info_dns_records(&resolved, &ctx, &domainname, deadline).await
        }
        "updateDnsRecords" => {
            let domainname = domain_param(&request.param, scope)?;
            ctx.check_zone(&domainname)?;
            require_in_base(&resolved, &domainname)?;
            update_dns_records(&resolved, &ctx, &domainname, &request.param, deadline, scope)
                .await
        }
        other => Err(Error::MalformedRequest(format!("unknown action '{other}'"))),
    };

    if result.is_ok() {
        let _ = app.store.touch_token(token.id).await;
        if token.email_on_use {
            app.notifier.enqueue(Notification::TokenUse {
                to: account.email.clone(),
                token_prefix: token.token_prefix.clone(),
                operation: request.action.clone(),
                zone: scope.domain.clone(),
                source_ip: source_ip.to_string(),
            });
        }
    }
    result
}

/// Verify the presented plaintext and return the token row. Unknown
/// prefixes burn a dummy bcrypt verification so both failure paths cost
/// the same; the caller sees one opaque `invalid_token` either way.
async fn authenticate(app: &App, plaintext: &str) -> Result<Token> {
    let prefix = crate::secrets::split_token(plaintext)?;
    let Some(token) = app.store.token_by_prefix(prefix).await? else {
        app.secrets.burn_verification().await;
        return Err(Error::InvalidToken);
    };
    if !app.secrets.verify_token(plaintext, &token.token_hash).await? {
        return Err(Error::InvalidToken);
    }
    Ok(token)
}

fn domain_param(param: &Value, scope: &mut AuditScope) -> Result<String> {
    let domainname = param
        .get("domainname")
        .and_then(Value::as_str)
        .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::MalformedRequest("param.domainname is required".to_string()))?;
    scope.domain = domainname.clone();
    Ok(domainname)
}

/// The addressed zone must sit inside the realm's served base, otherwise
/// upstream names cannot be derived for it.
fn require_in_base(resolved: &ResolvedRealm, domainname: &str) -> Result<()> {
    if crate::policy::within_zone(&resolved.caller_base, domainname) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(DenyReason::ZoneNotInRealm))
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::BackendTimeout("upstream deadline exceeded".to_string())),
    }
}

async fn info_dns_zone(
    resolved: &ResolvedRealm,
    domainname: &str,
    deadline: Duration,
) -> Result<Value> {
    let info = with_deadline(
        deadline,
        resolved.backend.get_zone_info(&resolved.upstream_zone),
    )
    .await?;

    // Vendor-specific fields ride along unchanged on success responses.
    let mut data = serde_json::to_value(&info)?;
    if let Some(object) = data.as_object_mut() {
        object.insert("name".to_string(), json!(domainname));
    }
    Ok(data)
}

/// Re-relativize an upstream record into the caller's view under
/// `domainname`. `None` when the record sits outside that subtree.
fn to_caller_view(record: &DnsRecord, caller_base: &str, domainname: &str) -> Option<DnsRecord> {
    let caller_fqdn = fqdn(&record.hostname, caller_base);
    let hostname = crate::backend::relative_hostname(&caller_fqdn, domainname)?;
    Some(DnsRecord {
        hostname,
        ..record.clone()
    })
}

fn record_to_wire(record: &DnsRecord) -> Value {
    json!({
        "id": record.id,
        "hostname": record.hostname,
        "type": record.rtype,
        "priority": record.priority.unwrap_or(0).to_string(),
        "destination": record.value,
        "deleterecord": false,
        "state": "yes",
    })
}

async fn info_dns_records(
    resolved: &ResolvedRealm,
    ctx: &PermissionCtx,
    domainname: &str,
    deadline: Duration,
) -> Result<Value> {
    let records = with_deadline(
        deadline,
        resolved.backend.list_records(&resolved.upstream_zone),
    )
    .await?;

    let visible: Vec<DnsRecord> = records
        .iter()
        .filter_map(|record| to_caller_view(record, &resolved.caller_base, domainname))
        .collect();
    let permitted = ctx.filter_records(domainname, visible);

    Ok(json!({
        "dnsrecords": permitted.iter().map(record_to_wire).collect::<Vec<_>>(),
    }))
}

/// One parsed entry of an incoming `dnsrecordset`.
struct IncomingRecord {
    id: Option<String>,
    hostname: String,
    rtype: String,
    destination: String,
    priority: Option<u32>,
    ttl: Option<u32>,
    delete: bool,
}

fn parse_incoming(raw: &Value) -> Result<IncomingRecord> {
    let str_field = |key: &str| -> Result<String> {
        raw.get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| Error::MalformedRequest(format!("dnsrecord missing '{key}'")))
    };
    let id = raw.get("id").and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let delete = matches!(raw.get("deleterecord"), Some(Value::Bool(true)))
        || raw.get("deleterecord").and_then(Value::as_str) == Some("true");
    Ok(IncomingRecord {
        id,
        hostname: str_field("hostname")?,
        rtype: str_field("type")?.to_uppercase(),
        destination: if delete {
            raw.get("destination")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            str_field("destination")?
        },
        priority: raw.get("priority").and_then(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|x| u32::try_from(x).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }),
        ttl: raw.get("ttl").and_then(Value::as_u64).and_then(|t| u32::try_from(t).ok()),
        delete,
    })
}

#[allow(clippy::too_many_lines)]
async fn update_dns_records(
    resolved: &ResolvedRealm,
    ctx: &PermissionCtx,
    domainname: &str,
    param: &Value,
    deadline: Duration,
    scope: &mut AuditScope,
) -> Result<Value> {
    let raw_records = param
        .get("dnsrecordset")
        .and_then(|set| set.get("dnsrecords"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::MalformedRequest("param.dnsrecordset.dnsrecords is required".to_string())
        })?;

    let incoming: Vec<IncomingRecord> = raw_records
        .iter()
        .map(parse_incoming)
        .collect::<Result<_>>()?;

    scope.details = json!({
        "record_count": incoming.len(),
        "records": raw_records,
    });

    // Pre-authorization pass: no upstream call happens until every record
    // has at least one permissible interpretation. An id-less non-delete
    // record may resolve to update or create, so either suffices here;
    // the exact gate runs again after classification.
    for record in &incoming {
        let caller_fqdn = fqdn(&record.hostname, domainname);
        let candidates: &[Operation] = if record.delete {
            &[Operation::Delete]
        } else if record.id.is_some() {
            &[Operation::Update]
        } else {
            &[Operation::Update, Operation::Create]
        };
        let mut last_err = None;
        let allowed = candidates.iter().any(|&op| {
            match ctx.check_record(op, &caller_fqdn, &record.rtype) {
                Ok(()) => true,
                Err(e) => {
                    last_err = Some(e);
                    false
                }
            }
        });
        if !allowed {
            return Err(last_err
                .unwrap_or(Error::PermissionDenied(DenyReason::OperationNotAllowed)));
        }
    }

    // Read the current set once: upsert-by-(hostname,type) and deletes
    // need it.
    let existing = with_deadline(
        deadline,
        resolved.backend.list_records(&resolved.upstream_zone),
    )
    .await?;

    enum Planned {
        Create(DnsRecord),
        Update(String, DnsRecord),
        Delete(String),
    }

    let mut plan = Vec::with_capacity(incoming.len());
    for record in &incoming {
        let caller_fqdn = fqdn(&record.hostname, domainname);
        let upstream_hostname = resolved
            .upstream_hostname(&caller_fqdn)
            .ok_or(Error::PermissionDenied(DenyReason::ZoneNotInRealm))?;

        let operation = if record.delete {
            Operation::Delete
        } else if record.id.is_some()
            || existing
                .iter()
                .any(|e| e.hostname == upstream_hostname && e.rtype == record.rtype)
        {
            Operation::Update
        } else {
            Operation::Create
        };

        // The entire request is rejected on the first violating record.
        ctx.check_record(operation, &caller_fqdn, &record.rtype)?;

        let normalized = DnsRecord {
            id: record.id.clone(),
            hostname: upstream_hostname.clone(),
            rtype: record.rtype.clone(),
            value: record.destination.clone(),
            ttl: record.ttl,
            priority: record.priority,
        };
        let existing_id = |record: &IncomingRecord| {
            record.id.clone().or_else(|| {
                existing
                    .iter()
                    .find(|e| e.hostname == upstream_hostname && e.rtype == record.rtype)
                    .and_then(|e| e.id.clone())
            })
        };

        plan.push(match operation {
            Operation::Delete => {
                let id = existing_id(record).ok_or_else(|| {
                    Error::MalformedRequest(
                        "deleterecord requires an id or an existing (hostname, type)".to_string(),
                    )
                })?;
                Planned::Delete(id)
            }
            Operation::Update => match existing_id(record) {
                Some(id) => Planned::Update(id, normalized),
                None => Planned::Create(normalized),
            },
            Operation::Create | Operation::Read => Planned::Create(normalized),
        });
    }

    // All gates passed; apply in request order.
    let mut applied = Vec::with_capacity(plan.len());
    for step in plan {
        match step {
            Planned::Create(record) => {
                let created = with_deadline(
                    deadline,
                    resolved.backend.create_record(&resolved.upstream_zone, &record),
                )
                .await?;
                applied.push(created);
            }
            Planned::Update(id, record) => {
                let updated = with_deadline(
                    deadline,
                    resolved
                        .backend
                        .update_record(&resolved.upstream_zone, &id, &record),
                )
                .await?;
                applied.push(updated);
            }
            Planned::Delete(id) => {
                with_deadline(
                    deadline,
                    resolved.backend.delete_record(&resolved.upstream_zone, &id),
                )
                .await?;
            }
        }
    }

    let visible: Vec<Value> = applied
        .iter()
        .filter_map(|record| to_caller_view(record, &resolved.caller_base, domainname))
        .map(|record| record_to_wire(&record))
        .collect();

    Ok(json!({ "dnsrecords": visible }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_extraction_order_and_transport_flag() {
        // GIVEN: all three transports at once
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer AbCdEf123456:secret".parse().unwrap());
        headers.insert("x-api-token", "header-token".parse().unwrap());

        // THEN: the Authorization header wins and is not flagged
        let (token, insecure) = extract_token(&headers, Some("token=query-token")).unwrap();
        assert_eq!(token, "AbCdEf123456:secret");
        assert!(!insecure);

        // AND: the fallbacks are flagged as insecure transport
        let mut headers = HeaderMap::new();
        headers.insert("x-api-token", "header-token".parse().unwrap());
        let (token, insecure) = extract_token(&headers, None).unwrap();
        assert_eq!(token, "header-token");
        assert!(insecure);

        let (token, insecure) = extract_token(&HeaderMap::new(), Some("a=1&token=q")).unwrap();
        assert_eq!(token, "q");
        assert!(insecure);

        assert!(extract_token(&HeaderMap::new(), None).is_err());
    }

    #[test]
    fn incoming_records_parse_vendor_quirks() {
        // GIVEN: a record with numeric id and string priority
        let raw = json!({
            "id": 42, "hostname": "home", "type": "a",
            "priority": "10", "destination": "192.0.2.1"
        });
        let record = parse_incoming(&raw).unwrap();
        assert_eq!(record.id.as_deref(), Some("42"));
        assert_eq!(record.rtype, "A");
        assert_eq!(record.priority, Some(10));
        assert!(!record.delete);

        // deleterecord accepts bool and the string form, destination optional
        let raw = json!({
            "id": "42", "hostname": "home", "type": "A", "deleterecord": "true"
        });
        assert!(parse_incoming(&raw).unwrap().delete);

        // a non-delete record without destination is malformed
        let raw = json!({"hostname": "home", "type": "A"});
        assert!(parse_incoming(&raw).is_err());
    }

    #[test]
    fn caller_view_relativizes_and_drops_outside_records() {
        let record = DnsRecord {
            id: Some("1".into()),
            hostname: "home".into(),
            rtype: "A".into(),
            value: "192.0.2.1".into(),
            ttl: None,
            priority: None,
        };

        // viewing the base zone keeps the hostname
        let view = to_caller_view(&record, "example.com", "example.com").unwrap();
        assert_eq!(view.hostname, "home");

        // viewing the host realm maps it to the apex
        let view = to_caller_view(&record, "example.com", "home.example.com").unwrap();
        assert_eq!(view.hostname, "@");

        // a sibling subtree sees nothing
        let www = DnsRecord {
            hostname: "www".into(),
            ..record
        };
        assert!(to_caller_view(&www, "example.com", "home.example.com").is_none());
    }

    #[test]
    fn wire_record_shape_matches_vendor_contract() {
        let record = DnsRecord {
            id: Some("7".into()),
            hostname: "@".into(),
            rtype: "MX".into(),
            value: "mail.example.com".into(),
            ttl: None,
            priority: Some(10),
        };
        let wire = record_to_wire(&record);
        assert_eq!(wire["id"], json!("7"));
        assert_eq!(wire["type"], json!("MX"));
        assert_eq!(wire["priority"], json!("10"));
        assert_eq!(wire["destination"], json!("mail.example.com"));
        assert_eq!(wire["state"], json!("yes"));
    }
}
