//! Netcup DNS provider
//!
//! Speaks the stateful JSON webservice: explicit `login`/`logout`, a
//! short-lived `apisessionid` injected into every call, and a single
//! whole-record-set `updateDnsRecords` mutation. Per-record create,
//! update and delete are rewritten as read-modify-write of the full zone
//! set; a per-zone in-process mutex serializes those so concurrent proxy
//! requests cannot lose updates. A request that fails on an expired
//! session re-logs-in and retries exactly once.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{map_upstream_status, BackendEnv, DnsBackend, DnsRecord, ProviderSpec, TestOutcome, ZoneInfo};
use crate::store::ProviderCaps;
use crate::{Error, Result};

const DEFAULT_ENDPOINT: &str = "https://ccp.netcup.net/run/webservice/servers/endpoint.php?JSON";

/// Upstream statuscode signalling an expired or invalid session.
const STATUS_SESSION_INVALID: i64 = 4001;

/// Registry entry for this provider.
pub(super) fn provider_spec() -> ProviderSpec {
    ProviderSpec {
        code: "netcup",
        display_name: "Netcup CCP DNS",
        config_schema: super::object_schema(
            &[
                ("customernumber", "Netcup customer number"),
                ("apikey", "CCP API key"),
                ("apipassword", "CCP API password"),
            ],
            &[("endpoint", "Webservice endpoint override")],
        ),
        caps: ProviderCaps {
            zone_list: false,
            zone_create: false,
            dnssec: true,
            record_types: ["A", "AAAA", "CNAME", "MX", "TXT", "SRV", "CAA", "NS"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        },
        build: |env, config| Ok(Arc::new(NetcupBackend::new(env.clone(), config)?)),
    }
}

/// One Netcup credential set with its cached session and zone locks.
pub struct NetcupBackend {
    env: BackendEnv,
    endpoint: String,
    customer_number: String,
    api_key: String,
    api_password: String,
    session: Mutex<Option<String>>,
    zone_locks: DashMap<String, Arc<Mutex<()>>>,
}

#[derive(Debug, serde::Deserialize)]
struct NetcupResponse {
    status: String,
    #[serde(default)]
    statuscode: i64,
    #[serde(default)]
    longmessage: String,
    #[serde(default)]
    responsedata: Value,
}

impl NetcupBackend {
    fn new(env: BackendEnv, config: &Value) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| Error::Config(format!("netcup config missing '{key}'")))
        };
        Ok(Self {
            endpoint: config
                .get("endpoint")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_ENDPOINT)
                .to_string(),
            customer_number: get("customernumber")?,
            api_key: get("apikey")?,
            api_password: get("apipassword")?,
            session: Mutex::new(None),
            zone_locks: DashMap::new(),
            env,
        })
    }

    fn zone_lock(&self, zone: &str) -> Arc<Mutex<()>> {
        self.zone_locks
            .entry(zone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn post(&self, action: &str, param: Value) -> Result<NetcupResponse> {
        let body = json!({"action": action, "param": param});
        let response = self
            .env
            .client
            .post(&self.endpoint)
            .timeout(self.env.deadline)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_upstream_status(status, "netcup"));
        }
        let parsed: NetcupResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendProtocolError(format!("netcup: {e}")))?;
        Ok(parsed)
    }

    async fn login(&self) -> Result<String> {
        let response = self
            .post(
                "login",
                json!({
                    "customernumber": self.customer_number,
                    "apikey": self.api_key,
                    "apipassword": self.api_password,
                }),
            )
            .await?;
        if response.status != "success" {
            return Err(Error::BackendRefused(format!(
                "netcup login failed ({})",
                response.statuscode
            )));
        }
        response
            .responsedata
            .get("apisessionid")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::BackendProtocolError("netcup login returned no apisessionid".to_string())
            })
    }

    async fn session_id(&self) -> Result<String> {
        let mut guard = self.session.lock().await;
        if let Some(ref id) = *guard {
            return Ok(id.clone());
        }
        let id = self.login().await?;
        debug!(provider = "netcup", "opened upstream session");
        *guard = Some(id.clone());
        Ok(id)
    }

    async fn drop_session(&self) {
        *self.session.lock().await = None;
    }

    /// An authenticated call. Retries once after re-login when the
    /// upstream reports an invalid session.
    async fn call(&self, action: &str, mut param: Map<String, Value>) -> Result<Value> {
        for attempt in 0..2 {
            let session = self.session_id().await?;
            param.insert("customernumber".into(), json!(self.customer_number));
            param.insert("apikey".into(), json!(self.api_key));
            param.insert("apisessionid".into(), json!(session));

            let response = self.post(action, Value::Object(param.clone())).await?;
            if response.status == "success" {
                return Ok(response.responsedata);
            }

            let session_expired = response.statuscode == STATUS_SESSION_INVALID
                || response.longmessage.to_lowercase().contains("session");
            if session_expired && attempt == 0 {
                debug!(provider = "netcup", "session expired, re-login");
                self.drop_session().await;
                continue;
            }

            return Err(map_error(&response));
        }
        Err(Error::BackendUnavailable(
            "netcup session could not be re-established".to_string(),
        ))
    }

    async fn fetch_records(&self, zone: &str) -> Result<Vec<(Value, DnsRecord)>> {
        let mut param = Map::new();
        param.insert("domainname".into(), json!(zone));
        let data = self.call("infoDnsRecords", param).await?;

        let raw = data
            .get("dnsrecords")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::BackendProtocolError("netcup infoDnsRecords returned no dnsrecords".into())
            })?;
        raw.iter()
            .map(|r| Ok((r.clone(), record_from_wire(r)?)))
            .collect()
    }

    async fn push_records(&self, zone: &str, records: Vec<Value>) -> Result<Value> {
        let mut param = Map::new();
        param.insert("domainname".into(), json!(zone));
        param.insert("dnsrecordset".into(), json!({ "dnsrecords": records }));
        self.call("updateDnsRecords", param).await
    }
}

fn map_error(response: &NetcupResponse) -> Error {
    let message = format!("netcup {}: {}", response.statuscode, response.longmessage);
    let lowered = response.longmessage.to_lowercase();
    if lowered.contains("domain not found") || lowered.contains("unknown domain") {
        return Error::ZoneNotFound(message);
    }
    if (4000..5000).contains(&response.statuscode) {
        Error::BackendRefused(message)
    } else {
        Error::BackendUnavailable(message)
    }
}

/// Priority comes back as either a string or a number depending on the
/// record type.
fn parse_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn record_from_wire(raw: &Value) -> Result<DnsRecord> {
    let str_field = |key: &str| -> Result<String> {
        raw.get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::BackendProtocolError(format!("netcup record missing '{key}'"))
            })
    };
    Ok(DnsRecord {
        id: raw
            .get("id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
        hostname: str_field("hostname")?,
        rtype: str_field("type")?.to_uppercase(),
        value: str_field("destination")?,
        ttl: None,
        priority: parse_u32(raw.get("priority")),
    })
}

fn record_to_wire(record: &DnsRecord, delete: bool) -> Value {
    let mut wire = Map::new();
    if let Some(ref id) = record.id {
        wire.insert("id".into(), json!(id));
    }
    wire.insert("hostname".into(), json!(record.hostname));
    wire.insert("type".into(), json!(record.rtype));
    wire.insert(
        "priority".into(),
        json!(record.priority.unwrap_or(0).to_string()),
    );
    wire.insert("destination".into(), json!(record.value));
    wire.insert("deleterecord".into(), json!(delete));
    Value::Object(wire)
}

#[async_trait::async_trait]
impl DnsBackend for NetcupBackend {
    fn provider_code(&self) -> &'static str {
        "netcup"
    }

    async fn test_connection(&self) -> TestOutcome {
        match self.login().await {
            Ok(session) => {
                let _ = self
                    .post(
                        "logout",
                        json!({
                            "customernumber": self.customer_number,
                            "apikey": self.api_key,
                            "apisessionid": session,
                        }),
                    )
                    .await;
                TestOutcome {
                    ok: true,
                    message: "login accepted".to_string(),
                }
            }
            Err(e) => TestOutcome {
                ok: false,
                message: e.public_message(),
            },
        }
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        // The CCP webservice has no zone enumeration call.
        Err(Error::BackendRefused(
            "netcup does not support zone enumeration".to_string(),
        ))
    }

    async fn validate_zone_access(&self, zone: &str) -> Result<()> {
        self.get_zone_info(zone).await.map(|_| ())
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        Ok(self
            .fetch_records(zone)
            .await?
            .into_iter()
            .map(|(_, rec)| rec)
            .collect())
    }

    async fn get_record(&self, zone: &str, id: &str) -> Result<DnsRecord> {
        self.list_records(zone)
            .await?
            .into_iter()
            .find(|r| r.id.as_deref() == Some(id))
            .ok_or_else(|| Error::NotFound(format!("record {id} in {zone}")))
    }

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let lock = self.zone_lock(zone);
        let _guard = lock.lock().await;

        let existing = self.fetch_records(zone).await?;
        let known: Vec<String> = existing
            .iter()
            .filter_map(|(_, r)| r.id.clone())
            .collect();

        let mut new_record = record.clone();
        new_record.id = None;
        self.push_records(zone, vec![record_to_wire(&new_record, false)])
            .await?;

        // The upstream assigns the id; re-read and pick the new row.
        self.fetch_records(zone)
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .find(|r| {
                r.hostname == record.hostname
                    && r.rtype == record.rtype
                    && r.value == record.value
                    && r.id.as_ref().is_some_and(|id| !known.contains(id))
            })
            .ok_or_else(|| {
                Error::BackendProtocolError("netcup did not persist the created record".into())
            })
    }

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let lock = self.zone_lock(zone);
        let _guard = lock.lock().await;

        let existing = self.fetch_records(zone).await?;
        if !existing.iter().any(|(_, r)| r.id.as_deref() == Some(id)) {
            return Err(Error::NotFound(format!("record {id} in {zone}")));
        }

        let mut updated = record.clone();
        updated.id = Some(id.to_string());
        self.push_records(zone, vec![record_to_wire(&updated, false)])
            .await?;
        Ok(updated)
    }

    async fn delete_record(&self, zone: &str, id: &str) -> Result<()> {
        let lock = self.zone_lock(zone);
        let _guard = lock.lock().await;

        let existing = self.fetch_records(zone).await?;
        let (_, target) = existing
            .iter()
            .find(|(_, r)| r.id.as_deref() == Some(id))
            .ok_or_else(|| Error::NotFound(format!("record {id} in {zone}")))?;

        self.push_records(zone, vec![record_to_wire(target, true)])
            .await?;
        Ok(())
    }

    async fn get_zone_info(&self, zone: &str) -> Result<ZoneInfo> {
        let mut param = Map::new();
        param.insert("domainname".into(), json!(zone));
        let data = self.call("infoDnsZone", param).await?;

        let num = |key: &str| -> Option<u64> {
            match data.get(key) {
                Some(Value::Number(n)) => n.as_u64(),
                Some(Value::String(s)) => s.parse().ok(),
                _ => None,
            }
        };
        let mut extra = serde_json::Map::new();
        if let Some(status) = data.get("dnssecstatus") {
            extra.insert("dnssecstatus".to_string(), status.clone());
        }
        Ok(ZoneInfo {
            name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(zone)
                .to_string(),
            ttl: num("ttl"),
            serial: num("serial"),
            refresh: num("refresh"),
            retry: num("retry"),
            expire: num("expire"),
            dnssec: data.get("dnssecstatus").and_then(Value::as_bool),
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_record_parses_string_and_numeric_fields() {
        // GIVEN: a record as netcup serializes it (priority as string)
        let raw = json!({
            "id": "812", "hostname": "www", "type": "a",
            "priority": "0", "destination": "192.0.2.7",
            "deleterecord": false, "state": "yes"
        });

        // WHEN: normalizing
        let record = record_from_wire(&raw).unwrap();

        // THEN: type is upper-cased, id kept as string
        assert_eq!(record.id.as_deref(), Some("812"));
        assert_eq!(record.rtype, "A");
        assert_eq!(record.value, "192.0.2.7");
        assert_eq!(record.priority, Some(0));
    }

    #[test]
    fn wire_record_accepts_numeric_id() {
        let raw = json!({
            "id": 812, "hostname": "www", "type": "A",
            "priority": 10, "destination": "mail.example.com"
        });
        let record = record_from_wire(&raw).unwrap();
        assert_eq!(record.id.as_deref(), Some("812"));
        assert_eq!(record.priority, Some(10));
    }

    #[test]
    fn record_to_wire_marks_deletion() {
        let record = DnsRecord {
            id: Some("7".into()),
            hostname: "home".into(),
            rtype: "A".into(),
            value: "203.0.113.5".into(),
            ttl: None,
            priority: None,
        };
        let wire = record_to_wire(&record, true);
        assert_eq!(wire["deleterecord"], json!(true));
        assert_eq!(wire["id"], json!("7"));
        assert_eq!(wire["destination"], json!("203.0.113.5"));
    }

    #[test]
    fn error_mapping_follows_taxonomy() {
        let refused = NetcupResponse {
            status: "error".into(),
            statuscode: 4013,
            longmessage: "Value in field not as expected".into(),
            responsedata: Value::Null,
        };
        assert!(matches!(map_error(&refused), Error::BackendRefused(_)));

        let missing = NetcupResponse {
            status: "error".into(),
            statuscode: 4010,
            longmessage: "Domain not found".into(),
            responsedata: Value::Null,
        };
        assert!(matches!(map_error(&missing), Error::ZoneNotFound(_)));

        let broken = NetcupResponse {
            status: "error".into(),
            statuscode: 5001,
            longmessage: "internal".into(),
            responsedata: Value::Null,
        };
        assert!(matches!(map_error(&broken), Error::BackendUnavailable(_)));
    }
}
