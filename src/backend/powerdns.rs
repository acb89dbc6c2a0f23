//! PowerDNS Authoritative provider
//!
//! Speaks the RRset-oriented HTTP API. The upstream has no per-record
//! identifier, so record ids are synthesized as `hostname:TYPE`; an update
//! maps to a `REPLACE` changetype on the whole RRset and a delete to
//! `DELETE`. Reads and writes need no local serialization, the upstream is
//! authoritative for ordering.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{
    fqdn, map_upstream_status, relative_hostname, BackendEnv, DnsBackend, DnsRecord, ProviderSpec,
    TestOutcome, ZoneInfo,
};
use crate::store::ProviderCaps;
use crate::{Error, Result};

const DEFAULT_TTL: u32 = 300;

/// Registry entry for this provider.
pub(super) fn provider_spec() -> ProviderSpec {
    ProviderSpec {
        code: "powerdns",
        display_name: "PowerDNS Authoritative",
        config_schema: super::object_schema(
            &[
                ("api_url", "Base URL of the HTTP API, e.g. http://pdns:8081/api/v1"),
                ("api_key", "X-API-Key value"),
            ],
            &[("server_id", "Server id, defaults to 'localhost'")],
        ),
        caps: ProviderCaps {
            zone_list: true,
            zone_create: false,
            dnssec: true,
            record_types: ["A", "AAAA", "CNAME", "MX", "TXT", "SRV", "CAA", "NS", "PTR"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        },
        build: |env, config| Ok(Arc::new(PowerDnsBackend::new(env.clone(), config)?)),
    }
}

/// One PowerDNS API endpoint with its key.
pub struct PowerDnsBackend {
    env: BackendEnv,
    api_url: String,
    api_key: String,
    server_id: String,
}

impl PowerDnsBackend {
    fn new(env: BackendEnv, config: &Value) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| Error::Config(format!("powerdns config missing '{key}'")))
        };
        Ok(Self {
            api_url: get("api_url")?.trim_end_matches('/').to_string(),
            api_key: get("api_key")?,
            server_id: config
                .get("server_id")
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_string(),
            env,
        })
    }

    fn zone_url(&self, zone: &str) -> String {
        format!(
            "{}/servers/{}/zones/{}",
            self.api_url,
            self.server_id,
            canonical(zone)
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .env
            .client
            .get(url)
            .timeout(self.env.deadline)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ZoneNotFound(format!("powerdns: {url} not found")));
        }
        if !status.is_success() {
            return Err(map_upstream_status(status, "powerdns"));
        }
        response
            .json()
            .await
            .map_err(|e| Error::BackendProtocolError(format!("powerdns: {e}")))
    }

    async fn patch_rrsets(&self, zone: &str, rrsets: Value) -> Result<()> {
        let response = self
            .env
            .client
            .patch(self.zone_url(zone))
            .timeout(self.env.deadline)
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "rrsets": rrsets }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ZoneNotFound(format!("powerdns: zone {zone}")));
        }
        if !status.is_success() {
            return Err(map_upstream_status(status, "powerdns"));
        }
        Ok(())
    }

    async fn fetch_zone(&self, zone: &str) -> Result<Value> {
        self.get_json(&self.zone_url(zone)).await
    }

    /// Current contents of one RRset, if present.
    async fn fetch_rrset(&self, zone: &str, name: &str, rtype: &str) -> Result<Vec<Value>> {
        let detail = self.fetch_zone(zone).await?;
        let rrsets = detail
            .get("rrsets")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BackendProtocolError("powerdns zone has no rrsets".into()))?;
        Ok(rrsets
            .iter()
            .find(|rr| {
                rr.get("name").and_then(Value::as_str) == Some(name)
                    && rr.get("type").and_then(Value::as_str) == Some(rtype)
            })
            .and_then(|rr| rr.get("records").and_then(Value::as_array).cloned())
            .unwrap_or_default())
    }
}

fn canonical(zone: &str) -> String {
    let trimmed = zone.trim_end_matches('.');
    format!("{trimmed}.")
}

/// Synthesize the record id for an RRset.
fn synth_id(hostname: &str, rtype: &str) -> String {
    format!("{hostname}:{rtype}")
}

/// Parse a synthesized id back into `(hostname, type)`.
fn parse_id(id: &str) -> Result<(String, String)> {
    id.rsplit_once(':')
        .map(|(host, rtype)| (host.to_string(), rtype.to_uppercase()))
        .ok_or_else(|| Error::MalformedRequest(format!("bad record id '{id}'")))
}

fn records_from_zone(zone: &str, detail: &Value) -> Result<Vec<DnsRecord>> {
    let rrsets = detail
        .get("rrsets")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::BackendProtocolError("powerdns zone has no rrsets".into()))?;

    let mut out = Vec::new();
    for rrset in rrsets {
        let name = rrset
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BackendProtocolError("powerdns rrset has no name".into()))?;
        let rtype = rrset
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BackendProtocolError("powerdns rrset has no type".into()))?;
        if rtype == "SOA" {
            continue;
        }
        let Some(hostname) = relative_hostname(name, zone) else {
            continue;
        };
        let ttl = rrset
            .get("ttl")
            .and_then(Value::as_u64)
            .and_then(|t| u32::try_from(t).ok());
        for record in rrset
            .get("records")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(content) = record.get("content").and_then(Value::as_str) else {
                continue;
            };
            out.push(DnsRecord {
                id: Some(synth_id(&hostname, rtype)),
                hostname: hostname.clone(),
                rtype: rtype.to_string(),
                value: content.to_string(),
                ttl,
                priority: None,
            });
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl DnsBackend for PowerDnsBackend {
    fn provider_code(&self) -> &'static str {
        "powerdns"
    }

    async fn test_connection(&self) -> TestOutcome {
        let url = format!("{}/servers/{}", self.api_url, self.server_id);
        match self.get_json(&url).await {
            Ok(_) => TestOutcome {
                ok: true,
                message: "API key accepted".to_string(),
            },
            Err(e) => TestOutcome {
                ok: false,
                message: e.public_message(),
            },
        }
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        let url = format!("{}/servers/{}/zones", self.api_url, self.server_id);
        let zones = self.get_json(&url).await?;
        let list = zones
            .as_array()
            .ok_or_else(|| Error::BackendProtocolError("powerdns zones is not a list".into()))?;
        Ok(list
            .iter()
            .filter_map(|z| z.get("name").and_then(Value::as_str))
            .map(|n| n.trim_end_matches('.').to_string())
            .collect())
    }

    async fn validate_zone_access(&self, zone: &str) -> Result<()> {
        self.fetch_zone(zone).await.map(|_| ())
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        let detail = self.fetch_zone(zone).await?;
        records_from_zone(zone, &detail)
    }

    async fn get_record(&self, zone: &str, id: &str) -> Result<DnsRecord> {
        let (hostname, rtype) = parse_id(id)?;
        self.list_records(zone)
            .await?
            .into_iter()
            .find(|r| r.hostname == hostname && r.rtype == rtype)
            .ok_or_else(|| Error::NotFound(format!("record {id} in {zone}")))
    }

    async fn create_record(&self, zone: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let name = canonical(&fqdn(&record.hostname, zone));
        let mut contents = self.fetch_rrset(zone, &name, &record.rtype).await?;
        contents.push(json!({"content": record.value, "disabled": false}));

        self.patch_rrsets(
            zone,
            json!([{
                "name": name,
                "type": record.rtype,
                "ttl": record.ttl.unwrap_or(DEFAULT_TTL),
                "changetype": "REPLACE",
                "records": contents,
            }]),
        )
        .await?;

        let mut created = record.clone();
        created.id = Some(synth_id(&record.hostname, &record.rtype));
        Ok(created)
    }

    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        let (hostname, rtype) = parse_id(id)?;
        let name = canonical(&fqdn(&hostname, zone));

        self.patch_rrsets(
            zone,
            json!([{
                "name": name,
                "type": rtype,
                "ttl": record.ttl.unwrap_or(DEFAULT_TTL),
                "changetype": "REPLACE",
                "records": [{"content": record.value, "disabled": false}],
            }]),
        )
        .await?;

        let mut updated = record.clone();
        updated.hostname = hostname;
        updated.rtype = rtype;
        updated.id = Some(id.to_string());
        Ok(updated)
    }

    async fn delete_record(&self, zone: &str, id: &str) -> Result<()> {
        let (hostname, rtype) = parse_id(id)?;
        let name = canonical(&fqdn(&hostname, zone));

        self.patch_rrsets(
            zone,
            json!([{
                "name": name,
                "type": rtype,
                "changetype": "DELETE",
                "records": [],
            }]),
        )
        .await
    }

    async fn get_zone_info(&self, zone: &str) -> Result<ZoneInfo> {
        let detail = self.fetch_zone(zone).await?;
        let mut extra = serde_json::Map::new();
        for key in ["kind", "account", "masters"] {
            if let Some(value) = detail.get(key) {
                extra.insert(key.to_string(), value.clone());
            }
        }
        Ok(ZoneInfo {
            name: detail
                .get("name")
                .and_then(Value::as_str)
                .map_or_else(|| zone.to_string(), |n| n.trim_end_matches('.').to_string()),
            ttl: None,
            serial: detail.get("serial").and_then(Value::as_u64),
            refresh: None,
            retry: None,
            expire: None,
            dnssec: detail.get("dnssec").and_then(Value::as_bool),
            extra,
        })
    }
}
