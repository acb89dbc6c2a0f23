//! DNS backend abstraction — pluggable upstream providers
//!
//! All tool sources sit behind the object-safe [`DnsBackend`] trait;
//! records are normalized to one shape regardless of vendor. The
//! [`ProviderRegistry`] is the process-wide table of built-in provider
//! implementations keyed by `provider_code`; every stored service config is
//! validated against its provider's schema before an instance is built.

mod netcup;
mod powerdns;
pub mod schema;

pub use netcup::NetcupBackend;
pub use powerdns::PowerDnsBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::store::{BackendService, ProviderCaps};
use crate::{Error, Result};

/// A DNS record normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DnsRecord {
    /// Provider record id; synthesized as `name:type` by providers whose
    /// API has no per-record identifier
    pub id: Option<String>,
    /// Hostname relative to the zone; `@` for the apex
    pub hostname: String,
    /// Record type, upper-case (`A`, `AAAA`, `TXT`, ...)
    pub rtype: String,
    /// Record data
    pub value: String,
    /// TTL in seconds when the provider exposes one per record
    pub ttl: Option<u32>,
    /// Priority for MX/SRV
    pub priority: Option<u32>,
}

/// Zone metadata normalized across providers.
///
/// `extra` carries vendor-specific fields verbatim; they are forwarded on
/// success responses and stripped from filtered ones.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ZoneInfo {
    /// Zone name
    pub name: String,
    /// Default TTL
    pub ttl: Option<u64>,
    /// SOA serial
    pub serial: Option<u64>,
    /// SOA refresh
    pub refresh: Option<u64>,
    /// SOA retry
    pub retry: Option<u64>,
    /// SOA expire
    pub expire: Option<u64>,
    /// DNSSEC enabled
    pub dnssec: Option<bool>,
    /// Vendor-specific passthrough fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Result of a connection test; the message is operator-facing.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// Whether the upstream accepted our credentials
    pub ok: bool,
    /// Human-readable detail
    pub message: String,
}

/// An upstream DNS provider instance bound to one credential set.
///
/// Implementations must be `Send + Sync + 'static` so they can be stored in
/// `Arc<dyn DnsBackend>` and shared across request tasks.
#[async_trait]
pub trait DnsBackend: Send + Sync + 'static {
    /// Stable code of the provider implementation.
    fn provider_code(&self) -> &'static str;

    /// Verify credentials against the upstream.
    async fn test_connection(&self) -> TestOutcome;

    /// Enumerate zones, for providers that support it.
    async fn list_zones(&self) -> Result<Vec<String>>;

    /// Check that the zone exists and our credentials may touch it.
    async fn validate_zone_access(&self, zone: &str) -> Result<()>;

    /// All records in a zone, normalized.
    async fn list_records(&self, zone: &str) -> Result<Vec<DnsRecord>>;

    /// One record by provider id.
    async fn get_record(&self, zone: &str, id: &str) -> Result<DnsRecord>;

    /// Create a record; returns it as stored upstream.
    async fn create_record(&self, zone: &str, record: &DnsRecord) -> Result<DnsRecord>;

    /// Update a record by id; returns it as stored upstream.
    async fn update_record(&self, zone: &str, id: &str, record: &DnsRecord) -> Result<DnsRecord>;

    /// Delete a record by id.
    async fn delete_record(&self, zone: &str, id: &str) -> Result<()>;

    /// Zone metadata.
    async fn get_zone_info(&self, zone: &str) -> Result<ZoneInfo>;
}

/// Shared plumbing handed to provider constructors.
#[derive(Clone)]
pub struct BackendEnv {
    /// Shared HTTP client (connection reuse across instances)
    pub client: reqwest::Client,
    /// Per-upstream-call deadline
    pub deadline: Duration,
}

type BuildFn = fn(&BackendEnv, &Value) -> Result<Arc<dyn DnsBackend>>;

/// A built-in provider implementation with its config schema.
#[derive(Clone)]
pub struct ProviderSpec {
    /// Stable code
    pub code: &'static str,
    /// Display name for the registry row
    pub display_name: &'static str,
    /// JSON Schema for service configs
    pub config_schema: Value,
    /// Declared capabilities
    pub caps: ProviderCaps,
    build: BuildFn,
}

/// Process-wide provider table plus an instance cache keyed by backend
/// service id. Instances are cached so the Netcup session and per-zone
/// locks survive across requests.
pub struct ProviderRegistry {
    env: BackendEnv,
    providers: HashMap<&'static str, ProviderSpec>,
    instances: DashMap<i64, Arc<dyn DnsBackend>>,
}

impl ProviderRegistry {
    /// Build the registry from the built-in set, honoring per-provider
    /// enable toggles.
    #[must_use]
    pub fn new(env: BackendEnv, netcup_enabled: bool, powerdns_enabled: bool) -> Self {
        let mut providers = HashMap::new();
        if netcup_enabled {
            let spec = netcup::provider_spec();
            providers.insert(spec.code, spec);
        }
        if powerdns_enabled {
            let spec = powerdns::provider_spec();
            providers.insert(spec.code, spec);
        }
        Self {
            env,
            providers,
            instances: DashMap::new(),
        }
    }

    /// All registered provider specs.
    pub fn specs(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.values()
    }

    /// Look up a provider spec by code.
    #[must_use]
    pub fn spec(&self, code: &str) -> Option<&ProviderSpec> {
        self.providers.get(code)
    }

    /// Validate a service config against its provider's schema.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] listing every violation.
    pub fn validate_config(&self, code: &str, config: &Value) -> Result<()> {
        let spec = self
            .spec(code)
            .ok_or_else(|| Error::Config(format!("unknown provider {code}")))?;
        schema::validate(&spec.config_schema, config)
    }

    /// Instantiate (or fetch the cached instance of) the backend for a
    /// stored service.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the stored config no longer satisfies the
    /// schema, [`Error::BackendUnavailable`] when the provider is not
    /// registered (disabled by toggle).
    pub fn instantiate(&self, code: &str, service: &BackendService) -> Result<Arc<dyn DnsBackend>> {
        if let Some(instance) = self.instances.get(&service.id) {
            return Ok(Arc::clone(&instance));
        }

        let spec = self.providers.get(code).ok_or_else(|| {
            Error::BackendUnavailable(format!("provider {code} is not enabled"))
        })?;
        schema::validate(&spec.config_schema, &service.config)?;
        let instance = (spec.build)(&self.env, &service.config)?;
        self.instances.insert(service.id, Arc::clone(&instance));
        Ok(instance)
    }

    /// Install a pre-built instance for a service id, bypassing
    /// construction. Used to pre-warm instances and to inject fakes in
    /// tests.
    pub fn preload(&self, service_id: i64, backend: Arc<dyn DnsBackend>) {
        self.instances.insert(service_id, backend);
    }

    /// Drop the cached instance after a service config change.
    pub fn invalidate(&self, service_id: i64) {
        self.instances.remove(&service_id);
    }
}

/// Join a relative hostname and a zone into an FQDN.
#[must_use]
pub fn fqdn(hostname: &str, zone: &str) -> String {
    if hostname.is_empty() || hostname == "@" {
        zone.to_string()
    } else {
        format!("{hostname}.{zone}")
    }
}

/// Split an FQDN into a hostname relative to `zone` (`@` at the apex).
/// Returns `None` when the name is outside the zone.
#[must_use]
pub fn relative_hostname(name: &str, zone: &str) -> Option<String> {
    let name = name.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if name.eq_ignore_ascii_case(zone) {
        return Some("@".to_string());
    }
    let suffix = format!(".{zone}");
    if name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
        Some(name[..name.len() - suffix.len()].to_string())
    } else {
        None
    }
}

/// Map an upstream HTTP status to the backend error taxonomy.
pub(crate) fn map_upstream_status(status: reqwest::StatusCode, context: &str) -> Error {
    if status.is_client_error() {
        Error::BackendRefused(format!("{context}: upstream returned {status}"))
    } else {
        Error::BackendUnavailable(format!("{context}: upstream returned {status}"))
    }
}

/// Schema helper: an object schema with required string properties.
pub(crate) fn object_schema(required: &[(&str, &str)], optional: &[(&str, &str)]) -> Value {
    let mut properties = serde_json::Map::new();
    for (name, desc) in required.iter().chain(optional) {
        properties.insert(
            (*name).to_string(),
            json!({"type": "string", "description": desc}),
        );
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        "additionalProperties": false,
    })
}
