//! Permission engine and origin matcher
//!
//! Authorization runs in fixed gate order: token gate (active, unexpired,
//! origin), operation gate, record-type gate, zone gate, root-policy
//! intersection. The decision function is pure over a prepared
//! [`PermissionCtx`], so identical inputs always produce identical
//! decisions; the only async part is origin resolution, which happens once
//! per request before the context is built.
//!
//! Zone addressing is bidirectional: a request may name the token's
//! authoritative zone (or a subdomain of it), or an ancestor zone that
//! contains it. In the ancestor case every individual record the request
//! touches or returns must still fall inside the authoritative zone; reads
//! are filtered down to that set, mutations reject the whole request on
//! the first violating record.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hickory_resolver::TokioResolver;
use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::DnsRecord;
use crate::error::DenyReason;
use crate::resolver::RootPolicy;
use crate::store::{Operation, RealmType, Token};
use crate::{Error, Result};

/// How long resolved origin hostnames stay fresh.
pub const ORIGIN_CACHE_TTL: Duration = Duration::from_secs(300);

const ORIGIN_CACHE_CAPACITY: usize = 256;

/// Everything the pure decision function needs about one request.
pub struct PermissionCtx {
    /// Whether the token row is active
    pub token_active: bool,
    /// Whether the token is past its expiry
    pub token_expired: bool,
    /// Whether the caller's origin matched the allowlist
    pub origin_allowed: bool,
    /// Token operation set; empty inherits
    pub operations: Vec<Operation>,
    /// Token record-type set; empty inherits
    pub record_types: Vec<String>,
    /// The token's authoritative zone
    pub zone: String,
    /// Host vs subdomain semantics
    pub realm_type: RealmType,
    /// Root policy to intersect with, for platform realms
    pub root_policy: Option<RootPolicy>,
}

impl PermissionCtx {
    /// Build the context from an authenticated token and its resolution.
    #[must_use]
    pub fn new(
        token: &Token,
        zone: String,
        realm_type: RealmType,
        root_policy: Option<RootPolicy>,
        origin_allowed: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_active: token.is_active,
            token_expired: token.is_expired(now),
            origin_allowed,
            operations: token.operations.clone(),
            record_types: token.record_types.clone(),
            zone,
            realm_type,
            root_policy,
        }
    }

    /// Token gate: active, unexpired, origin accepted.
    fn token_gate(&self) -> Result<()> {
        if !self.token_active {
            return Err(Error::InvalidToken);
        }
        if self.token_expired {
            return Err(Error::TokenExpired);
        }
        if !self.origin_allowed {
            return Err(Error::PermissionDenied(DenyReason::OriginNotAllowed));
        }
        Ok(())
    }

    /// Operation gate plus root-policy intersection.
    fn operation_gate(&self, op: Operation) -> Result<()> {
        if !self.operations.is_empty() && !self.operations.contains(&op) {
            return Err(Error::PermissionDenied(DenyReason::OperationNotAllowed));
        }
        if let Some(ref root) = self.root_policy {
            if !root.allowed_operations.is_empty() && !root.allowed_operations.contains(&op) {
                return Err(Error::PermissionDenied(DenyReason::RootPolicyRefused));
            }
        }
        Ok(())
    }

    /// Record-type gate plus root-policy intersection.
    fn record_type_gate(&self, rtype: &str) -> Result<()> {
        let matches = |set: &[String]| set.iter().any(|t| t.eq_ignore_ascii_case(rtype));
        if !self.record_types.is_empty() && !matches(&self.record_types) {
            return Err(Error::PermissionDenied(DenyReason::RecordTypeNotAllowed));
        }
        if let Some(ref root) = self.root_policy {
            if !root.allowed_record_types.is_empty() && !matches(&root.allowed_record_types) {
                return Err(Error::PermissionDenied(DenyReason::RootPolicyRefused));
            }
        }
        Ok(())
    }

    /// Gate a request addressing `domainname` with operation `op`.
    ///
    /// # Errors
    ///
    /// A taxonomy error for the first failing gate.
    pub fn check_request(&self, op: Operation, domainname: &str) -> Result<()> {
        self.token_gate()?;
        self.operation_gate(op)?;

        let target = normalize_name(domainname);
        let addresses_realm = self.name_in_realm(&target);
        let realm_inside_target = within_zone(&target, &self.zone);
        if !addresses_realm && !realm_inside_target {
            return Err(Error::PermissionDenied(DenyReason::ZoneNotInRealm));
        }
        Ok(())
    }

    /// Gate a request addressing `domainname` without an operation gate.
    ///
    /// `updateDnsRecords` carries mixed per-record operations; the
    /// operation and record-type gates run per record instead.
    ///
    /// # Errors
    ///
    /// A taxonomy error for the first failing gate.
    pub fn check_zone(&self, domainname: &str) -> Result<()> {
        self.token_gate()?;
        let target = normalize_name(domainname);
        if !self.name_in_realm(&target) && !within_zone(&target, &self.zone) {
            return Err(Error::PermissionDenied(DenyReason::ZoneNotInRealm));
        }
        Ok(())
    }

    /// Gate one record (by FQDN and type) with operation `op`.
    ///
    /// # Errors
    ///
    /// A taxonomy error for the first failing gate.
    pub fn check_record(&self, op: Operation, record_fqdn: &str, rtype: &str) -> Result<()> {
        self.token_gate()?;
        self.operation_gate(op)?;
        self.record_type_gate(rtype)?;

        if !self.name_in_realm(&normalize_name(record_fqdn)) {
            return Err(Error::PermissionDenied(DenyReason::ZoneNotInRealm));
        }
        Ok(())
    }

    /// Whether a name is inside the realm's authority: equal to the zone,
    /// or below it for subdomain realms.
    fn name_in_realm(&self, name: &str) -> bool {
        match self.realm_type {
            RealmType::Host => name == self.zone,
            RealmType::Subdomain => within_zone(self.zone.as_str(), name),
        }
    }

    /// Drop records the token may not individually read. Records carry
    /// hostnames relative to `query_zone`.
    #[must_use]
    pub fn filter_records(&self, query_zone: &str, records: Vec<DnsRecord>) -> Vec<DnsRecord> {
        records
            .into_iter()
            .filter(|record| {
                let fqdn = crate::backend::fqdn(&record.hostname, query_zone);
                self.check_record(Operation::Read, &fqdn, &record.rtype).is_ok()
            })
            .collect()
    }
}

/// `name` equals `zone` or sits below it on a label boundary.
#[must_use]
pub fn within_zone(zone: &str, name: &str) -> bool {
    let zone = normalize_name(zone);
    let name = normalize_name(name);
    name == zone || name.ends_with(&format!(".{zone}"))
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Origin matching
// ---------------------------------------------------------------------------

/// Classify a static allowlist entry against the caller's address without
/// touching DNS. Returns `None` when the entry needs resolution.
fn match_static(entry: &str, ip: IpAddr) -> Option<bool> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net.contains(&ip));
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return Some(addr == ip);
    }
    None
}

enum CacheKey {
    Forward(String),
    Reverse(IpAddr),
}

impl CacheKey {
    fn as_string(&self) -> String {
        match self {
            Self::Forward(host) => format!("f:{host}"),
            Self::Reverse(ip) => format!("r:{ip}"),
        }
    }
}

/// Origin allowlist matcher with a bounded, TTL-stamped resolution cache.
///
/// CIDR and literal-address entries match numerically. Hostname entries
/// resolve to A/AAAA once per [`ORIGIN_CACHE_TTL`] and match exactly
/// against the resolved set. Wildcard entries (`*.suffix`) match by suffix
/// on the reverse PTR name of the source address, never on forward
/// resolution.
pub struct OriginMatcher {
    resolver: Option<Arc<TokioResolver>>,
    cache: Mutex<LruCache<String, (Instant, Vec<String>)>>,
    ttl: Duration,
}

impl OriginMatcher {
    /// Build a matcher using the system resolver configuration.
    #[must_use]
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_tokio()
            .map(|builder| Arc::new(builder.build()))
            .map_err(|e| {
                debug!(error = %e, "system resolver unavailable, hostname origins will not match");
                e
            })
            .ok();
        Self::with_resolver(resolver)
    }

    /// Build with an explicit (or absent) resolver; tests pass `None`.
    #[must_use]
    pub fn with_resolver(resolver: Option<Arc<TokioResolver>>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(ORIGIN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl: ORIGIN_CACHE_TTL,
        }
    }

    /// Whether `source_ip` matches the allowlist. Empty allowlists accept
    /// every origin.
    pub async fn origin_allowed(&self, allowed: &[String], source_ip: IpAddr) -> bool {
        if allowed.is_empty() {
            return true;
        }

        for entry in allowed {
            if let Some(matched) = match_static(entry, source_ip) {
                if matched {
                    return true;
                }
                continue;
            }

            if let Some(suffix) = entry.strip_prefix("*.") {
                if self.reverse_matches(source_ip, suffix).await {
                    return true;
                }
                continue;
            }

            if self.forward_matches(entry, source_ip).await {
                return true;
            }
        }
        false
    }

    async fn forward_matches(&self, host: &str, source_ip: IpAddr) -> bool {
        let key = CacheKey::Forward(host.to_ascii_lowercase()).as_string();
        if let Some(cached) = self.cache_get(&key) {
            return cached.contains(&source_ip.to_string());
        }

        let Some(ref resolver) = self.resolver else {
            return false;
        };
        let resolved: Vec<String> = match resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().map(|ip| ip.to_string()).collect(),
            Err(e) => {
                debug!(host, error = %e, "origin forward resolution failed");
                Vec::new()
            }
        };
        let matched = resolved.contains(&source_ip.to_string());
        self.cache_put(key, resolved);
        matched
    }

    async fn reverse_matches(&self, source_ip: IpAddr, suffix: &str) -> bool {
        let key = CacheKey::Reverse(source_ip).as_string();
        let names = if let Some(cached) = self.cache_get(&key) {
            cached
        } else {
            let Some(ref resolver) = self.resolver else {
                return false;
            };
            let names: Vec<String> = match resolver.reverse_lookup(source_ip).await {
                Ok(lookup) => lookup
                    .iter()
                    .map(|ptr| ptr.to_string().trim_end_matches('.').to_ascii_lowercase())
                    .collect(),
                Err(e) => {
                    debug!(ip = %source_ip, error = %e, "origin reverse resolution failed");
                    Vec::new()
                }
            };
            self.cache_put(key, names.clone());
            names
        };

        let suffix = suffix.to_ascii_lowercase();
        names
            .iter()
            .any(|name| name.ends_with(&format!(".{suffix}")) || name == &suffix)
    }

    fn cache_get(&self, key: &str) -> Option<Vec<String>> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some((stamp, values)) if stamp.elapsed() < self.ttl => Some(values.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, values: Vec<String>) {
        self.cache.lock().put(key, (Instant::now(), values));
    }
}

impl Default for OriginMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(realm_type: RealmType, zone: &str) -> PermissionCtx {
        PermissionCtx {
            token_active: true,
            token_expired: false,
            origin_allowed: true,
            operations: vec![Operation::Read],
            record_types: vec!["A".into()],
            zone: zone.into(),
            realm_type,
            root_policy: None,
        }
    }

    #[test]
    fn within_zone_respects_label_boundaries() {
        assert!(within_zone("example.com", "example.com"));
        assert!(within_zone("example.com", "home.example.com"));
        assert!(within_zone("example.com", "a.b.example.com"));
        assert!(!within_zone("example.com", "notexample.com"));
        assert!(!within_zone("home.example.com", "example.com"));
    }

    #[test]
    fn host_realm_accepts_its_zone_and_ancestors() {
        // GIVEN: a host realm on home.example.com
        let ctx = ctx(RealmType::Host, "home.example.com");

        // THEN: the realm itself and the containing zone are addressable
        assert!(ctx.check_request(Operation::Read, "home.example.com").is_ok());
        assert!(ctx.check_request(Operation::Read, "example.com").is_ok());

        // AND: a sibling zone is not
        let err = ctx
            .check_request(Operation::Read, "other.example.com")
            .unwrap_err();
        assert_eq!(err.reason(), "zone_not_in_realm");
    }

    #[test]
    fn host_realm_record_checks_require_exact_name() {
        let ctx = ctx(RealmType::Host, "home.example.com");
        assert!(ctx.check_record(Operation::Read, "home.example.com", "A").is_ok());
        assert!(ctx
            .check_record(Operation::Read, "www.example.com", "A")
            .is_err());
        assert!(ctx
            .check_record(Operation::Read, "sub.home.example.com", "A")
            .is_err());
    }

    #[test]
    fn subdomain_realm_accepts_strict_subdomains() {
        let mut ctx = ctx(RealmType::Subdomain, "dyn.example.com");
        ctx.operations = vec![Operation::Read, Operation::Update];
        ctx.record_types = vec!["A".into(), "AAAA".into()];

        assert!(ctx
            .check_record(Operation::Update, "myhost.dyn.example.com", "A")
            .is_ok());
        let err = ctx
            .check_record(Operation::Update, "foo.example.com", "A")
            .unwrap_err();
        assert_eq!(err.reason(), "zone_not_in_realm");
    }

    #[test]
    fn operation_gate_precedes_zone_gate() {
        // GIVEN: a read-only token addressing its own realm with update
        let ctx = ctx(RealmType::Host, "home.example.com");
        let err = ctx
            .check_request(Operation::Update, "home.example.com")
            .unwrap_err();
        assert_eq!(err.reason(), "operation_not_allowed");
    }

    #[test]
    fn record_type_gate_applies_to_records() {
        let ctx = ctx(RealmType::Host, "home.example.com");
        let err = ctx
            .check_record(Operation::Read, "home.example.com", "TXT")
            .unwrap_err();
        assert_eq!(err.reason(), "record_type_not_allowed");
    }

    #[test]
    fn root_policy_intersects_token_policy() {
        // GIVEN: a token allowed update, under a root that only allows read
        let mut ctx = ctx(RealmType::Subdomain, "dyn.example.com");
        ctx.operations = vec![Operation::Read, Operation::Update];
        ctx.root_policy = Some(RootPolicy {
            allowed_record_types: vec!["A".into()],
            allowed_operations: vec![Operation::Read],
        });

        // THEN: update is refused by the root, not the token
        let err = ctx
            .check_request(Operation::Update, "dyn.example.com")
            .unwrap_err();
        assert_eq!(err.reason(), "root_policy_refused");

        // AND: a type the token allows but the root does not is refused
        ctx.record_types = vec!["A".into(), "TXT".into()];
        let err = ctx
            .check_record(Operation::Read, "x.dyn.example.com", "TXT")
            .unwrap_err();
        assert_eq!(err.reason(), "root_policy_refused");
    }

    #[test]
    fn empty_sets_inherit_everything() {
        let mut ctx = ctx(RealmType::Subdomain, "dyn.example.com");
        ctx.operations = vec![];
        ctx.record_types = vec![];
        assert!(ctx
            .check_record(Operation::Delete, "x.dyn.example.com", "SRV")
            .is_ok());
    }

    #[test]
    fn inactive_expired_and_origin_gates_order() {
        let mut ctx = ctx(RealmType::Host, "home.example.com");
        ctx.token_active = false;
        assert!(matches!(
            ctx.check_request(Operation::Read, "home.example.com"),
            Err(Error::InvalidToken)
        ));

        ctx.token_active = true;
        ctx.token_expired = true;
        assert!(matches!(
            ctx.check_request(Operation::Read, "home.example.com"),
            Err(Error::TokenExpired)
        ));

        ctx.token_expired = false;
        ctx.origin_allowed = false;
        let err = ctx
            .check_request(Operation::Read, "home.example.com")
            .unwrap_err();
        assert_eq!(err.reason(), "origin_not_allowed");
    }

    #[test]
    fn decision_is_pure() {
        let ctx = ctx(RealmType::Host, "home.example.com");
        for _ in 0..3 {
            assert!(ctx.check_request(Operation::Read, "example.com").is_ok());
            assert_eq!(
                ctx.check_request(Operation::Update, "example.com")
                    .unwrap_err()
                    .reason(),
                "operation_not_allowed"
            );
        }
    }

    #[test]
    fn filtering_applies_least_privilege() {
        // GIVEN: records in example.com and a host realm on home.example.com
        let ctx = ctx(RealmType::Host, "home.example.com");
        let records = vec![
            DnsRecord {
                id: Some("1".into()),
                hostname: "home".into(),
                rtype: "A".into(),
                value: "192.0.2.1".into(),
                ttl: None,
                priority: None,
            },
            DnsRecord {
                id: Some("2".into()),
                hostname: "www".into(),
                rtype: "A".into(),
                value: "192.0.2.2".into(),
                ttl: None,
                priority: None,
            },
            DnsRecord {
                id: Some("3".into()),
                hostname: "home".into(),
                rtype: "TXT".into(),
                value: "v=spf1".into(),
                ttl: None,
                priority: None,
            },
        ];

        // WHEN: filtering a read of zone example.com
        let kept = ctx.filter_records("example.com", records);

        // THEN: only the home/A record survives
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id.as_deref(), Some("1"));
    }

    #[test]
    fn static_origin_entries_match_numerically() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        assert_eq!(match_static("192.0.2.0/24", ip), Some(true));
        assert_eq!(match_static("192.0.3.0/24", ip), Some(false));
        assert_eq!(match_static("192.0.2.10", ip), Some(true));
        assert_eq!(match_static("192.0.2.11", ip), Some(false));
        // hostnames defer to resolution
        assert_eq!(match_static("client.example.net", ip), None);
        assert_eq!(match_static("*.example.net", ip), None);
    }

    #[tokio::test]
    async fn empty_allowlist_accepts_everything() {
        let matcher = OriginMatcher::with_resolver(None);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        assert!(matcher.origin_allowed(&[], ip).await);
    }

    #[tokio::test]
    async fn cidr_allowlist_without_resolver() {
        let matcher = OriginMatcher::with_resolver(None);
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(
            matcher
                .origin_allowed(&["10.0.0.0/8".to_string()], ip)
                .await
        );
        assert!(
            !matcher
                .origin_allowed(&["172.16.0.0/12".to_string()], ip)
                .await
        );
        // a hostname entry cannot match with no resolver available
        assert!(
            !matcher
                .origin_allowed(&["client.example.net".to_string()], ip)
                .await
        );
    }
}
