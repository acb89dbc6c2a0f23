//! Realm / domain-root resolver
//!
//! Maps an authenticated token to the one backend that answers for it and
//! the one zone it is authoritative over. Resolution is deterministic and
//! total: every token either resolves or the request fails
//! `backend_unavailable` / `realm_not_found`.
//!
//! Realm-value legality is checked here too, at claim time, never per
//! request.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::backend::{DnsBackend, ProviderRegistry};
use crate::store::{ManagedDomainRoot, Operation, Realm, RealmType, Store, Token};
use crate::{Error, Result};

/// Maximum FQDN length accepted for a claimed name.
const MAX_FQDN_LEN: usize = 253;

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    // RFC 1035 label: letters/digits, optional inner hyphens, max 63 chars
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static label regex")
});

/// The policy a domain root imposes on everything claimed under it.
#[derive(Debug, Clone, Default)]
pub struct RootPolicy {
    /// Record types the root allows; empty allows all
    pub allowed_record_types: Vec<String>,
    /// Operations the root allows; empty allows all
    pub allowed_operations: Vec<Operation>,
}

impl RootPolicy {
    fn from_root(root: &ManagedDomainRoot) -> Self {
        Self {
            allowed_record_types: root.allowed_record_types.clone(),
            allowed_operations: root
                .allowed_operations
                .iter()
                .filter_map(|s| Operation::parse(s))
                .collect(),
        }
    }
}

/// Outcome of resolving a token's realm.
pub struct ResolvedRealm {
    /// The backend instance that answers for the zone
    pub backend: Arc<dyn DnsBackend>,
    /// The token's authoritative zone (caller-facing name space)
    pub zone: String,
    /// Base of the caller-facing name space: the root domain for platform
    /// realms, the user's own zone for BYOD realms
    pub caller_base: String,
    /// The upstream zone name to hand to the backend; differs from
    /// `caller_base` only when a root serves its domain out of a
    /// differently named upstream zone
    pub upstream_zone: String,
    /// Host vs subdomain gate semantics
    pub realm_type: RealmType,
    /// Root policy for platform realms
    pub root_policy: Option<RootPolicy>,
    /// Account owning the realm
    pub account_id: i64,
}

impl ResolvedRealm {
    /// Hostname of a caller-facing FQDN relative to the upstream zone.
    /// `None` when the name is outside the served base.
    #[must_use]
    pub fn upstream_hostname(&self, caller_fqdn: &str) -> Option<String> {
        crate::backend::relative_hostname(caller_fqdn, &self.caller_base)
    }
}

/// Resolver over the identity store and the provider registry.
#[derive(Clone)]
pub struct Resolver {
    store: Store,
    registry: Arc<ProviderRegistry>,
}

impl Resolver {
    /// Create a resolver.
    #[must_use]
    pub fn new(store: Store, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, registry }
    }

    /// Resolve a token to its backend and authoritative zone.
    ///
    /// # Errors
    ///
    /// [`Error::RealmNotFound`] when the realm is gone or inactive;
    /// [`Error::BackendUnavailable`] when the linked service, provider, or
    /// root is inactive or disabled.
    pub async fn resolve(&self, token: &Token) -> Result<ResolvedRealm> {
        let realm = match self.store.realm_by_id(token.realm_id).await {
            Ok(realm) => realm,
            Err(Error::NotFound(_)) => return Err(Error::RealmNotFound),
            Err(e) => return Err(e),
        };
        if !realm.is_active {
            return Err(Error::RealmNotFound);
        }

        if let Some(user_backend_id) = realm.user_backend_id {
            return self.resolve_user_backend(&realm, user_backend_id).await;
        }

        let root_id = realm.domain_root_id.ok_or(Error::RealmNotFound)?;
        self.resolve_platform_root(&realm, root_id).await
    }

    async fn resolve_user_backend(
        &self,
        realm: &Realm,
        service_id: i64,
    ) -> Result<ResolvedRealm> {
        let backend = self.instantiate_service(service_id).await?;
        let domain = realm
            .domain
            .as_deref()
            .ok_or_else(|| Error::Internal("user realm without domain".to_string()))?;
        let zone = join_zone(&realm.realm_value, domain);
        Ok(ResolvedRealm {
            backend,
            zone,
            caller_base: domain.to_string(),
            upstream_zone: domain.to_string(),
            realm_type: realm.realm_type,
            root_policy: None,
            account_id: realm.account_id,
        })
    }

    async fn resolve_platform_root(&self, realm: &Realm, root_id: i64) -> Result<ResolvedRealm> {
        let root = match self.store.domain_root_by_id(root_id).await {
            Ok(root) => root,
            Err(Error::NotFound(_)) => return Err(Error::RealmNotFound),
            Err(e) => return Err(e),
        };
        if !root.is_active {
            return Err(Error::BackendUnavailable(format!(
                "domain root {} is inactive",
                root.root_domain
            )));
        }

        let backend = self.instantiate_service(root.backend_service_id).await?;
        let zone = join_zone(&realm.realm_value, &root.root_domain);
        Ok(ResolvedRealm {
            backend,
            zone,
            caller_base: root.root_domain.clone(),
            upstream_zone: root.dns_zone.clone(),
            realm_type: realm.realm_type,
            root_policy: Some(RootPolicy::from_root(&root)),
            account_id: realm.account_id,
        })
    }

    async fn instantiate_service(&self, service_id: i64) -> Result<Arc<dyn DnsBackend>> {
        let service = match self.store.backend_service_by_id(service_id).await {
            Ok(service) => service,
            Err(Error::NotFound(_)) => {
                return Err(Error::BackendUnavailable(format!(
                    "backend service {service_id} is gone"
                )));
            }
            Err(e) => return Err(e),
        };
        if !service.is_active {
            return Err(Error::BackendUnavailable(format!(
                "backend service {} is inactive",
                service.service_name
            )));
        }
        let provider = self.store.provider_by_id(service.provider_id).await?;
        if !provider.is_enabled {
            return Err(Error::BackendUnavailable(format!(
                "provider {} is disabled",
                provider.provider_code
            )));
        }
        self.registry.instantiate(&provider.provider_code, &service)
    }
}

/// `realm_value + "." + base`, or `base` for an apex realm.
#[must_use]
pub fn join_zone(realm_value: &str, base: &str) -> String {
    if realm_value.is_empty() {
        base.to_string()
    } else {
        format!("{realm_value}.{base}")
    }
}

/// Whether one label satisfies RFC 1035 syntax.
#[must_use]
pub fn is_valid_label(label: &str) -> bool {
    LABEL_RE.is_match(label)
}

/// Check a claimed realm value against a root's depth window and label
/// syntax. `realm_value` is the label chain between the claim and the
/// root; the apex is the empty string at depth 0.
///
/// # Errors
///
/// [`Error::MalformedRequest`] describing the violated rule;
/// [`Error::PermissionDenied`] with `root_policy_refused` when the apex is
/// claimed on a root that forbids it.
pub fn validate_realm_value(realm_value: &str, root: &ManagedDomainRoot) -> Result<()> {
    if realm_value.is_empty() {
        if !root.allow_apex_access {
            return Err(Error::PermissionDenied(
                crate::error::DenyReason::RootPolicyRefused,
            ));
        }
        if root.min_subdomain_depth > 0 {
            return Err(Error::MalformedRequest(format!(
                "claims under {} need at least {} label(s)",
                root.root_domain, root.min_subdomain_depth
            )));
        }
        return Ok(());
    }

    let labels: Vec<&str> = realm_value.split('.').collect();
    let depth = labels.len() as i64;
    if depth < root.min_subdomain_depth || depth > root.max_subdomain_depth {
        return Err(Error::MalformedRequest(format!(
            "label depth {depth} outside [{}, {}]",
            root.min_subdomain_depth, root.max_subdomain_depth
        )));
    }

    for label in &labels {
        if !is_valid_label(label) {
            return Err(Error::MalformedRequest(format!("invalid label '{label}'")));
        }
    }

    let fqdn_len = realm_value.len() + 1 + root.root_domain.len();
    if fqdn_len > MAX_FQDN_LEN {
        return Err(Error::MalformedRequest(format!(
            "claimed name exceeds {MAX_FQDN_LEN} characters"
        )));
    }

    Ok(())
}
