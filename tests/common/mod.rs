//! Shared harness for integration tests: a gateway on an ephemeral port
//! backed by a fake upstream provider.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use dns_gateway::backend::{DnsBackend, DnsRecord, TestOutcome, ZoneInfo};
use dns_gateway::config::{Config, CookieSecure};
use dns_gateway::gateway::{self, App};
use dns_gateway::store::{AuditEntry, NewRealm, NewToken, Operation, OwnerType, RealmType, Visibility};
use dns_gateway::{Error, Result};

/// In-memory fake upstream. Starts with a canned record set and mutates
/// it like a real zone; `fail` simulates an unreachable provider.
pub struct FakeBackend {
    pub records: Mutex<Vec<DnsRecord>>,
    pub fail: bool,
    next_id: Mutex<u64>,
}

impl FakeBackend {
    pub fn with_records(records: Vec<DnsRecord>) -> Arc<Self> {
        Arc::new(Self {
            next_id: Mutex::new(records.len() as u64 + 1),
            records: Mutex::new(records),
            fail: false,
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            fail: true,
            next_id: Mutex::new(1),
        })
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            Err(Error::BackendUnavailable("fake upstream down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DnsBackend for FakeBackend {
    fn provider_code(&self) -> &'static str {
        "fake"
    }

    async fn test_connection(&self) -> TestOutcome {
        TestOutcome {
            ok: !self.fail,
            message: String::new(),
        }
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(vec![])
    }

    async fn validate_zone_access(&self, _zone: &str) -> Result<()> {
        self.check()
    }

    async fn list_records(&self, _zone: &str) -> Result<Vec<DnsRecord>> {
        self.check()?;
        Ok(self.records.lock().clone())
    }

    async fn get_record(&self, _zone: &str, id: &str) -> Result<DnsRecord> {
        self.check()?;
        self.records
            .lock()
            .iter()
            .find(|r| r.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn create_record(&self, _zone: &str, record: &DnsRecord) -> Result<DnsRecord> {
        self.check()?;
        let mut next = self.next_id.lock();
        let mut created = record.clone();
        created.id = Some(next.to_string());
        *next += 1;
        self.records.lock().push(created.clone());
        Ok(created)
    }

    async fn update_record(&self, _zone: &str, id: &str, record: &DnsRecord) -> Result<DnsRecord> {
        self.check()?;
        let mut records = self.records.lock();
        let slot = records
            .iter_mut()
            .find(|r| r.id.as_deref() == Some(id))
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let mut updated = record.clone();
        updated.id = Some(id.to_string());
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete_record(&self, _zone: &str, id: &str) -> Result<()> {
        self.check()?;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.id.as_deref() != Some(id));
        if records.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_zone_info(&self, zone: &str) -> Result<ZoneInfo> {
        self.check()?;
        let mut extra = serde_json::Map::new();
        extra.insert("dnssecstatus".into(), serde_json::json!(false));
        Ok(ZoneInfo {
            name: zone.to_string(),
            ttl: Some(3600),
            serial: Some(2026010101),
            refresh: Some(28800),
            retry: Some(7200),
            expire: Some(1209600),
            dnssec: Some(false),
            extra,
        })
    }
}

pub fn record(id: &str, hostname: &str, rtype: &str, value: &str) -> DnsRecord {
    DnsRecord {
        id: Some(id.to_string()),
        hostname: hostname.to_string(),
        rtype: rtype.to_string(),
        value: value.to_string(),
        ttl: Some(300),
        priority: None,
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        db_path: dir.path().join("gw.db").to_string_lossy().into_owned(),
        secret_key: "0123456789abcdef0123456789abcdef".into(),
        admin_username: "admin".into(),
        admin_password: "initial-password-1".into(),
        bind_addr: "127.0.0.1".into(),
        bind_port: 0,
        deadline_ms_api: 5000,
        deadline_ms_backend: 2000,
        max_body_bytes: 4096,
        max_records_per_request: 5,
        rate_limit_per_min: 100,
        rate_limit_per_hour: 10_000,
        session_idle_sec: 1800,
        session_absolute_sec: 43_200,
        cookie_secure: CookieSecure::Auto,
        login_lockout_fails: 3,
        login_lockout_window_sec: 900,
        login_lockout_duration_sec: 900,
        bcrypt_cost: 4,
        seed_sample: false,
        provider_netcup_enabled: true,
        provider_powerdns_enabled: true,
        smtp_host: None,
        smtp_port: 587,
        smtp_username: None,
        smtp_password: None,
        smtp_from: None,
        smtp_admin_to: None,
        smtp_send_delay_ms: 0,
        smtp_workers: 1,
    }
}

/// A running gateway plus the ids of the fixture chain it was seeded with.
pub struct Harness {
    pub app: App,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub _dir: tempfile::TempDir,
}

impl Harness {
    /// Boot a gateway with default test config and serve it on an
    /// ephemeral port.
    pub async fn start_default() -> Self {
        Self::start(|_| {}).await
    }

    /// Boot a gateway, letting the caller tweak the config first.
    pub async fn start(mutate: impl FnOnce(&mut Config)) -> Self {
        let dir_holder = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir_holder);
        mutate(&mut config);
        let app = gateway::Application::build(config).await.unwrap();

        let router = gateway::server::router(Arc::clone(&app));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            app,
            addr,
            client: reqwest::Client::new(),
            _dir: dir_holder,
        }
    }

    /// Create a platform service + root + realm + token chain wired to
    /// `backend`, returning the token plaintext.
    pub async fn seed_platform_token(
        &self,
        root_domain: &str,
        realm_value: &str,
        realm_type: RealmType,
        operations: Vec<Operation>,
        record_types: Vec<String>,
        allowed_origins: Vec<String>,
        backend: Arc<dyn DnsBackend>,
    ) -> String {
        let store = &self.app.store;
        let admin = store.account_by_username("admin").await.unwrap().unwrap();

        let provider = store
            .provider_by_code("powerdns")
            .await
            .unwrap()
            .expect("provider seeded");
        let service = store
            .create_backend_service(
                provider.id,
                &format!("svc-{root_domain}-{realm_value}"),
                OwnerType::Platform,
                None,
                &serde_json::json!({
                    "api_url": "http://127.0.0.1:1/api/v1",
                    "api_key": "unused",
                }),
                false,
                AuditEntry::success("service_create", "local"),
            )
            .await
            .unwrap();
        self.app.registry.preload(service.id, backend);

        let root = store
            .create_domain_root(
                service.id,
                root_domain,
                root_domain,
                Visibility::Public,
                true,
                (0, 3),
                &[],
                &[],
                AuditEntry::success("root_create", "local"),
            )
            .await
            .unwrap();

        let realm = store
            .claim_realm(
                &NewRealm {
                    account_id: admin.id,
                    realm_value: realm_value.to_string(),
                    realm_type,
                    domain: None,
                    domain_root_id: Some(root.id),
                    user_backend_id: None,
                },
                AuditEntry::success("realm_claim", "local"),
            )
            .await
            .unwrap();

        let generated = self.app.secrets.generate_token().await.unwrap();
        store
            .create_token(
                &NewToken {
                    realm_id: realm.id,
                    record_types,
                    operations,
                    allowed_origins,
                    expires_at: None,
                    email_on_use: false,
                },
                &generated.prefix,
                &generated.hash,
                AuditEntry::success("token_create", "local"),
            )
            .await
            .unwrap();

        generated.plaintext
    }

    /// POST an action to /api with a bearer token.
    pub async fn api(
        &self,
        token: &str,
        action: &str,
        param: serde_json::Value,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let response = self
            .client
            .post(format!("http://{}/api", self.addr))
            .bearer_auth(token)
            .json(&serde_json::json!({"action": action, "param": param}))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }
}
