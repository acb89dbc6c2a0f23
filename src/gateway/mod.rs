//! Request pipeline and interactive surface
//!
//! The [`Application`] value is the explicit replacement for global
//! singletons: it holds the store handle, provider registry, rate-limit
//! state, session store, origin matcher, and notification queue, and is
//! passed into every handler as axum state.

pub mod admin;
pub mod api;
pub mod server;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::{BackendEnv, ProviderRegistry};
use crate::config::Config;
use crate::notify::Notifier;
use crate::policy::OriginMatcher;
use crate::ratelimit::IpRateLimiter;
use crate::resolver::Resolver;
use crate::secrets::SecretEngine;
use crate::store::Store;
use crate::Result;

pub use server::serve;
pub use session::SessionStore;

/// Shared application state, constructed once at startup.
pub struct Application {
    /// Validated configuration
    pub config: Config,
    /// Identity store
    pub store: Store,
    /// Provider registry + instance cache
    pub registry: Arc<ProviderRegistry>,
    /// Token → backend/zone resolver
    pub resolver: Resolver,
    /// Credential engine
    pub secrets: SecretEngine,
    /// Per-IP rate limiter
    pub limiter: Arc<IpRateLimiter>,
    /// Origin allowlist matcher
    pub origins: OriginMatcher,
    /// Interactive session store
    pub sessions: SessionStore,
    /// Notification queue handle
    pub notifier: Notifier,
    /// Shutdown broadcast; background tasks subscribe to it
    pub shutdown: tokio::sync::broadcast::Sender<()>,
}

/// Shared handle passed to handlers.
pub type App = Arc<Application>;

/// Handler error wrapper mapping the taxonomy onto the wire envelope.
///
/// Internal errors get a correlation id: it is logged with the full
/// detail, returned in `X-Correlation-Id`, and the body stays generic.
pub struct Failure(pub crate::Error);

impl<E: Into<crate::Error>> From<E> for Failure {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl axum::response::IntoResponse for Failure {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::response::IntoResponse as _;

        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "status": "error",
            "reason": err.reason(),
            "message": err.public_message(),
            "responsedata": serde_json::Value::Null,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation = uuid::Uuid::new_v4().to_string();
            tracing::error!(correlation_id = %correlation, error = %err, "internal error");
            if let Ok(value) = correlation.parse() {
                response.headers_mut().insert("x-correlation-id", value);
            }
        }
        if let crate::Error::RateLimited(retry_after) = err {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Result alias for axum handlers.
pub type HandlerResult<T> = std::result::Result<T, Failure>;

impl Application {
    /// Wire up every subsystem: open the store, run migrations and
    /// bootstrap seeding, build the provider registry, start the
    /// notification workers and background sweepers.
    ///
    /// # Errors
    ///
    /// Propagates configuration, migration, and storage errors; the caller
    /// maps them to exit codes.
    pub async fn build(config: Config) -> Result<App> {
        let (shutdown, _) = tokio::sync::broadcast::channel(1);

        let store = Store::open(&config.db_path).await?;
        let secrets = SecretEngine::new(config.bcrypt_cost)?;

        let env = BackendEnv {
            client: reqwest::Client::new(),
            deadline: Duration::from_millis(config.deadline_ms_backend),
        };
        let registry = Arc::new(ProviderRegistry::new(
            env,
            config.provider_netcup_enabled,
            config.provider_powerdns_enabled,
        ));

        crate::bootstrap::run(&store, &registry, &config, &secrets).await?;

        let resolver = Resolver::new(store.clone(), Arc::clone(&registry));
        let limiter = Arc::new(IpRateLimiter::new(
            config.rate_limit_per_min,
            config.rate_limit_per_hour,
        ));
        crate::ratelimit::spawn_sweeper(
            Arc::clone(&limiter),
            Duration::from_secs(300),
            shutdown.subscribe(),
        );

        let sessions = SessionStore::new(
            config.secret_key.as_bytes(),
            Duration::from_secs(config.session_idle_sec),
            Duration::from_secs(config.session_absolute_sec),
        );
        session::spawn_reaper(sessions.clone(), Duration::from_secs(60), shutdown.subscribe());

        let notifier = match config.smtp() {
            Some(smtp) => {
                info!(host = %smtp.host, workers = smtp.workers, "SMTP notifications enabled");
                Notifier::start(smtp, shutdown.clone())
            }
            None => {
                info!("SMTP not configured, notifications disabled");
                Notifier::disabled()
            }
        };

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            resolver,
            secrets,
            limiter,
            origins: OriginMatcher::new(),
            sessions,
            notifier,
            shutdown,
        }))
    }
}
