//! HTTP server assembly
//!
//! Builds the axum router with the fixed middleware order (trace →
//! request-id → timeout → body-limit → handler; rate limiting and
//! authentication run inside the API pipeline so their refusals are
//! audited) and runs it with graceful shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{admin, api, session, App};
use crate::{Error, Result};

/// Build the full route table.
#[must_use]
pub fn router(app: App) -> Router {
    let deadline = Duration::from_millis(app.config.deadline_ms_api);
    let body_limit = app.config.max_body_bytes;

    Router::new()
        .route("/api", post(api::handle_api))
        .route("/healthz", get(healthz))
        .route("/session/login", post(session::login))
        .route("/session/logout", post(session::logout))
        .route("/session/password", post(session::change_password))
        .route("/session/totp/setup", post(session::totp_setup))
        .route("/session/totp/enable", post(session::totp_enable))
        .route("/session/totp/verify", post(session::totp_verify))
        .route(
            "/admin/accounts",
            get(admin::list_accounts).post(admin::create_account),
        )
        .route(
            "/admin/accounts/{id}",
            patch(admin::patch_account).delete(admin::delete_account),
        )
        .route(
            "/admin/realms",
            get(admin::list_realms).post(admin::claim_realm),
        )
        .route("/admin/realms/{id}", delete(admin::delete_realm))
        .route("/admin/realms/{id}/tokens", get(admin::list_tokens))
        .route("/admin/tokens", post(admin::create_token))
        .route("/admin/tokens/{id}", delete(admin::revoke_token))
        .route("/admin/providers", get(admin::list_providers))
        .route(
            "/admin/services",
            get(admin::list_services).post(admin::create_service),
        )
        .route("/admin/services/{id}", patch(admin::patch_service))
        .route("/admin/services/{id}/test", post(admin::test_service))
        .route(
            "/admin/roots",
            get(admin::list_roots).post(admin::create_root),
        )
        .route("/admin/roots/{id}", patch(admin::patch_root))
        .route("/admin/grants", post(admin::create_grant))
        .route("/admin/grants/{id}", delete(admin::revoke_grant))
        .route("/admin/audit", get(admin::query_audit))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(deadline))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Bind and serve until SIGINT/SIGTERM; broadcasts shutdown to the
/// background tasks afterwards.
///
/// # Errors
///
/// Returns a config error when the bind address is invalid, an IO error
/// when the socket cannot be bound.
pub async fn serve(app: App) -> Result<()> {
    let addr = SocketAddr::new(
        app.config
            .bind_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid BIND_ADDR: {e}")))?,
        app.config.bind_port,
    );

    let shutdown_tx = app.shutdown.clone();
    let router = router(app);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "DNS gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(());
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
