//! DNS Gateway Library
//!
//! Policy-enforcing DNS API gateway: a credential-isolating proxy that
//! authenticates client tokens, evaluates a three-tier permission model
//! (account → realm → token), and translates requests into calls on
//! upstream DNS providers.
//!
//! # Subsystems
//!
//! - **Authorization core**: identity store, credential engine, realm
//!   resolver, permission engine
//! - **Backend abstraction**: `DnsBackend` trait, provider registry,
//!   Netcup and PowerDNS implementations
//! - **Proxy pipeline**: authenticate → authorize → dispatch → filter →
//!   audit, under per-IP rate limits and origin allowlists

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod policy;
pub mod ratelimit;
pub mod resolver;
pub mod secrets;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
///
/// # Errors
///
/// Currently infallible; kept fallible for parity with future sinks.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
