//! DNS Gateway - policy-enforcing DNS API proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use dns_gateway::{cli::Cli, config::Config, gateway, setup_tracing, Error};

const EXIT_CONFIG: u8 = 1;
const EXIT_MIGRATION: u8 = 2;
const EXIT_STORAGE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.env_file {
        Some(ref path) => {
            let _ = dotenvy::from_path(path);
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration (fail-fast on missing variables)
    let config = match Config::load() {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(ref bind) = cli.bind {
                config.bind_addr = bind.clone();
            }
            if let Some(port) = cli.port {
                config.bind_port = port;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr,
        port = config.bind_port,
        "Starting DNS gateway"
    );

    let app = match gateway::Application::build(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::from(match e {
                Error::Config(_) => EXIT_CONFIG,
                Error::Migration(_) => EXIT_MIGRATION,
                Error::StorageError(_) | Error::Io(_) => EXIT_STORAGE,
                _ => EXIT_CONFIG,
            });
        }
    };

    if let Err(e) = gateway::serve(app).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
