//! Command-line interface

use clap::Parser;

/// Policy-enforcing DNS API gateway
#[derive(Parser, Debug)]
#[command(name = "dns-gateway", version, about)]
pub struct Cli {
    /// Override the listening address (`BIND_ADDR`)
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the listening port (`BIND_PORT`)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Log level when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format: text (default) or json
    #[arg(long)]
    pub log_format: Option<String>,

    /// Path to a .env file loaded before configuration
    #[arg(long)]
    pub env_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["dns-gateway"]);
        assert!(cli.bind.is_none());
        assert!(cli.port.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from([
            "dns-gateway",
            "--bind",
            "0.0.0.0",
            "-p",
            "9000",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
