//! Command line interface for the `gatelink` binary.
//!
//! Kept free of crate-internal types so the build script can include it to
//! render the manual page.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Gateway connection mode selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Listen for the gateway's inbound WebSocket connection.
    Reverse,
    /// Dial out to the gateway's WebSocket endpoint.
    Forward,
}

/// Command line arguments for the `gatelink` binary.
#[derive(Debug, Parser)]
#[command(
    name = "gatelink",
    version,
    about = "Relay between a chat-bot gateway and a backend automation service"
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the configured log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the configured gateway connection mode.
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, ModeArg};

    #[test]
    fn defaults_to_local_config_file() {
        let cli = Cli::parse_from(["gatelink"]);
        assert_eq!(cli.config.to_str(), Some("config.toml"));
        assert!(cli.log_level.is_none());
        assert!(cli.mode.is_none());
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "gatelink",
            "--config",
            "/etc/gatelink.toml",
            "--log-level",
            "debug",
            "--mode",
            "forward",
        ]);
        assert_eq!(cli.config.to_str(), Some("/etc/gatelink.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.mode, Some(ModeArg::Forward));
    }
}
