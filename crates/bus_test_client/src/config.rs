//! Command-line arguments and TOML configuration for the test client.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use warden_message_system::BusConfig;

/// Command-line arguments for the bus test client.
///
/// These allow overriding configuration file settings for quick
/// experiments against a live channel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path. Missing file means built-in defaults.
    #[arg(short, long, default_value = "bus_client.toml")]
    pub config: PathBuf,

    /// Host the channel instead of connecting to an existing host
    #[arg(long)]
    pub host: bool,

    /// Override the channel name from the configuration file
    #[arg(short = 'n', long)]
    pub channel: Option<String>,

    /// Number of health pings to send before exiting (0 = run until killed)
    #[arg(long, default_value_t = 0)]
    pub count: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("bus_client.toml"),
            host: false,
            channel: None,
            count: 0,
            debug: false,
        }
    }
}

/// On-disk configuration for the test client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Channel settings shared with the peer
    #[serde(default)]
    pub bus: BusConfig,

    /// Milliseconds between health pings when hosting
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

fn default_ping_interval() -> u64 {
    1000
}

/// Loads the configuration file, falling back to defaults when it does not
/// exist, then applies command-line overrides.
pub fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match std::fs::read_to_string(&args.config) {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", args.config.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig {
            ping_interval_ms: default_ping_interval(),
            ..AppConfig::default()
        },
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", args.config.display()))
        }
    };

    if let Some(channel) = &args.channel {
        config.bus.channel_name = channel.clone();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_yields_defaults() {
        let args = Args {
            config: PathBuf::from("/nonexistent/bus_client.toml"),
            ..Args::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.ping_interval_ms, 1000);
    }

    #[test]
    fn test_channel_override_wins_over_file() {
        let args = Args {
            config: PathBuf::from("/nonexistent/bus_client.toml"),
            channel: Some("override-bus".to_string()),
            ..Args::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.bus.channel_name, "override-bus");
    }
}
