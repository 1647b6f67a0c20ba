//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (FLOWRELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Browser origin allowed to call the API, or `*` for any.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    /// Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Relay configuration.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus endpoint.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Buffered messages per subject before slow subscribers lag.
    #[serde(default = "default_capacity")]
    pub subject_capacity: usize,
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Simulated task processing time in milliseconds.
    #[serde(default = "default_task_delay")]
    pub task_delay_ms: u64,

    /// Buffered messages per live topic.
    #[serde(default = "default_capacity")]
    pub broadcast_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("FLOWRELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("FLOWRELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_cors_origin() -> String {
    std::env::var("FLOWRELAY_CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn default_bus_url() -> String {
    std::env::var("FLOWRELAY_BUS_URL").unwrap_or_else(|_| "memory://local".to_string())
}

fn default_capacity() -> usize {
    1024
}

fn default_task_delay() -> u64 {
    2_000 // 2 seconds
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            bus: BusConfig::default(),
            relay: RelaySettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            subject_capacity: default_capacity(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            task_delay_ms: default_task_delay(),
            broadcast_capacity: default_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl RelaySettings {
    /// Task processing delay as a duration.
    #[must_use]
    pub fn task_delay(&self) -> Duration {
        Duration::from_millis(self.task_delay_ms)
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "flowrelay.toml",
            "/etc/flowrelay/flowrelay.toml",
            "~/.config/flowrelay/flowrelay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.task_delay(), Duration::from_secs(2));
        assert_eq!(config.bus.subject_capacity, 1024);
        assert!(config.metrics.enabled);
        assert_eq!(config.cors_origin, "http://localhost:3000");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            cors_origin = "https://chat.example.com"

            [bus]
            url = "memory://relay"

            [relay]
            task_delay_ms = 250
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.cors_origin, "https://chat.example.com");
        assert_eq!(config.bus.url, "memory://relay");
        assert_eq!(config.relay.task_delay(), Duration::from_millis(250));
        assert_eq!(config.relay.broadcast_capacity, 1024);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let config: Config = toml::from_str(r#"host = "not a host""#).unwrap();
        assert!(config.bind_addr().is_err());
    }
}
