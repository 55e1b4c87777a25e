//! Server configuration.
//!
//! Read from an optional JSON file whose sections are named after the
//! components, so `Account:Port` lives at `{"Account": {"Port": ...}}`.
//! Anything left out falls back to the defaults below.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Bind settings for one host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_connections() -> usize {
    300
}

impl HostConfig {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Reconnect throttling on the account entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ThrottleConfig {
    pub min_interval_secs: u64,
    pub block_secs: u64,
    pub sweep_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 20,
            block_secs: 20 * 60,
            sweep_secs: 60,
        }
    }
}

impl ThrottleConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }
}

/// World tick cadence and thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TickConfig {
    pub interval_ms: u64,
    /// Percent of max health/DS restored per tick.
    pub regen_percent: u32,
    pub sync_every_ticks: u64,
    pub reward_every_ticks: u64,
    pub appear_distance: f64,
    pub disappear_distance: f64,
    /// How long a knocked-out companion stays down.
    pub companion_revive_secs: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            regen_percent: 1,
            sync_every_ticks: 20,
            reward_every_ticks: 120,
            appear_distance: 3000.0,
            disappear_distance: 3500.0,
            companion_revive_secs: 30,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn companion_revive(&self) -> Duration {
        Duration::from_secs(self.companion_revive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub account: HostConfig,
    pub game: HostConfig,
    pub throttle: ThrottleConfig,
    pub tick: TickConfig,
    pub capture_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            account: HostConfig::new("0.0.0.0", 7029),
            game: HostConfig::new("0.0.0.0", 7607),
            throttle: ThrottleConfig::default(),
            tick: TickConfig::default(),
            capture_dir: Some(PathBuf::from("captures")),
        }
    }
}

impl ServerConfig {
    /// Loads the config file when one is given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_json(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.appear_distance >= self.tick.disappear_distance {
            return Err(ConfigError::Invalid(format!(
                "Tick.AppearDistance ({}) must be smaller than Tick.DisappearDistance ({})",
                self.tick.appear_distance, self.tick.disappear_distance
            )));
        }
        if self.account.max_connections == 0 || self.game.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "MaxConnections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.account.port, 7029);
        assert_eq!(config.account.max_connections, 300);
        assert_eq!(config.throttle.min_interval(), Duration::from_secs(20));
        assert_eq!(config.throttle.block_duration(), Duration::from_secs(1200));
        assert_eq!(config.throttle.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.tick.regen_percent, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_component_sections() {
        let config = ServerConfig::from_json(
            r#"{
                "Account": { "Address": "127.0.0.1", "Port": 9000, "Backlog": 16 },
                "Game": { "Port": 9001, "MaxConnections": 50 },
                "Throttle": { "MinIntervalSecs": 5 },
                "Tick": { "IntervalMs": 100 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.account.address, "127.0.0.1");
        assert_eq!(config.account.port, 9000);
        assert_eq!(config.account.backlog, 16);
        assert_eq!(config.game.address, "0.0.0.0");
        assert_eq!(config.game.max_connections, 50);
        assert_eq!(config.throttle.min_interval_secs, 5);
        assert_eq!(config.throttle.block_secs, 1200);
        assert_eq!(config.tick.interval(), Duration::from_millis(100));
        assert_eq!(config.tick.appear_distance, 3000.0);
    }

    #[test]
    fn test_rejects_inverted_visibility_thresholds() {
        let config = ServerConfig::from_json(
            r#"{ "Tick": { "AppearDistance": 500.0, "DisappearDistance": 500.0 } }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/tamer.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            ServerConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
