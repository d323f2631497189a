//! Server configuration, loaded from YAML. Every section and field is optional
//! and falls back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use meetup_events::BusConfig;
use meetup_persist::StoreOptions;
use serde::{Deserialize, Serialize};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {source}")]
    Yaml { source: serde_yaml::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(source: serde_yaml::Error) -> Self {
        Self::Yaml { source }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub events: EventsConfig,
    pub simulation: SimulationConfig,
    pub network: NetworkConfig,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events.workers == 0 {
            return Err(ConfigError::Invalid("events.workers must be at least 1".into()));
        }
        if self.simulation.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid(
                "simulation.tick_rate_hz must be at least 1".into(),
            ));
        }
        if self.rate_limit.save_cooldown_ms < 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.save_cooldown_ms must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `players/` and `worlds/`.
    pub root: PathBuf,
    /// World loaded at startup and saved at shutdown.
    pub world_name: String,
    /// Forces every world record's seed when set.
    pub server_seed: Option<u64>,
    pub backups: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            world_name: "world".into(),
            server_seed: None,
            backups: true,
        }
    }
}

impl StorageConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            server_seed: self.server_seed,
            backups: self.backups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub save_cooldown_ms: i64,
    /// How often idle ledger entries are swept. Zero disables sweeping.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            save_cooldown_ms: 1000,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub workers: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            shutdown_grace_ms: 5000,
        }
    }
}

impl EventsConfig {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            workers: self.workers,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub tick_rate_hz: u32,
    /// Fixed seed for reproducible runs; random when absent.
    pub seed: Option<u64>,
    /// Creatures spawned when the server starts.
    pub creatures: usize,
    /// Size of the walled play area in tiles.
    pub area_width: i32,
    pub area_height: i32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            seed: None,
            creatures: 8,
            area_width: 32,
            area_height: 32,
        }
    }
}

impl SimulationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind: String,
    /// Longest accepted request line, in bytes.
    pub max_line_bytes: usize,
    /// Honor `shutdown` requests arriving over the network.
    pub allow_remote_shutdown: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".into(),
            max_line_bytes: 1 << 20,
            allow_remote_shutdown: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = ServerConfig::parse("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.rate_limit.save_cooldown_ms, 1000);
        assert_eq!(config.events.workers, 2);
        assert_eq!(config.events.bus_config().shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "
storage:
  root: /srv/meetup
  server_seed: 1234
simulation:
  tick_rate_hz: 50
";
        let config = ServerConfig::parse(yaml).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/srv/meetup"));
        assert_eq!(config.storage.store_options().server_seed, Some(1234));
        assert!(config.storage.backups);
        assert_eq!(config.simulation.tick_interval(), Duration::from_millis(20));
        assert_eq!(config.simulation.creatures, 8);
        assert_eq!(config.network.bind, "127.0.0.1:7878");
    }

    #[test]
    fn zero_workers_is_invalid() {
        let err = ServerConfig::parse("events:\n  workers: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let err = ServerConfig::parse("storage: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "rate_limit:\n  save_cooldown_ms: 250\n").unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.rate_limit.save_cooldown_ms, 250);
        assert!(matches!(
            ServerConfig::from_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
