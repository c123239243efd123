//! Configuration for the BPM broker.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP listener receiving device datagrams
    pub ingest: ListenerConfig,

    /// WebSocket listener serving subscribers
    pub subscriber: ListenerConfig,

    /// Signal smoothing parameters
    pub smoothing: SmoothingConfig,

    /// Consecutive finger-absent readings tolerated before reporting no signal
    pub no_finger_threshold: u32,

    /// Outbound messages buffered per subscriber before deliveries are dropped
    pub subscriber_queue_capacity: usize,

    /// Upper bound on a single write to a subscriber socket
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Receive buffer size for one datagram
    pub max_datagram_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: ListenerConfig::new("0.0.0.0", 8888),
            subscriber: ListenerConfig::new("0.0.0.0", 6789),
            smoothing: SmoothingConfig::default(),
            no_finger_threshold: 2,
            subscriber_queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_datagram_size: 2048,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Save configuration to an explicit file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;

        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bpm-broker")
            .join("config.json")
    }

    /// Reject values the conditioning pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.smoothing.validate()?;

        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "subscriber_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_datagram_size == 0 {
            return Err(ConfigError::Invalid(
                "max_datagram_size must be at least 1".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "send_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host and port of a listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl ListenerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string suitable for `bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parameters of the per-source exponential smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// When false, readings are reported raw and no history is kept
    pub enabled: bool,
    /// EMA coefficient in (0, 1); lower means heavier smoothing
    pub alpha: f64,
    /// Number of smoothed values retained per source
    pub history_length: usize,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Accepted samples passed through unsmoothed after start or a session reset
    pub startup_threshold: u32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.3,
            history_length: 100,
            min_bpm: 40.0,
            max_bpm: 200.0,
            startup_threshold: 10,
        }
    }
}

impl SmoothingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "smoothing alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.history_length == 0 {
            return Err(ConfigError::Invalid(
                "history_length must be at least 1".to_string(),
            ));
        }
        if self.min_bpm >= self.max_bpm {
            return Err(ConfigError::Invalid(format!(
                "min_bpm ({}) must be below max_bpm ({})",
                self.min_bpm, self.max_bpm
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
