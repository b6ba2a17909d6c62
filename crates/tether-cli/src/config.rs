//! Configuration system for the TETHER CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::UpgradeConfig;
use tether_core::config::{DEFAULT_PROTOCOL, force_private_network};
use tether_transport::Address;

/// TETHER configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Upgrade deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded Ed25519 seed file
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Swarm key file enabling private network protection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm_key_file: Option<PathBuf>,
    /// Refuse to run without a swarm key
    #[serde(default)]
    pub require_protection: bool,
    /// Security protocol tag
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Secured connections buffered before `accept`
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
}

/// Upgrade deadlines, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Raw dial plus outbound upgrade
    #[serde(default = "default_timeout_secs")]
    pub dial_secs: u64,
    /// Inbound upgrade of one accepted connection
    #[serde(default = "default_timeout_secs")]
    pub accept_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_key_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tether/identity.key")
}

fn default_listen_addr() -> String {
    "tcp://0.0.0.0:4001".to_string()
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_accept_backlog() -> usize {
    tether_core::config::DEFAULT_ACCEPT_BACKLOG
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            swarm_key_file: None,
            require_protection: false,
            protocol: default_protocol(),
            accept_backlog: default_accept_backlog(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: default_timeout_secs(),
            accept_secs: default_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load config from the default path, falling back to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid transport address.
    pub fn parse_listen_addr(&self) -> anyhow::Result<Address> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Build the upgrader configuration.
    ///
    /// Protection is required when either the config file or the
    /// `TETHER_FORCE_PNET` environment variable asks for it.
    #[must_use]
    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig::default()
            .with_dial_timeout(Duration::from_secs(self.timeouts.dial_secs))
            .with_accept_timeout(Duration::from_secs(self.timeouts.accept_secs))
            .with_require_protection(self.network.require_protection || force_private_network())
            .with_protocol(self.network.protocol.clone())
            .with_accept_backlog(self.network.accept_backlog)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.upgrade_config().validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.network.require_protection && self.network.swarm_key_file.is_none() {
            anyhow::bail!("require_protection is set but no swarm_key_file is configured");
        }

        Ok(())
    }
}
