use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub messaging: Option<MessagingConfig>,
    #[serde(default)]
    pub ipam: IpamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_messaging_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Free-address count at or below which a subnet gets an exhaustion
    /// warning. 0 disables the warning.
    #[serde(default = "default_exhaustion_threshold")]
    pub exhaustion_threshold: u32,
    /// Upper bound on allocation attempts after racing another allocator.
    #[serde(default = "default_max_allocation_retries")]
    pub max_allocation_retries: u32,
    #[serde(default = "default_purge_interval")]
    pub provisional_purge_interval_secs: u64,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            exhaustion_threshold: default_exhaustion_threshold(),
            max_allocation_retries: default_max_allocation_retries(),
            provisional_purge_interval_secs: default_purge_interval(),
        }
    }
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/maas/ipam.redb")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_messaging_backend() -> String {
    "noop".to_string()
}
fn default_topic_prefix() -> String {
    "maas".to_string()
}
fn default_exhaustion_threshold() -> u32 {
    16
}
fn default_max_allocation_retries() -> u32 {
    5
}
fn default_purge_interval() -> u64 {
    60
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::error::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::error::Error::Config(format!("failed to parse config: {e}")))?;
        if config.ipam.max_allocation_retries == 0 {
            return Err(crate::error::Error::Config(
                "ipam.max_allocation_retries must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
