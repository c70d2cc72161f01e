use crate::core::address::HostAndPort;
use crate::core::connection_pool::{ConnectionSettings, Credentials, ExhaustionPolicy};
use crate::core::sentinel_listener::ListenerBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SentinelPoolConfig {
    pub master_name: String,
    pub sentinels: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: i64,
    #[serde(default)]
    pub client_name: Option<String>,
    /// Credentials for the Sentinel nodes themselves, when they differ from the master's
    #[serde(default)]
    pub sentinel_auth: Option<SentinelAuthConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SentinelAuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_total")]
    pub max_total: u32,
    #[serde(default)]
    pub min_idle: u32,
    #[serde(default = "default_block_when_exhausted")]
    pub block_when_exhausted: bool,
    /// How long a blocked borrow waits; absent means forever
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            min_idle: 0,
            block_when_exhausted: default_block_when_exhausted(),
            max_wait_ms: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

impl PoolConfig {
    pub fn exhaustion_policy(&self) -> ExhaustionPolicy {
        match (self.block_when_exhausted, self.max_wait_ms) {
            (false, _) => ExhaustionPolicy::FailFast,
            (true, None) => ExhaustionPolicy::Block,
            (true, Some(ms)) => ExhaustionPolicy::BlockWithTimeout(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn backoff(&self) -> ListenerBackoff {
        ListenerBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

// Default values
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_socket_timeout_ms() -> u64 {
    2000
}
fn default_max_total() -> u32 {
    8
}
fn default_block_when_exhausted() -> bool {
    true
}
fn default_idle_timeout_secs() -> Option<u64> {
    Some(600)
} // 10 minutes
fn default_max_lifetime_secs() -> Option<u64> {
    Some(1800)
} // 30 minutes
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5000
}

impl SentinelPoolConfig {
    /// Minimal configuration with every optional field at its default
    pub fn new(master_name: impl Into<String>, sentinels: Vec<String>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels,
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            username: None,
            password: None,
            database: 0,
            client_name: None,
            sentinel_auth: None,
            pool: PoolConfig::default(),
            listener: ListenerConfig::default(),
        }
    }

    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SentinelPoolConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "master_name must not be empty".to_string(),
            ));
        }

        if self.sentinels.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one sentinel is required".to_string(),
            ));
        }
        self.sentinel_addresses()?;

        if self.pool.max_total == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_total must be greater than zero".to_string(),
            ));
        }
        if self.pool.min_idle > self.pool.max_total {
            return Err(ConfigError::ValidationError(format!(
                "pool.min_idle ({}) exceeds pool.max_total ({})",
                self.pool.min_idle, self.pool.max_total
            )));
        }

        if self.listener.initial_backoff_ms > self.listener.max_backoff_ms {
            return Err(ConfigError::ValidationError(format!(
                "listener.initial_backoff_ms ({}) exceeds listener.max_backoff_ms ({})",
                self.listener.initial_backoff_ms, self.listener.max_backoff_ms
            )));
        }

        Ok(())
    }

    pub fn sentinel_addresses(&self) -> Result<Vec<HostAndPort>, ConfigError> {
        self.sentinels
            .iter()
            .map(|s| {
                s.parse::<HostAndPort>().map_err(|e| {
                    ConfigError::ValidationError(format!("Sentinel '{}' is invalid: {}", s, e))
                })
            })
            .collect()
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
            client_name: self.client_name.clone(),
        }
    }

    pub fn sentinel_credentials(&self) -> Credentials {
        let auth = self.sentinel_auth.clone().unwrap_or_default();
        Credentials {
            username: auth.username,
            password: auth.password,
            database: 0,
            client_name: auth.client_name,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
