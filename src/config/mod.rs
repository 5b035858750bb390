/// Configuration management for vigia
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main vigia configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store addressing and credentials
    pub store: StoreConfig,
    /// Connection strategy tuning
    pub connection: ConnectionSettings,
    /// Schema and seeded account setup
    pub bootstrap: BootstrapConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Store addressing and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub primary_host: String,
    pub primary_port: u16,
    pub secondary_host: String,
    pub secondary_port: u16,
    /// Username for store authentication (optional)
    pub username: Option<String>,
    /// Password for store authentication (optional)
    pub password: Option<String>,
    /// Database holding credentials
    pub auth_source: String,
    /// Database all handles are scoped to
    pub database: String,
    /// Replica-set name used by the full-topology strategy
    pub replica_set: Option<String>,
}

/// Connection strategy tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Timeout for the direct-simple strategy in milliseconds
    pub direct_timeout_ms: u64,
    /// Timeout for the full-topology strategy in milliseconds
    pub topology_timeout_ms: u64,
    /// Timeout for the direct-forced strategy in milliseconds
    pub forced_timeout_ms: u64,
    /// Upper bound for any single store operation in milliseconds
    pub operation_timeout_ms: u64,
    /// Require majority acknowledgement for writes
    pub write_majority: bool,
    /// Require journaled writes
    pub journal: bool,
    /// Maximum pool size per connection
    pub max_pool_size: u32,
    /// Append a last rung that connects without credentials
    pub allow_unauthenticated_fallback: bool,
}

/// Schema and seeded account setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Run bootstrap after the first successful establishment
    pub enabled: bool,
    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Maximum number of sentinel lookups per replication probe
    pub replication_attempts: u32,
    /// Sleep between sentinel lookups in milliseconds
    pub replication_poll_interval_ms: u64,
    /// Lag above which an observed replication is only a warning
    pub replication_lag_threshold_sec: f64,
    /// Healthy members required before the cluster counts as healthy
    pub min_healthy_members: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_host: "localhost".to_string(),
            primary_port: 27017,
            secondary_host: "localhost".to_string(),
            secondary_port: 27018,
            username: None,
            password: None,
            auth_source: "admin".to_string(),
            database: "app".to_string(),
            replica_set: Some("rs0".to_string()),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            direct_timeout_ms: 5000,
            topology_timeout_ms: 10000,
            forced_timeout_ms: 5000,
            operation_timeout_ms: 5000,
            write_majority: true,
            journal: true,
            max_pool_size: 10,
            allow_unauthenticated_fallback: false,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_username: "admin".to_string(),
            admin_email: "admin@example.com".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_sec: 30,
            replication_attempts: 10,
            replication_poll_interval_ms: 500,
            replication_lag_threshold_sec: 5.0,
            min_healthy_members: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ConnectionSettings {
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn topology_timeout(&self) -> Duration {
        Duration::from_millis(self.topology_timeout_ms)
    }

    pub fn forced_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn replication_poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication_poll_interval_ms)
    }

    /// Saturates at `Duration::MAX`; `validate` rejects values out of range
    pub fn replication_lag_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.replication_lag_threshold_sec).unwrap_or(Duration::MAX)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Overlay `MONGODB_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("MONGODB_"))
            .collect();
        self.apply_overrides(&vars)?;
        self.validate()
    }

    /// Overlay environment-style key/value pairs onto this configuration
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        let store = &mut self.store;

        if let Some(host) = vars.get("MONGODB_PRIMARY_HOST") {
            store.primary_host = host.clone();
        }
        if let Some(port) = vars.get("MONGODB_PRIMARY_PORT") {
            store.primary_port = parse_port("MONGODB_PRIMARY_PORT", port)?;
        }
        if let Some(host) = vars.get("MONGODB_SECONDARY_HOST") {
            store.secondary_host = host.clone();
        }
        if let Some(port) = vars.get("MONGODB_SECONDARY_PORT") {
            store.secondary_port = parse_port("MONGODB_SECONDARY_PORT", port)?;
        }
        if let Some(username) = vars.get("MONGODB_USERNAME") {
            store.username = non_empty(username);
        }
        if let Some(password) = vars.get("MONGODB_PASSWORD") {
            store.password = non_empty(password);
        }
        if let Some(database) = vars.get("MONGODB_DATABASE") {
            store.database = database.clone();
        }
        if let Some(replica_set) = vars.get("MONGODB_REPLICA_SET") {
            store.replica_set = non_empty(replica_set);
        }
        if let Some(auth_source) = vars.get("MONGODB_AUTH_SOURCE") {
            store.auth_source = auth_source.clone();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate store config
        if self.store.primary_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "primary_host cannot be empty".to_string(),
            ));
        }

        if self.store.secondary_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "secondary_host cannot be empty".to_string(),
            ));
        }

        if self.store.primary_port == 0 || self.store.secondary_port == 0 {
            return Err(ConfigError::ValidationError(
                "store ports must be greater than 0".to_string(),
            ));
        }

        if self.store.database.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database cannot be empty".to_string(),
            ));
        }

        if self.store.username.is_some() != self.store.password.is_some() {
            return Err(ConfigError::ValidationError(
                "username and password must be set together".to_string(),
            ));
        }

        // Validate connection settings
        let connection = &self.connection;
        if connection.direct_timeout_ms == 0
            || connection.topology_timeout_ms == 0
            || connection.forced_timeout_ms == 0
            || connection.operation_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "connection timeouts must be greater than 0".to_string(),
            ));
        }

        if connection.max_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_pool_size must be greater than 0".to_string(),
            ));
        }

        // Validate bootstrap config
        if self.bootstrap.enabled {
            if self.bootstrap.admin_username.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "admin_username cannot be empty".to_string(),
                ));
            }
            if self.bootstrap.admin_password.is_empty() {
                return Err(ConfigError::ValidationError(
                    "admin_password cannot be empty".to_string(),
                ));
            }
        }

        // Validate health config
        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.health.replication_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "replication_attempts must be greater than 0".to_string(),
            ));
        }

        let threshold = self.health.replication_lag_threshold_sec;
        if threshold <= 0.0 || Duration::try_from_secs_f64(threshold).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "replication_lag_threshold_sec must be a positive duration, got {}",
                threshold
            )));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file for a two-node replica set
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            store: StoreConfig {
                primary_host: "db-primary".to_string(),
                secondary_host: "db-secondary".to_string(),
                secondary_port: 27017,
                username: Some("admin".to_string()),
                password: Some("password".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::ValidationError(format!("Invalid port in {}: {}", key, value)))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
