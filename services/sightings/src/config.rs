use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are startup faults; nothing built from a valid [`Config`] returns them
/// per request.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

/// Main configuration for the sightings service
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Map grid configuration
    #[serde(default)]
    pub grid: GridConfig,
    /// License plate hashing configuration
    pub plates: PlateConfig,
    /// Image delivery and upload signing configuration
    pub images: ImageConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Server-side statement timeout in milliseconds
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Map grid configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// Cell size in degrees, as a decimal string
    #[serde(default = "default_cell_size")]
    pub cell_size: String,
    /// Margin added on every side of a block listing range, in degrees
    #[serde(default = "default_list_overshoot")]
    pub list_overshoot: String,
    /// Maximum number of blocks returned by a listing
    #[serde(default = "default_list_limit")]
    pub list_limit: i64,
}

/// License plate hashing configuration
#[derive(Debug, Deserialize)]
pub struct PlateConfig {
    /// Server-held salt. Must never change once hashes are stored.
    #[serde(deserialize_with = "deserialize_secret")]
    pub salt: SecretString,
    /// Deadline for a single hash derivation in milliseconds
    #[serde(default = "default_hash_timeout_ms")]
    pub hash_timeout_ms: u64,
}

/// Image pipeline configuration
#[derive(Debug, Deserialize)]
pub struct ImageConfig {
    /// Shared secret with the image pipeline
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_secret: SecretString,
    /// Cloud name used in delivery URLs
    #[serde(default = "default_cloud_name")]
    pub cloud_name: String,
    /// The only upload preset clients may sign for
    #[serde(default = "default_upload_preset")]
    pub upload_preset: String,
    /// Transform applied to thumbnail delivery URLs
    #[serde(default = "default_thumbnail_transform")]
    pub thumbnail_transform: String,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

// Default value functions
fn default_service_name() -> String {
    "sightings-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_statement_timeout_ms() -> u64 {
    5000
}

fn default_run_migrations() -> bool {
    true
}

fn default_cell_size() -> String {
    "0.05".to_string()
}

fn default_list_overshoot() -> String {
    "0.05".to_string()
}

fn default_list_limit() -> i64 {
    100
}

fn default_hash_timeout_ms() -> u64 {
    2000
}

fn default_cloud_name() -> String {
    "dawfgqsur".to_string()
}

fn default_upload_preset() -> String {
    "manualsmap_com".to_string()
}

fn default_thumbnail_transform() -> String {
    "c_limit,w_300".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/sightings").required(false))
            .add_source(config::File::with_name("/etc/manualsmap/sightings").required(false))
            // Override with environment variables
            // SIGHTINGS__PLATES__SALT -> plates.salt
            .add_source(
                config::Environment::with_prefix("SIGHTINGS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        if self.plates.salt.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequired("plates.salt".to_string()));
        }
        if self.images.api_secret.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequired("images.api_secret".to_string()));
        }
        if self.grid.list_limit <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "grid.list_limit".to_string(),
                message: format!("must be positive, got {}", self.grid.list_limit),
            });
        }
        self.grid.cell_size()?;
        self.grid.list_overshoot()?;
        Ok(())
    }
}

impl GridConfig {
    /// Parsed cell size
    pub fn cell_size(&self) -> Result<Decimal, ConfigError> {
        parse_positive_decimal("grid.cell_size", &self.cell_size)
    }

    /// Parsed listing overshoot
    pub fn list_overshoot(&self) -> Result<Decimal, ConfigError> {
        let overshoot = parse_decimal("grid.list_overshoot", &self.list_overshoot)?;
        if overshoot < Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "grid.list_overshoot".to_string(),
                message: format!("must not be negative, got {}", overshoot),
            });
        }
        Ok(overshoot)
    }
}

impl PlateConfig {
    pub fn hash_timeout(&self) -> Duration {
        Duration::from_millis(self.hash_timeout_ms)
    }
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(value.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_positive_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    let parsed = parse_decimal(key, value)?;
    if parsed <= Decimal::ZERO {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be positive, got {}", parsed),
        });
    }
    Ok(parsed)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size: default_cell_size(),
            list_overshoot: default_list_overshoot(),
            list_limit: default_list_limit(),
        }
    }
}
