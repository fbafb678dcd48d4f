use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrimConfig {
    /// Maximum number of distinct buckets tracked by the change counter
    #[serde(default = "default_counter_size")]
    pub counter_size: usize,
    /// Name of the shared control object gateways watch for trim notifications
    #[serde(default = "default_control_object")]
    pub control_object: String,
    /// How long to wait for peer replies when collecting counters (ms)
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Largest change counter a gateway will allocate
pub const MAX_COUNTER_SIZE: usize = 1 << 20;

fn default_counter_size() -> usize {
    512
}

fn default_control_object() -> String {
    "bilog.trim".to_string()
}

fn default_notify_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily rotating log file (console only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            counter_size: default_counter_size(),
            control_object: default_control_object(),
            notify_timeout_ms: default_notify_timeout_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TrimConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("counter_size", default_counter_size() as u64)?
            .set_default("control_object", default_control_object())?
            .set_default("notify_timeout_ms", default_notify_timeout_ms())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BUCKET_TRIM_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // BUCKET_TRIM__COUNTER_SIZE, BUCKET_TRIM__LOGGING__LEVEL, ...
            .add_source(
                Environment::with_prefix("BUCKET_TRIM")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.counter_size == 0 {
            errors.push("counter_size must be positive".to_string());
        } else if self.counter_size > MAX_COUNTER_SIZE {
            errors.push(format!(
                "counter_size must be at most {}, got {}",
                MAX_COUNTER_SIZE, self.counter_size
            ));
        }

        if self.control_object.trim().is_empty() {
            errors.push("control_object must not be empty".to_string());
        }

        if self.notify_timeout_ms == 0 {
            errors.push("notify_timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
