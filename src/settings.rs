//! Module for loading and validating coordinator settings.
//!
//! Every setting has a default, so the configuration file is optional. Settings defined in
//! the configuration file can be overridden by environment variables prefixed with
//! `COORDINATOR__`, e.g. `COORDINATOR__NETWORK__BIND_ADDRESS=0.0.0.0:3000`.
use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Default, Validate, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[validate]
    pub network: NetworkSettings,
    #[validate]
    pub aggregator: AggregatorSettings,
    #[validate]
    pub rounds: RoundSettings,
    pub timeouts: TimeoutSettings,
    #[validate]
    pub limits: LimitSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Listening sockets
pub struct NetworkSettings {
    #[validate(length(min = 1))]
    /// The address the client-facing TCP listener binds to.
    ///
    /// **TOML**
    /// ```text
    /// [network]
    /// bind_address = "0.0.0.0:2121"
    /// ```
    pub bind_address: String,

    #[validate(length(min = 1))]
    /// The address the UDP discovery responder binds to.
    pub discovery_address: String,

    pub discovery_enabled: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2121".to_string(),
            discovery_address: "0.0.0.0:2122".to_string(),
            discovery_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// External aggregation process
pub struct AggregatorSettings {
    #[validate(length(min = 1))]
    /// Address of the aggregation process.
    ///
    /// **Environment variable**
    /// ```text
    /// COORDINATOR__AGGREGATOR__ADDRESS=127.0.0.1:12345
    /// ```
    pub address: String,

    #[validate(range(min = 1))]
    /// Upper bound, in seconds, for one aggregation round-trip (connect, aggregate, reply).
    pub timeout_secs: u64,

    /// Number of additional connection attempts when the aggregator cannot be reached.
    pub connect_retries: usize,

    #[validate(range(min = 1))]
    /// Delay before the first reconnection attempt. Doubles on every attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:12345".to_string(),
            timeout_secs: 600,
            connect_retries: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl AggregatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Periods of the two background workers
pub struct RoundSettings {
    #[validate(range(min = 1))]
    /// How often idle clients are told to retrain.
    pub retrain_interval_ms: u64,

    #[validate(range(min = 1))]
    /// How often the aggregation buffer is checked for a complete cohort.
    pub aggregation_interval_ms: u64,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            retrain_interval_ms: 2_000,
            aggregation_interval_ms: 5_000,
        }
    }
}

impl RoundSettings {
    pub fn retrain_interval(&self) -> Duration {
        Duration::from_millis(self.retrain_interval_ms)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_millis(self.aggregation_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Bounds on blocking protocol steps. A value of `0` disables the corresponding timeout.
pub struct TimeoutSettings {
    /// Timeout for a single handshake step (one line, one chunk).
    pub step_secs: u64,

    /// Time a client may spend training between `RETRAIN` and announcing its upload.
    pub training_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            step_secs: 60,
            training_secs: 3_600,
        }
    }
}

impl TimeoutSettings {
    pub fn step(&self) -> Option<Duration> {
        non_zero_secs(self.step_secs)
    }

    pub fn training(&self) -> Option<Duration> {
        non_zero_secs(self.training_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    #[validate(range(min = 1))]
    /// Largest model, in bytes, a client may announce.
    pub max_model_size: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_model_size: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Filesystem layout shared with the aggregation process
pub struct StorageSettings {
    /// Directory receiving uploaded models and their data counts.
    pub uploads_dir: PathBuf,
    /// Directory holding the global models produced by the aggregator.
    pub global_model_dir: PathBuf,
    /// Directory holding the bootstrap model and the normalization files.
    pub base_model_dir: PathBuf,
    pub base_model_file: String,
    /// File receiving the lines of `UPLOAD_DATA` requests.
    pub client_data_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("aggregation_models"),
            global_model_dir: PathBuf::from("global_model"),
            base_model_dir: PathBuf::from("base_model"),
            base_model_file: "big_global_model_weights.ckpt".to_string(),
            client_data_file: PathBuf::from("data.txt"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// An `env_logger` filter directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads and validates the coordinator settings. Without a path only the defaults and
    /// the environment are used.
    pub fn new(path: Option<&str>) -> Result<Self, SettingsError> {
        let settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(
                Environment::with_prefix("COORDINATOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
