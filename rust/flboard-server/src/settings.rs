//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example of a configuration file can be found in the `configs/` directory located in the
//! repository root.

use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use flboard_core::TrainingConfiguration;
use flboard_sdk::{
    retry::RetryPolicy,
    session::SessionPolicy,
    OrchestratorSettings as SdkOrchestratorSettings,
    SchedulerSettings,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub backend: BackendSettings,
    #[validate]
    pub orchestrator: OrchestratorSettings,
    #[validate]
    pub training: TrainingSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path))?;
        config.merge(Environment::with_prefix("flboard").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Proxy settings.
pub struct ApiSettings {
    /// The address to which the proxy should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:3000"
    /// # or
    /// bind_address = "127.0.0.1:3000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FLBOARD_API__BIND_ADDRESS=127.0.0.1:3000
    /// ```
    pub bind_address: SocketAddr,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The training service the proxy and the trainer talk to.
pub struct BackendSettings {
    #[validate(url)]
    /// The base URL of the training service.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [backend]
    /// url = "http://127.0.0.1:8000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FLBOARD_BACKEND__URL=http://127.0.0.1:8000
    /// ```
    pub url: String,

    #[validate(range(min = 1))]
    /// How long the proxy waits for the training service, in seconds.
    pub timeout_secs: u64,

    #[validate(range(min = 1))]
    /// How long the proxy waits for the metrics of the training service, in seconds. Computing
    /// the metrics of a long training takes a while.
    pub metrics_timeout_secs: u64,
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout_secs)
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_orchestrator"))]
/// Settings of the headless trainer.
pub struct OrchestratorSettings {
    #[validate(range(min = 1))]
    /// The pause between two round triggers, in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [orchestrator]
    /// round_interval_secs = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FLBOARD_ORCHESTRATOR__ROUND_INTERVAL_SECS=10
    /// ```
    pub round_interval_secs: u64,

    #[validate(range(min = 1))]
    /// The pause between two polls of the training state, in seconds.
    pub poll_interval_secs: u64,

    #[validate(range(min = 1))]
    /// The number of consecutive failed rounds after which the training fails.
    pub max_round_failures: u32,

    #[validate(range(min = 1))]
    /// The number of polls after a round until the state reflects the round.
    pub reconcile_attempts: u32,

    /// The pause between two of these polls, in seconds.
    pub reconcile_delay_secs: u64,

    #[validate(range(min = 1))]
    /// The assumed lifetime of a session, in seconds.
    pub session_lifetime_secs: u64,

    /// How long before its expiry a session is renewed, in seconds. Must be shorter than the
    /// lifetime.
    pub session_renew_before_secs: u64,

    #[validate(range(min = 1))]
    /// How long the trainer waits for the training service, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            round_interval_secs: 10,
            poll_interval_secs: 5,
            max_round_failures: 3,
            reconcile_attempts: 3,
            reconcile_delay_secs: 2,
            session_lifetime_secs: 30 * 60,
            session_renew_before_secs: 5 * 60,
            request_timeout_secs: 30,
        }
    }
}

impl OrchestratorSettings {
    pub fn orchestrator(&self) -> SdkOrchestratorSettings {
        SdkOrchestratorSettings {
            max_round_failures: self.max_round_failures,
            reconcile: RetryPolicy::new(
                self.reconcile_attempts,
                Duration::from_secs(self.reconcile_delay_secs),
            ),
            session: SessionPolicy {
                lifetime: Duration::from_secs(self.session_lifetime_secs),
                renew_before: Duration::from_secs(self.session_renew_before_secs),
            },
        }
    }

    pub fn scheduler(&self) -> SchedulerSettings {
        SchedulerSettings {
            round_interval: Duration::from_secs(self.round_interval_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Checks the validity of the session renewal lead.
fn validate_orchestrator(s: &OrchestratorSettings) -> Result<(), ValidationError> {
    if s.session_renew_before_secs < s.session_lifetime_secs {
        Ok(())
    } else {
        Err(ValidationError::new("session renewal lead not shorter than lifetime"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_training"))]
/// The training the trainer submits.
pub struct TrainingSettings {
    #[validate(range(min = 1))]
    /// The number of local training epochs per round.
    pub local_epochs: u32,

    #[validate(range(min = 1))]
    /// The local batch size.
    pub batch_size: u32,

    /// The ratio of the noise standard deviation to the clipping norm. Must be positive.
    pub noise_multiplier: f64,

    /// The clipping norm of the client updates. Must be positive.
    pub l2_norm_clip: f64,

    #[validate(length(min = 1))]
    /// The number of samples of each simulated client.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// client_data_sizes = [1000, 1000, 1000]
    /// ```
    pub client_data_sizes: Vec<u64>,
}

impl TrainingSettings {
    /// The configuration to derive from a client setup.
    pub fn template(&self) -> TrainingConfiguration {
        TrainingConfiguration {
            num_clients: self.client_data_sizes.len() as u32,
            local_epochs: self.local_epochs,
            batch_size: self.batch_size,
            noise_multiplier: self.noise_multiplier,
            l2_norm_clip: self.l2_norm_clip,
        }
    }
}

fn validate_training(s: &TrainingSettings) -> Result<(), ValidationError> {
    if s.noise_multiplier > 0.0 && s.l2_norm_clip > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("non-positive privacy parameters"))
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FLBOARD_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
