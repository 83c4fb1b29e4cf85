//! Configuration for the edge voice fleet server

mod settings;

pub use settings::{
    load_settings, load_settings_from, AuthConfig, DeviceConfig, ObservabilityConfig,
    PipelineSettings, PoolSettings, ProviderEntry, ProvidersConfig, RuntimeEnvironment,
    ServerConfig, Settings, VisionConfig,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
