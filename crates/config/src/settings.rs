//! Main settings module
//!
//! Priority: env vars > config/{env}.yaml > config/default.yaml > defaults.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::ConfigError;

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP / websocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root directory served by the firmware download endpoint
    #[serde(default = "default_ota_bin_dir")]
    pub ota_bin_dir: String,
    /// Maximum concurrent device connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Total graceful-shutdown budget in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_ota_bin_dir() -> String {
    "data/ota_bin".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_shutdown_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ota_bin_dir: default_ota_bin_dir(),
            max_connections: default_max_connections(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Credential store and session-key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Store driver: memory | sqlite | redis
    #[serde(default = "default_auth_driver")]
    pub driver: String,
    /// Client credential TTL in seconds; 0 stores entries indefinitely
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Session symmetric key TTL in seconds
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,
    /// Background cleanup interval in seconds (floored to 30 s at runtime)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Memory store GC tick in seconds
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Sqlite database path (sqlite driver)
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Redis connection URL (redis driver)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Key prefix for credential entries (redis driver)
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

fn default_auth_driver() -> String {
    "memory".to_string()
}
fn default_session_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_key_ttl_secs() -> u64 {
    24 * 3600
}
fn default_cleanup_interval_secs() -> u64 {
    600
}
fn default_gc_interval_secs() -> u64 {
    300
}
fn default_sqlite_path() -> String {
    "data/edgevoice.db".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_redis_prefix() -> String {
    "ev:auth:".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            driver: default_auth_driver(),
            session_ttl_secs: default_session_ttl_secs(),
            key_ttl_secs: default_key_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            sqlite_path: default_sqlite_path(),
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
        }
    }
}

/// Device registration and activation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Gate onboarding behind one-time activation codes
    #[serde(default = "default_require_activation")]
    pub require_activation_code: bool,
    /// User id that owns auto-approved devices
    #[serde(default = "default_admin_user_id")]
    pub default_admin_user_id: String,
    /// Activation code TTL in hours
    #[serde(default = "default_code_ttl_hours")]
    pub code_ttl_hours: u64,
}

fn default_require_activation() -> bool {
    true
}
fn default_admin_user_id() -> String {
    "admin".to_string()
}
fn default_code_ttl_hours() -> u64 {
    24
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            require_activation_code: default_require_activation(),
            default_admin_user_id: default_admin_user_id(),
            code_ttl_hours: default_code_ttl_hours(),
        }
    }
}

/// One named provider entry. `data` is driver-specific and handed to the
/// factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl ProviderEntry {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| v.as_u64())
    }
}

/// Provider selection plus pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Active provider name per capability
    #[serde(default = "default_asr_name")]
    pub asr: String,
    #[serde(default = "default_llm_name")]
    pub llm: String,
    #[serde(default = "default_tts_name")]
    pub tts: String,
    #[serde(default = "default_vad_name")]
    pub vad: String,
    /// All configured providers, keyed by name in each entry
    #[serde(default)]
    pub entries: Vec<ProviderEntry>,
    #[serde(default)]
    pub pool: PoolSettings,
}

fn default_asr_name() -> String {
    "volcano".to_string()
}
fn default_llm_name() -> String {
    "openai".to_string()
}
fn default_tts_name() -> String {
    "silence".to_string()
}
fn default_vad_name() -> String {
    "energy".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            asr: default_asr_name(),
            llm: default_llm_name(),
            tts: default_tts_name(),
            vad: default_vad_name(),
            entries: Vec::new(),
            pool: PoolSettings::default(),
        }
    }
}

/// Pool sizing and maintenance cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_min")]
    pub min_size: usize,
    #[serde(default = "default_pool_max")]
    pub max_size: usize,
    /// Idle instances older than this are trimmed past `min_size`
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

fn default_pool_min() -> usize {
    1
}
fn default_pool_max() -> usize {
    4
}
fn default_max_idle_secs() -> u64 {
    600
}
fn default_health_interval_secs() -> u64 {
    300
}
fn default_health_timeout_secs() -> u64 {
    30
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_pool_min(),
            max_size: default_pool_max(),
            max_idle_secs: default_max_idle_secs(),
            health_check_interval_secs: default_health_interval_secs(),
            health_check_timeout_secs: default_health_timeout_secs(),
        }
    }
}

/// Conversation pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// VAD energy sensitivity in [0, 1]
    #[serde(default = "default_vad_sensitivity")]
    pub vad_sensitivity: f32,
    /// Uplink frame duration in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_duration_ms: u32,
    /// Consecutive speech needed to report speech, in milliseconds
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,
    /// Consecutive silence that deactivates, in milliseconds
    #[serde(default = "default_max_silence_ms")]
    pub max_silence_ms: u32,
    /// Idle listening window before the silence prompt, in seconds
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    /// Bounded queue depth between pipeline stages
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_vad_sensitivity() -> f32 {
    0.02
}
fn default_frame_ms() -> u32 {
    20
}
fn default_min_speech_ms() -> u32 {
    200
}
fn default_max_silence_ms() -> u32 {
    800
}
fn default_silence_timeout_secs() -> u64 {
    30
}
fn default_queue_depth() -> usize {
    32
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            vad_sensitivity: default_vad_sensitivity(),
            frame_duration_ms: default_frame_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_silence_ms: default_max_silence_ms(),
            silence_timeout_secs: default_silence_timeout_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Vision upload policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    /// Decode the full image instead of probing headers only
    #[serde(default)]
    pub deep_scan: bool,
    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_max_pixels() -> u64 {
    16_000_000
}
fn default_max_dimension() -> u32 {
    4096
}
fn default_formats() -> Vec<String> {
    ["jpeg", "png", "webp", "gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_vision_timeout_secs() -> u64 {
    10
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_pixels: default_max_pixels(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            formats: default_formats(),
            deep_scan: false,
            timeout_secs: default_vision_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.auth.driver.as_str(), "memory" | "sqlite" | "redis") {
            return Err(ConfigError::Invalid(format!(
                "unknown auth driver '{}'",
                self.auth.driver
            )));
        }
        if !(0.0..=1.0).contains(&self.pipeline.vad_sensitivity) {
            return Err(ConfigError::Invalid(format!(
                "vad_sensitivity {} outside [0, 1]",
                self.pipeline.vad_sensitivity
            )));
        }
        if self.pipeline.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "frame_duration_ms must be positive".to_string(),
            ));
        }
        if self.providers.pool.max_size == 0
            || self.providers.pool.min_size > self.providers.pool.max_size
        {
            return Err(ConfigError::Invalid(format!(
                "pool sizes min={} max={} are inconsistent",
                self.providers.pool.min_size, self.providers.pool.max_size
            )));
        }
        if self.pipeline.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "queue_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Find a configured provider entry by capability kind and name.
    pub fn provider_entry(&self, kind: &str, name: &str) -> Option<&ProviderEntry> {
        self.providers
            .entries
            .iter()
            .find(|e| e.kind == kind && e.name == name)
    }
}

/// Load settings from config files and environment.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from("config", env)
}

/// Load settings rooted at a specific directory (used by tests).
pub fn load_settings_from(dir: &str, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::from(Path::new(dir).join("default")).required(false));

    if let Some(env) = env {
        builder = builder.add_source(File::from(Path::new(dir).join(env)).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("EDGEVOICE").separator("__"))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: Settings = config
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.validate()?;
    tracing::debug!(dir, env = env.unwrap_or("default"), "settings loaded");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_auth_driver() {
        let mut settings = Settings::default();
        settings.auth.driver = "etcd".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_inverted_pool_sizes() {
        let mut settings = Settings::default();
        settings.providers.pool.min_size = 8;
        settings.providers.pool.max_size = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.yaml"),
            "server:\n  port: 9100\nauth:\n  driver: sqlite\n",
        )
        .unwrap();

        let settings = load_settings_from(dir.path().to_str().unwrap(), None).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.auth.driver, "sqlite");
        // Untouched sections keep defaults.
        assert_eq!(settings.pipeline.queue_depth, 32);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(dir.path().to_str().unwrap(), Some("staging")).unwrap();
        assert_eq!(settings.server.port, 8000);
    }
}
