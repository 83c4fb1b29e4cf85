//! Application state
//!
//! Everything the HTTP and websocket handlers share: settings, the event bus,
//! the auth manager, the device registry, the provider pools and the
//! connection session registry.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use edgevoice_auth::AuthManager;
use edgevoice_config::{ProviderEntry, Settings};
use edgevoice_core::{EventBus, ProviderInstance, ProviderKind, ToolExecutor};
use edgevoice_llm::{OpenAiBackend, OpenAiConfig};
use edgevoice_pipeline::{
    AsrConfig, EnergyVad, HttpTts, HttpTtsConfig, SilenceTts, StreamingAsr, VadConfig,
};
use edgevoice_providers::{
    InstanceFactory, PoolConfig, ProviderError, ProviderPool, ProviderRegistry,
};
use edgevoice_registry::DeviceRegistry;

use crate::session::SessionManager;

/// Registry plus one warm pool per capability.
pub struct ProviderSet {
    pub registry: Arc<ProviderRegistry>,
    pub asr: Arc<ProviderPool>,
    pub llm: Arc<ProviderPool>,
    pub tts: Arc<ProviderPool>,
    pub vad: Arc<ProviderPool>,
}

impl ProviderSet {
    /// Build the registry with the built-in drivers and one pool per
    /// capability, sized from settings.
    pub fn build(settings: &Settings) -> Arc<Self> {
        let registry = Arc::new(ProviderRegistry::new());
        register_builtin_factories(&registry, settings);

        let pool_config = PoolConfig::from(&settings.providers.pool);
        let make_pool = |kind: ProviderKind, name: &str| {
            let entry = settings
                .provider_entry(&kind.to_string(), name)
                .cloned()
                .unwrap_or_else(|| ProviderEntry {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    data: Default::default(),
                });
            let registry = Arc::clone(&registry);
            let name = name.to_string();
            let pool_name = format!("{kind}/{name}");
            let factory: InstanceFactory =
                Arc::new(move || registry.create(kind, &name, &entry));
            ProviderPool::new(pool_name, factory, pool_config.clone())
        };

        Arc::new(Self {
            asr: make_pool(ProviderKind::Asr, &settings.providers.asr),
            llm: make_pool(ProviderKind::Llm, &settings.providers.llm),
            tts: make_pool(ProviderKind::Tts, &settings.providers.tts),
            vad: make_pool(ProviderKind::Vad, &settings.providers.vad),
            registry,
        })
    }

    pub fn pool(&self, kind: ProviderKind) -> &Arc<ProviderPool> {
        match kind {
            ProviderKind::Asr => &self.asr,
            ProviderKind::Llm => &self.llm,
            ProviderKind::Tts => &self.tts,
            ProviderKind::Vad => &self.vad,
        }
    }

    /// Preload one instance per configured provider so the first conversation
    /// skips the cold start. A single provider failing to warm is logged and
    /// tolerated.
    pub async fn warm_up_all(&self) {
        for pool in [&self.asr, &self.llm, &self.tts, &self.vad] {
            if let Err(e) = pool.warm_up(1).await {
                tracing::warn!(pool = pool.label(), error = %e, "warmup failed, continuing");
            }
        }
    }

    pub async fn close_all(&self) {
        for pool in [&self.asr, &self.llm, &self.tts, &self.vad] {
            pool.close().await;
        }
    }
}

fn register_builtin_factories(registry: &Arc<ProviderRegistry>, settings: &Settings) {
    registry.register(ProviderKind::Asr, "volcano", |entry| {
        let defaults = AsrConfig::default();
        let config = AsrConfig {
            endpoint: entry
                .str_field("endpoint")
                .unwrap_or(&defaults.endpoint)
                .to_string(),
            app_key: entry.str_field("app_key").unwrap_or_default().to_string(),
            access_key: entry
                .str_field("access_key")
                .unwrap_or_default()
                .to_string(),
            resource_id: entry
                .str_field("resource_id")
                .unwrap_or(&defaults.resource_id)
                .to_string(),
            model_name: entry
                .str_field("model_name")
                .unwrap_or(&defaults.model_name)
                .to_string(),
            uid: entry.str_field("uid").unwrap_or(&defaults.uid).to_string(),
            end_window_size: entry
                .u64_field("end_window_size")
                .unwrap_or(defaults.end_window_size as u64) as u32,
            prewarm_size: entry
                .u64_field("prewarm_size")
                .unwrap_or(defaults.prewarm_size as u64) as usize,
            ..defaults
        };
        Ok(ProviderInstance::Asr(StreamingAsr::new(config)))
    });

    registry.register(ProviderKind::Llm, "openai", |entry| {
        let defaults = OpenAiConfig::default();
        let config = OpenAiConfig {
            endpoint: entry
                .str_field("endpoint")
                .unwrap_or(&defaults.endpoint)
                .to_string(),
            api_key: entry.str_field("api_key").map(String::from),
            model: entry
                .str_field("model")
                .unwrap_or(&defaults.model)
                .to_string(),
            ..defaults
        };
        let backend = OpenAiBackend::new(config)
            .map_err(|e| ProviderError::Factory(e.to_string()))?;
        Ok(ProviderInstance::Llm(Arc::new(backend)))
    });

    registry.register(ProviderKind::Tts, "http", |entry| {
        let defaults = HttpTtsConfig::default();
        let config = HttpTtsConfig {
            endpoint: entry
                .str_field("endpoint")
                .unwrap_or(&defaults.endpoint)
                .to_string(),
            api_key: entry.str_field("api_key").map(String::from),
            voice: entry
                .str_field("voice")
                .unwrap_or(&defaults.voice)
                .to_string(),
            format: entry
                .str_field("format")
                .unwrap_or(&defaults.format)
                .to_string(),
            timeout: defaults.timeout,
        };
        let tts = HttpTts::new(config).map_err(|e| ProviderError::Factory(e.to_string()))?;
        Ok(ProviderInstance::Tts(Arc::new(tts)))
    });

    registry.register(ProviderKind::Tts, "silence", |_entry| {
        Ok(ProviderInstance::Tts(Arc::new(SilenceTts::default())))
    });

    let pipeline = settings.pipeline.clone();
    registry.register(ProviderKind::Vad, "energy", move |entry| {
        let config = VadConfig {
            sensitivity: entry
                .data
                .get("sensitivity")
                .and_then(|v| v.as_f64())
                .map(|v| v as f32)
                .unwrap_or(pipeline.vad_sensitivity),
            frame_duration_ms: pipeline.frame_duration_ms,
            min_speech_ms: pipeline.min_speech_ms,
            max_silence_ms: pipeline.max_silence_ms,
        };
        Ok(ProviderInstance::Vad(Arc::new(EnergyVad::new(config))))
    });
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<RwLock<Settings>>,
    pub bus: Arc<EventBus>,
    pub auth: Arc<AuthManager>,
    pub device_registry: Arc<DeviceRegistry>,
    pub providers: Arc<ProviderSet>,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<dyn ToolExecutor>,
}

impl AppState {
    pub fn session_manager_from(settings: &Settings) -> Arc<SessionManager> {
        Arc::new(SessionManager::with_timeouts(
            settings.server.max_connections,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ))
    }
}
