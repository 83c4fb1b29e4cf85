//! Bootstrap graph
//!
//! Boot is an ordered list of steps, each declaring its dependencies and a
//! failure kind. The executor walks the list in declared order, verifies
//! every dependency is already in the completed set, and wraps step failures
//! with the step's kind tag. A missing dependency or a missing executor fails
//! before `execute` runs.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use edgevoice_auth::{create_store, AuthManager, AuthManagerConfig};
use edgevoice_auth::store::SqliteAuthStore;
use edgevoice_config::{load_settings_from, Settings};
use edgevoice_core::{Error, EventBus, Kind};
use edgevoice_llm::{LlmError, Tool, ToolRegistry};
use edgevoice_persistence::PersistenceLayer;
use edgevoice_registry::{DeviceRegistry, DeviceRegistryConfig};

use crate::metrics::init_metrics;
use crate::state::ProviderSet;

/// Failure classification per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Bootstrap,
    Storage,
    Config,
    Transport,
    Vision,
}

impl StepKind {
    fn as_error_kind(self) -> Kind {
        match self {
            StepKind::Bootstrap => Kind::Bootstrap,
            StepKind::Storage => Kind::Storage,
            StepKind::Config => Kind::Config,
            StepKind::Transport => Kind::Transport,
            StepKind::Vision => Kind::Vision,
        }
    }
}

pub type StepExecutor =
    Box<dyn for<'a> FnOnce(&'a mut BootstrapState) -> BoxFuture<'a, Result<(), Error>> + Send>;

/// One step of the graph. `executor` is optional so a wiring mistake (a
/// declared step nobody implemented) is a first-class failure.
pub struct StepSpec {
    pub id: &'static str,
    pub title: &'static str,
    pub depends_on: &'static [&'static str],
    pub kind: StepKind,
    pub executor: Option<StepExecutor>,
}

/// Accumulator threaded through the steps.
#[derive(Default)]
pub struct BootstrapState {
    pub config_dir: String,
    pub env: Option<String>,
    /// Database location; `:memory:` for ephemeral deployments and tests
    pub db_path: String,
    pub settings: Option<Settings>,
    pub persistence: Option<Arc<PersistenceLayer>>,
    pub bus: Option<Arc<EventBus>>,
    pub tools: Option<Arc<ToolRegistry>>,
    pub providers: Option<Arc<ProviderSet>>,
    pub auth: Option<Arc<AuthManager>>,
    pub device_registry: Option<Arc<DeviceRegistry>>,
}

impl BootstrapState {
    pub fn new(config_dir: impl Into<String>, env: Option<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            env,
            db_path: "data/edgevoice.db".to_string(),
            ..Default::default()
        }
    }

    fn settings(&self) -> Result<&Settings, Error> {
        self.settings
            .as_ref()
            .ok_or_else(|| Error::bootstrap("bootstrap", "settings not loaded"))
    }
}

/// Run the graph; returns the completed step ids in execution order.
pub async fn execute_graph(
    steps: Vec<StepSpec>,
    state: &mut BootstrapState,
) -> Result<Vec<&'static str>, Error> {
    let mut completed: HashSet<&'static str> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());

    for step in steps {
        for dep in step.depends_on {
            if !completed.contains(dep) {
                return Err(Error::bootstrap(
                    step.id,
                    format!("dependency '{dep}' not completed"),
                ));
            }
        }
        let Some(executor) = step.executor else {
            return Err(Error::bootstrap(step.id, "missing executor"));
        };

        tracing::info!(step = step.id, title = step.title, "bootstrap step");
        executor(state).await.map_err(|e| {
            Error::new(step.kind.as_error_kind(), step.id, step.title.to_string()).with_source(e)
        })?;

        completed.insert(step.id);
        order.push(step.id);
    }
    Ok(order)
}

fn step<F>(
    id: &'static str,
    title: &'static str,
    depends_on: &'static [&'static str],
    kind: StepKind,
    f: F,
) -> StepSpec
where
    F: for<'a> FnOnce(&'a mut BootstrapState) -> BoxFuture<'a, Result<(), Error>> + Send + 'static,
{
    StepSpec {
        id,
        title,
        depends_on,
        kind,
        executor: Some(Box::new(f)),
    }
}

/// The canonical boot graph.
pub fn canonical_graph() -> Vec<StepSpec> {
    vec![
        step(
            "storage:init-config-store",
            "Prepare data directory",
            &[],
            StepKind::Storage,
            |state| {
                Box::pin(async move {
                    if state.db_path != ":memory:" {
                        if let Some(parent) = std::path::Path::new(&state.db_path).parent() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                Error::wrap(Kind::Storage, "storage.init-config-store", e)
                            })?;
                        }
                    }
                    Ok(())
                })
            },
        ),
        step(
            "storage:init-database",
            "Open database and run migrations",
            &[],
            StepKind::Storage,
            |state| {
                Box::pin(async move {
                    let layer = if state.db_path == ":memory:" {
                        edgevoice_persistence::init_in_memory().await
                    } else {
                        edgevoice_persistence::init(&state.db_path).await
                    }
                    .map_err(|e| Error::wrap(Kind::Storage, "storage.init-database", e))?;
                    state.persistence = Some(Arc::new(layer));
                    Ok(())
                })
            },
        ),
        step(
            "config:load-default",
            "Load configuration",
            &["storage:init-config-store", "storage:init-database"],
            StepKind::Config,
            |state| {
                Box::pin(async move {
                    let settings = load_settings_from(&state.config_dir, state.env.as_deref())
                        .map_err(|e| Error::wrap(Kind::Config, "config.load-default", e))?;
                    state.settings = Some(settings);
                    Ok(())
                })
            },
        ),
        step(
            "logging:init-provider",
            "Initialize structured logging",
            &["config:load-default"],
            StepKind::Bootstrap,
            |state| {
                Box::pin(async move {
                    init_tracing(state.settings()?);
                    Ok(())
                })
            },
        ),
        step(
            "mcp:init-manager",
            "Register host tools",
            &["logging:init-provider"],
            StepKind::Bootstrap,
            |state| {
                Box::pin(async move {
                    let mut tools = ToolRegistry::new();
                    tools.register(ClockTool);
                    tracing::info!(count = tools.len(), "host tools registered");
                    state.tools = Some(Arc::new(tools));
                    Ok(())
                })
            },
        ),
        step(
            "observability:setup-hooks",
            "Install metrics recorder",
            &["logging:init-provider"],
            StepKind::Bootstrap,
            |_state| {
                Box::pin(async move {
                    let _ = init_metrics();
                    Ok(())
                })
            },
        ),
        step(
            "components:init-container",
            "Build event bus and provider pools",
            &["logging:init-provider"],
            StepKind::Bootstrap,
            |state| {
                Box::pin(async move {
                    state.bus = Some(Arc::new(EventBus::new()));
                    let providers = ProviderSet::build(state.settings()?);
                    providers.warm_up_all().await;
                    state.providers = Some(providers);
                    Ok(())
                })
            },
        ),
        step(
            "config:init-integrator",
            "Apply persisted provider selection",
            &["logging:init-provider", "components:init-container"],
            StepKind::Config,
            |state| {
                Box::pin(async move {
                    integrate_config_records(state).await
                })
            },
        ),
        step(
            "auth:init-manager",
            "Start auth manager and device registry",
            &[
                "observability:setup-hooks",
                "storage:init-database",
                "components:init-container",
            ],
            StepKind::Storage,
            |state| {
                Box::pin(async move {
                    let settings = state.settings()?.clone();
                    let persistence = state
                        .persistence
                        .as_ref()
                        .ok_or_else(|| Error::storage("auth.init", "persistence missing"))?
                        .clone();

                    // The sqlite driver shares the main database pool; the
                    // other drivers own their connections.
                    let store = if settings.auth.driver == "sqlite" {
                        Arc::new(
                            SqliteAuthStore::with_pool(persistence.pool.clone())
                                .await
                                .map_err(|e| Error::wrap(Kind::Storage, "auth.init", e))?,
                        ) as Arc<dyn edgevoice_auth::AuthStore>
                    } else {
                        create_store(&settings.auth)
                            .await
                            .map_err(|e| Error::wrap(Kind::Storage, "auth.init", e))?
                    };

                    state.auth = Some(AuthManager::new(
                        store,
                        AuthManagerConfig::from(&settings.auth),
                    ));

                    let registry_config = DeviceRegistryConfig {
                        require_activation_code: settings.device.require_activation_code,
                        default_admin_user_id: settings.device.default_admin_user_id.clone(),
                        code_ttl: chrono::Duration::hours(settings.device.code_ttl_hours as i64),
                    };
                    state.device_registry = Some(Arc::new(DeviceRegistry::new(
                        Arc::new(persistence.devices.clone()),
                        Arc::new(persistence.codes.clone()),
                        registry_config,
                    )));
                    Ok(())
                })
            },
        ),
    ]
}

/// Persisted provider selection wins over the file config; first boot writes
/// the file selection as the initial record.
async fn integrate_config_records(state: &mut BootstrapState) -> Result<(), Error> {
    let persistence = state
        .persistence
        .as_ref()
        .ok_or_else(|| Error::config("config.integrate", "persistence missing"))?
        .clone();
    let settings = state
        .settings
        .as_mut()
        .ok_or_else(|| Error::config("config.integrate", "settings missing"))?;

    let record = persistence
        .config
        .load("providers.selection")
        .await
        .map_err(|e| Error::wrap(Kind::Storage, "config.integrate", e))?;

    match record {
        Some(record) => {
            let mut changed = false;
            let mut apply = |field: &mut String, key: &str| {
                if let Some(name) = record.value.get(key).and_then(|v| v.as_str()) {
                    if field != name {
                        *field = name.to_string();
                        changed = true;
                    }
                }
            };
            apply(&mut settings.providers.asr, "asr");
            apply(&mut settings.providers.llm, "llm");
            apply(&mut settings.providers.tts, "tts");
            apply(&mut settings.providers.vad, "vad");

            if changed {
                tracing::info!(version = record.version, "provider selection overridden by config record");
                let providers = ProviderSet::build(settings);
                providers.warm_up_all().await;
                if let Some(old) = state.providers.replace(providers) {
                    old.close_all().await;
                }
            }
        }
        None => {
            let selection = serde_json::json!({
                "asr": settings.providers.asr,
                "llm": settings.providers.llm,
                "tts": settings.providers.tts,
                "vad": settings.providers.vad,
            });
            persistence
                .config
                .save("providers.selection", &selection, "providers")
                .await
                .map_err(|e| Error::wrap(Kind::Storage, "config.integrate", e))?;
        }
    }
    Ok(())
}

fn init_tracing(settings: &Settings) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("edgevoice={}", settings.observability.log_level).into());

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    // Ignore the error when a subscriber is already installed (tests,
    // embedded use).
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Wall-clock tool the model can call.
struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn definition(&self) -> edgevoice_core::ToolDefinition {
        edgevoice_core::ToolDefinition {
            name: "time".to_string(),
            description: "Get the current local time (HH:MM)".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _arguments: serde_json::Value) -> Result<String, LlmError> {
        Ok(chrono::Local::now().format("%H:%M").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> BootstrapState {
        let mut state = BootstrapState::new("config-does-not-exist", None);
        state.db_path = ":memory:".to_string();
        state
    }

    #[tokio::test]
    async fn canonical_graph_completes_in_declared_order() {
        let mut state = test_state();
        let order = execute_graph(canonical_graph(), &mut state).await.unwrap();
        assert_eq!(
            order,
            vec![
                "storage:init-config-store",
                "storage:init-database",
                "config:load-default",
                "logging:init-provider",
                "mcp:init-manager",
                "observability:setup-hooks",
                "components:init-container",
                "config:init-integrator",
                "auth:init-manager",
            ]
        );
        assert!(state.auth.is_some());
        assert!(state.device_registry.is_some());
        assert!(state.providers.is_some());
        state.auth.unwrap().close().await.unwrap();
    }

    #[tokio::test]
    async fn graph_execution_is_deterministic() {
        let mut first = test_state();
        let order_a = execute_graph(canonical_graph(), &mut first).await.unwrap();
        first.auth.take().unwrap().close().await.unwrap();

        let mut second = test_state();
        let order_b = execute_graph(canonical_graph(), &mut second).await.unwrap();
        second.auth.take().unwrap().close().await.unwrap();

        assert_eq!(order_a, order_b);
    }

    #[tokio::test]
    async fn missing_dependency_fails_before_execute() {
        let steps = vec![step(
            "b",
            "needs a",
            &["a"],
            StepKind::Bootstrap,
            |_state| Box::pin(async { panic!("must not execute") }),
        )];
        let err = execute_graph(steps, &mut test_state()).await.unwrap_err();
        assert_eq!(err.kind(), Kind::Bootstrap);
        assert!(err.message().contains("dependency 'a'"));
    }

    #[tokio::test]
    async fn missing_executor_fails() {
        let steps = vec![StepSpec {
            id: "ghost",
            title: "declared but not implemented",
            depends_on: &[],
            kind: StepKind::Bootstrap,
            executor: None,
        }];
        let err = execute_graph(steps, &mut test_state()).await.unwrap_err();
        assert!(err.message().contains("missing executor"));
    }

    #[tokio::test]
    async fn step_failure_carries_its_kind() {
        let steps = vec![step("boom", "fails", &[], StepKind::Vision, |_state| {
            Box::pin(async { Err(Error::unknown("boom", "nope")) })
        })];
        let err = execute_graph(steps, &mut test_state()).await.unwrap_err();
        // The step's declared kind tags the wrapper; the cause keeps its own.
        assert_eq!(err.op(), "boom");
        assert_eq!(err.kind(), Kind::Unknown); // innermost tag wins
    }

    #[tokio::test]
    async fn persisted_selection_overrides_files() {
        let mut state = test_state();
        execute_graph(canonical_graph(), &mut state).await.unwrap();

        // Simulate an operator switching TTS provider, then reboot.
        let persistence = state.persistence.clone().unwrap();
        persistence
            .config
            .save(
                "providers.selection",
                &serde_json::json!({"asr": "volcano", "llm": "openai", "tts": "http", "vad": "energy"}),
                "providers",
            )
            .await
            .unwrap();
        state.auth.take().unwrap().close().await.unwrap();

        let mut rebooted = test_state();
        // Share nothing: in-memory db is fresh, so seed the record first.
        execute_graph(canonical_graph(), &mut rebooted).await.unwrap();
        rebooted
            .persistence
            .clone()
            .unwrap()
            .config
            .save(
                "providers.selection",
                &serde_json::json!({"tts": "http"}),
                "providers",
            )
            .await
            .unwrap();
        integrate_config_records(&mut rebooted).await.unwrap();
        assert_eq!(rebooted.settings.as_ref().unwrap().providers.tts, "http");
        rebooted.auth.take().unwrap().close().await.unwrap();
    }
}
