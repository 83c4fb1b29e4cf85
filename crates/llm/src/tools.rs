//! Host-side tool registry
//!
//! Tools run on the server, never in the driver. The orchestrator looks up
//! calls requested by the model, executes them here, and feeds results back
//! as `tool_result` messages.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use edgevoice_core::llm::ToolDefinition;

use crate::LlmError;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, arguments: Value) -> Result<String, LlmError>;

    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// Named tool collection advertised to the model.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = tool.definition().name;
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute one call with the tool's timeout. The raw argument string comes
    /// straight from the model; an unparsable payload is treated as `{}` so a
    /// sloppy model cannot wedge the turn.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> Result<String, LlmError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| LlmError::ToolNotFound(name.to_string()))?;

        let arguments: Value =
            serde_json::from_str(raw_arguments).unwrap_or(Value::Object(Default::default()));

        match tokio::time::timeout(tool.timeout(), tool.call(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::ToolFailed {
                name: name.to_string(),
                message: format!("timed out after {:?}", tool.timeout()),
            }),
        }
    }
}

#[async_trait]
impl edgevoice_core::ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        ToolRegistry::definitions(self)
    }

    async fn execute(&self, name: &str, arguments: &str) -> edgevoice_core::Result<String> {
        ToolRegistry::execute(self, name, arguments)
            .await
            .map_err(Into::into)
    }
}
