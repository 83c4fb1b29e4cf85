//! Tool-augmented streaming LLM driver
//!
//! The driver streams completions as a lazy sequence of [`LlmChunk`]s and
//! surfaces tool calls without executing them — tool execution is the
//! orchestrator's job, which re-invokes the driver with `tool_result`
//! messages appended.

mod driver;
mod tools;

pub use driver::{OpenAiBackend, OpenAiConfig};
pub use tools::{Tool, ToolRegistry};

pub use edgevoice_core::llm::{ChatRequest, LlmChunk, Message, Role, TokenUsage, ToolCall};

use edgevoice_core::{Error, Kind};
use thiserror::Error as ThisError;

/// LLM driver errors.
#[derive(ThisError, Debug)]
pub enum LlmError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed stream payload: {0}")]
    Protocol(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{name}' failed: {message}")]
    ToolFailed { name: String, message: String },
}

impl LlmError {
    /// Transient failures worth a retry on the cold path.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Request(_) => true,
            LlmError::Upstream { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<LlmError> for Error {
    fn from(err: LlmError) -> Self {
        let kind = match &err {
            LlmError::Configuration(_) => Kind::Config,
            LlmError::Request(_) => Kind::Transport,
            LlmError::Upstream { .. } | LlmError::Protocol(_) => Kind::Platform,
            LlmError::ToolNotFound(_) | LlmError::ToolFailed { .. } => Kind::Domain,
        };
        Error::new(kind, "llm", err.to_string()).with_source(err)
    }
}
