//! Conversation pipeline
//!
//! Everything between the device socket and the upstream speech/model
//! services: the voice-activity gate, the streaming recognizer driver, the
//! ordered synthesis driver, and the per-connection orchestrator tying them
//! together.

pub mod asr;
pub mod orchestrator;
pub mod tts;
pub mod vad;

pub use asr::{AsrConfig, PreConnectPool, SessionState, StreamingAsr, SILENCE_TIMEOUT_TEXT};
pub use orchestrator::{
    CancelToken, ConversationState, ConversationTurn, Orchestrator, OrchestratorConfig,
    OutboundFrame,
};
pub use tts::{HttpTts, HttpTtsConfig, SentenceSegmenter, SilenceTts, TtsText};
pub use vad::{EnergyVad, VadConfig};

use thiserror::Error;

/// Pipeline errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("pipeline not initialized: {0}")]
    NotInitialized(String),
}

impl From<PipelineError> for edgevoice_core::Error {
    fn from(err: PipelineError) -> Self {
        let kind = match &err {
            PipelineError::Protocol(_) => edgevoice_core::Kind::Platform,
            PipelineError::Transport(_) => edgevoice_core::Kind::Transport,
            PipelineError::NotInitialized(_) => edgevoice_core::Kind::Config,
        };
        edgevoice_core::Error::new(kind, "pipeline", err.to_string()).with_source(err)
    }
}
