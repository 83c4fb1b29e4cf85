//! Capability traits for pluggable ASR / LLM / TTS / VAD back-ends
//!
//! Concrete drivers implement one capability trait plus the shared
//! [`Provider`] lifecycle. The pool talks only to the lifecycle; the
//! orchestrator talks only to the capability.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::{AudioFormat, AudioFrame};
use crate::error::Result;
use crate::llm::{ChatRequest, LlmChunk};

/// Provider capability kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Asr,
    Llm,
    Tts,
    Vad,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Asr => "asr",
            ProviderKind::Llm => "llm",
            ProviderKind::Tts => "tts",
            ProviderKind::Vad => "vad",
        };
        f.write_str(s)
    }
}

/// Shared provider lifecycle. Instances are pooled: `reset` is invoked on
/// release, `health_check` by the pool's periodic ticker, `close` on eviction
/// and shutdown.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Clear per-conversation state so the instance can be reused.
    fn reset(&self) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Events emitted by an open recognition stream.
#[derive(Debug, Clone)]
pub enum AsrEvent {
    Partial { text: String },
    Final { text: String },
    /// Server closed the stream cooperatively (last package, or a recoverable
    /// upstream session timeout). The caller may open a new stream.
    Closed,
    Error { message: String },
}

/// Options for opening a recognition stream.
#[derive(Debug, Clone)]
pub struct AsrStreamOptions {
    pub session_id: String,
    pub format: AudioFormat,
}

impl AsrStreamOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            format: AudioFormat::default(),
        }
    }
}

/// Write side of an open recognition stream. The read side is the
/// [`AsrEvent`] receiver returned alongside it.
#[async_trait]
pub trait AsrStreamHandle: Send {
    /// Push one audio frame upstream. `last` marks the final frame of the
    /// utterance.
    async fn send_audio(&mut self, pcm: Vec<u8>, last: bool) -> Result<()>;

    /// Abort the in-flight utterance and make the stream reusable. Must
    /// complete before the next `send_audio`.
    async fn reset(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Streaming speech recognizer.
#[async_trait]
pub trait AsrEngine: Provider {
    async fn open_stream(
        &self,
        opts: AsrStreamOptions,
    ) -> Result<(Box<dyn AsrStreamHandle>, mpsc::Receiver<AsrEvent>)>;
}

/// Tool-augmented language model. The stream ends with `LlmChunk::Final`;
/// tool execution is the caller's job.
pub trait LlmEngine: Provider {
    fn chat_stream(&self, request: ChatRequest) -> BoxStream<'static, Result<LlmChunk>>;
}

/// One synthesized audio chunk.
#[derive(Debug, Clone)]
pub struct TtsChunk {
    pub audio: Vec<u8>,
    pub text_index: u32,
    pub is_final: bool,
}

/// Synthesis request for one text segment of a turn.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub session_id: String,
    pub text: String,
    pub text_index: u32,
    pub round: u64,
}

/// Streaming speech synthesizer. Chunks are delivered through `tx`; dropping
/// the receiver cancels the synthesis and discards not-yet-emitted bytes.
#[async_trait]
pub trait TtsEngine: Provider {
    async fn synthesize(&self, request: TtsRequest, tx: mpsc::Sender<TtsChunk>) -> Result<()>;
}

/// Frame-level speech/silence classifier. Stateful per instance; the pool
/// resets it between conversations.
pub trait VadEngine: Provider {
    /// Returns true once enough consecutive speech frames have accumulated.
    fn process_frame(&self, frame: &AudioFrame) -> Result<bool>;
}

/// Capability-typed handle produced by the provider registry and held by the
/// pool.
#[derive(Debug, Clone)]
pub enum ProviderInstance {
    Asr(Arc<dyn AsrEngine>),
    Llm(Arc<dyn LlmEngine>),
    Tts(Arc<dyn TtsEngine>),
    Vad(Arc<dyn VadEngine>),
}

/// Dispatch a lifecycle call to whichever capability is inside.
macro_rules! delegate {
    ($self:ident, $p:ident => $body:expr) => {
        match $self {
            ProviderInstance::Asr($p) => $body,
            ProviderInstance::Llm($p) => $body,
            ProviderInstance::Tts($p) => $body,
            ProviderInstance::Vad($p) => $body,
        }
    };
}

impl ProviderInstance {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderInstance::Asr(_) => ProviderKind::Asr,
            ProviderInstance::Llm(_) => ProviderKind::Llm,
            ProviderInstance::Tts(_) => ProviderKind::Tts,
            ProviderInstance::Vad(_) => ProviderKind::Vad,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        delegate!(self, p => p.initialize().await)
    }

    pub async fn health_check(&self) -> Result<()> {
        delegate!(self, p => p.health_check().await)
    }

    pub fn reset(&self) {
        delegate!(self, p => p.reset())
    }

    pub async fn close(&self) -> Result<()> {
        delegate!(self, p => p.close().await)
    }

    pub fn as_asr(&self) -> Option<Arc<dyn AsrEngine>> {
        match self {
            ProviderInstance::Asr(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_llm(&self) -> Option<Arc<dyn LlmEngine>> {
        match self {
            ProviderInstance::Llm(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_tts(&self) -> Option<Arc<dyn TtsEngine>> {
        match self {
            ProviderInstance::Tts(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_vad(&self) -> Option<Arc<dyn VadEngine>> {
        match self {
            ProviderInstance::Vad(p) => Some(p.clone()),
            _ => None,
        }
    }
}
