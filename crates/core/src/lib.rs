//! Core traits and types for the edge voice fleet server
//!
//! This crate provides the foundations shared by all other crates:
//! - The tagged error type and result alias
//! - The in-process event bus decoupling drivers from the orchestrator
//! - Chat / tool-call types for the LLM driver
//! - Audio frame types for the device uplink
//! - Capability traits for pluggable ASR / LLM / TTS / VAD back-ends

pub mod audio;
pub mod error;
pub mod events;
pub mod llm;
pub mod provider;

pub use audio::{AudioFormat, AudioFrame, SAMPLE_RATE};
pub use error::{Error, Kind, Result};
pub use events::{Event, EventBus, Topic};
pub use llm::{
    ChatRequest, LlmChunk, Message, Role, TokenUsage, ToolCall, ToolDefinition, ToolExecutor,
};
pub use provider::{
    AsrEngine, AsrEvent, AsrStreamHandle, AsrStreamOptions, LlmEngine, Provider, ProviderInstance,
    ProviderKind, TtsChunk, TtsEngine, TtsRequest, VadEngine,
};
