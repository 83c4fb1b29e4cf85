//! Streaming ASR driver
//!
//! Binary-framed websocket protocol: chunked gzip upload, sequence tags, a
//! last-frame flag, and a pre-connect layer that hides dial latency.

mod client;
mod prewarm;
pub mod protocol;

pub use client::{
    AsrConfig, SessionState, StreamingAsr, CODE_SESSION_TIMEOUT, SILENCE_TIMEOUT_TEXT,
};
pub use prewarm::PreConnectPool;
