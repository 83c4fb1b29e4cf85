//! Streaming TTS driver
//!
//! The orchestrator feeds text segments with monotonic `text_index`; audio
//! comes back in the same order because segments are synthesized one at a
//! time per conversation. Dropping the output receiver cancels synthesis and
//! discards anything not yet emitted.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use edgevoice_core::{Provider, ProviderKind, Result, TtsChunk, TtsEngine, TtsRequest};

/// One queued text segment of a turn.
#[derive(Debug, Clone)]
pub struct TtsText {
    pub text: String,
    pub text_index: u32,
}

/// Drive one turn's synthesis strictly in text-index order. Returns when the
/// text channel closes and the last segment has been emitted, or when the
/// output side goes away (cancellation).
pub async fn synthesize_ordered(
    engine: Arc<dyn TtsEngine>,
    session_id: String,
    round: u64,
    mut text_rx: mpsc::Receiver<TtsText>,
    out_tx: mpsc::Sender<TtsChunk>,
) -> Result<()> {
    let mut expected_index = 0u32;

    while let Some(segment) = text_rx.recv().await {
        if segment.text_index != expected_index {
            tracing::warn!(
                session_id = %session_id,
                got = segment.text_index,
                expected = expected_index,
                "tts segment out of order"
            );
        }
        expected_index = segment.text_index + 1;

        let request = TtsRequest {
            session_id: session_id.clone(),
            text: segment.text,
            text_index: segment.text_index,
            round,
        };

        let (seg_tx, mut seg_rx) = mpsc::channel::<TtsChunk>(32);
        let engine_fut = engine.synthesize(request, seg_tx);
        let forward_fut = async {
            while let Some(chunk) = seg_rx.recv().await {
                if out_tx.send(chunk).await.is_err() {
                    return false;
                }
            }
            true
        };

        let (synth_result, delivered) = tokio::join!(engine_fut, forward_fut);
        if !delivered {
            // Output side dropped: barge-in or teardown. Discard the rest.
            tracing::debug!(session_id = %session_id, round, "tts output cancelled");
            return Ok(());
        }
        synth_result?;
    }
    Ok(())
}

/// Buffers streamed LLM text and cuts it at sentence boundaries so synthesis
/// can start before the model finishes.
pub struct SentenceSegmenter {
    buffer: String,
    max_chars: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(80)
    }
}

impl SentenceSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars,
        }
    }

    fn is_boundary(c: char) -> bool {
        matches!(c, '。' | '！' | '？' | '!' | '?' | '.' | ';' | '；' | '\n')
    }

    /// Feed a delta; returns any complete segments.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut segments = Vec::new();
        for c in delta.chars() {
            self.buffer.push(c);
            let cut = Self::is_boundary(c) || self.buffer.chars().count() >= self.max_chars;
            if cut {
                let segment = self.buffer.trim().to_string();
                self.buffer.clear();
                if !segment.is_empty() {
                    segments.push(segment);
                }
            }
        }
        segments
    }

    /// Remaining text at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        let segment = self.buffer.trim().to_string();
        self.buffer.clear();
        if segment.is_empty() {
            None
        } else {
            Some(segment)
        }
    }
}

/// HTTP synthesis backend: POST the text, stream audio bytes back.
#[derive(Debug, Clone)]
pub struct HttpTtsConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub format: String,
    pub timeout: Duration,
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9880".to_string(),
            api_key: None,
            voice: "default".to_string(),
            format: "pcm".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpTts {
    client: reqwest::Client,
    config: HttpTtsConfig,
}

impl HttpTts {
    pub fn new(config: HttpTtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| edgevoice_core::Error::config("tts.init", e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Provider for HttpTts {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tts
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| edgevoice_core::Error::transport("tts.health", e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(edgevoice_core::Error::platform(
                "tts.health",
                format!("status {}", response.status()),
            ))
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTts {
    async fn synthesize(&self, request: TtsRequest, tx: mpsc::Sender<TtsChunk>) -> Result<()> {
        let url = format!("{}/synthesize", self.config.endpoint.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(&serde_json::json!({
            "text": request.text,
            "voice": self.config.voice,
            "format": self.config.format,
        }));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| edgevoice_core::Error::transport("tts.synthesize", e.to_string()))?;
        if !response.status().is_success() {
            return Err(edgevoice_core::Error::platform(
                "tts.synthesize",
                format!("status {}", response.status()),
            ));
        }

        let mut body = response.bytes_stream();
        while let Some(next) = body.next().await {
            let bytes = next
                .map_err(|e| edgevoice_core::Error::transport("tts.synthesize", e.to_string()))?;
            if bytes.is_empty() {
                continue;
            }
            if tx
                .send(TtsChunk {
                    audio: bytes.to_vec(),
                    text_index: request.text_index,
                    is_final: false,
                })
                .await
                .is_err()
            {
                // Receiver dropped: cancelled mid-stream.
                return Ok(());
            }
        }

        let _ = tx
            .send(TtsChunk {
                audio: Vec::new(),
                text_index: request.text_index,
                is_final: true,
            })
            .await;
        Ok(())
    }
}

/// Synthesizes silence. Stands in for a real backend in tests and keeps the
/// pipeline runnable with no upstream configured.
pub struct SilenceTts {
    /// Milliseconds of audio per character of input
    pub ms_per_char: u32,
}

impl Default for SilenceTts {
    fn default() -> Self {
        Self { ms_per_char: 50 }
    }
}

#[async_trait]
impl Provider for SilenceTts {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tts
    }
}

#[async_trait]
impl TtsEngine for SilenceTts {
    async fn synthesize(&self, request: TtsRequest, tx: mpsc::Sender<TtsChunk>) -> Result<()> {
        let total_ms = request.text.chars().count() as u32 * self.ms_per_char;
        // 20 ms of 16 kHz mono 16-bit PCM per chunk, paced like a real
        // synthesis stream.
        let chunk = vec![0u8; 640];
        for _ in 0..(total_ms / 20).max(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if tx
                .send(TtsChunk {
                    audio: chunk.clone(),
                    text_index: request.text_index,
                    is_final: false,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        let _ = tx
            .send(TtsChunk {
                audio: Vec::new(),
                text_index: request.text_index,
                is_final: true,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segmenter_cuts_at_sentence_boundaries() {
        let mut seg = SentenceSegmenter::default();
        assert!(seg.push("现在是").is_empty());
        let out = seg.push("下午两点半。还有什么");
        assert_eq!(out, vec!["现在是下午两点半。"]);
        assert_eq!(seg.flush().as_deref(), Some("还有什么"));
        assert!(seg.flush().is_none());
    }

    #[test]
    fn segmenter_cuts_overlong_runs() {
        let mut seg = SentenceSegmenter::new(10);
        let out = seg.push("abcdefghijklmnop");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chars().count(), 10);
    }

    #[tokio::test]
    async fn ordered_synthesis_preserves_index_order() {
        let engine: Arc<dyn TtsEngine> = Arc::new(SilenceTts { ms_per_char: 20 });
        let (text_tx, text_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(64);

        let driver = tokio::spawn(synthesize_ordered(
            engine,
            "s1".to_string(),
            1,
            text_rx,
            out_tx,
        ));

        for (i, text) in ["第一段。", "第二段。", "第三段。"].iter().enumerate() {
            text_tx
                .send(TtsText {
                    text: text.to_string(),
                    text_index: i as u32,
                })
                .await
                .unwrap();
        }
        drop(text_tx);

        let mut indices = Vec::new();
        while let Some(chunk) = out_rx.recv().await {
            indices.push(chunk.text_index);
        }
        driver.await.unwrap().unwrap();

        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted, "chunks must arrive in text-index order");
        assert_eq!(*indices.last().unwrap(), 2);
    }

    #[tokio::test]
    async fn dropping_output_cancels() {
        let engine: Arc<dyn TtsEngine> = Arc::new(SilenceTts { ms_per_char: 1000 });
        let (text_tx, text_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(1);

        text_tx
            .send(TtsText {
                text: "很长很长的一句话".to_string(),
                text_index: 0,
            })
            .await
            .unwrap();

        drop(out_rx);
        let result = synthesize_ordered(
            Arc::clone(&engine),
            "s1".to_string(),
            1,
            text_rx,
            out_tx,
        )
        .await;
        assert!(result.is_ok());
    }
}
