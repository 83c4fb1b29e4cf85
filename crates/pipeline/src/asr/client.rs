//! Streaming ASR session over the binary-framed websocket
//!
//! One writer task pushes audio (plus a 200 ms empty-frame keep-alive) and one
//! reader task parses server responses into [`AsrEvent`]s. A fatal error or
//! cancellation forces `Closed` from any state and releases the socket.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use edgevoice_core::{
    AsrEngine, AsrEvent, AsrStreamHandle, AsrStreamOptions, Provider, ProviderKind,
};

use super::prewarm::PreConnectPool;
use super::protocol::{
    encode_client_audio, encode_client_full, parse_frame, parse_server_response, HandshakeAudio,
    HandshakeParams, HandshakeRequest, HandshakeUser, MessageType,
};
use crate::PipelineError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upstream session timeout; the server tears the session down but the
/// conversation survives — close silently and let the orchestrator restart.
pub const CODE_SESSION_TIMEOUT: i64 = 45_000_081;

/// Synthetic transcript surfaced when the user stays silent past the idle
/// window.
pub const SILENCE_TIMEOUT_TEXT: &str = "[SILENCE_TIMEOUT] user idle, prompt politely";

/// Recognizer connection settings.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub endpoint: String,
    pub app_key: String,
    pub access_key: String,
    pub resource_id: String,
    pub model_name: String,
    pub uid: String,
    pub end_window_size: u32,
    pub dial_timeout: Duration,
    pub keepalive_interval: Duration,
    pub silence_timeout: Duration,
    /// Warm connections to keep ahead of demand; zero disables pre-warming
    pub prewarm_size: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.example.com/api/v3/sauc/bigmodel".to_string(),
            app_key: String::new(),
            access_key: String::new(),
            resource_id: "volc.bigasr.sauc.duration".to_string(),
            model_name: "bigmodel".to_string(),
            uid: "edgevoice".to_string(),
            end_window_size: 600,
            dial_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(200),
            silence_timeout: Duration::from_secs(30),
            prewarm_size: 1,
        }
    }
}

/// Recognition session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Streaming,
    Draining,
    Closed,
}

/// Dial the recognizer with auth headers applied.
pub(crate) async fn dial(config: &AsrConfig) -> Result<WsStream, PipelineError> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| PipelineError::Transport(format!("bad endpoint: {e}")))?;

    let headers = request.headers_mut();
    let header = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| PipelineError::Transport(format!("bad header: {e}")))
    };
    headers.insert("X-Api-App-Key", header(&config.app_key)?);
    headers.insert("X-Api-Access-Key", header(&config.access_key)?);
    headers.insert("X-Api-Resource-Id", header(&config.resource_id)?);
    headers.insert(
        "X-Api-Connect-Id",
        header(&uuid::Uuid::new_v4().to_string())?,
    );

    let (ws, _response) = tokio::time::timeout(config.dial_timeout, connect_async(request))
        .await
        .map_err(|_| PipelineError::Transport("asr dial timed out".to_string()))?
        .map_err(|e| PipelineError::Transport(format!("asr dial failed: {e}")))?;
    Ok(ws)
}

/// Streaming recognizer engine. Opens one upstream session per conversation,
/// adopting a pre-established connection when one is available.
pub struct StreamingAsr {
    config: AsrConfig,
    prewarm: Arc<PreConnectPool>,
}

impl StreamingAsr {
    pub fn new(config: AsrConfig) -> Arc<Self> {
        let prewarm = PreConnectPool::new(config.clone());
        if config.prewarm_size > 0 {
            prewarm.start();
        }
        Arc::new(Self { config, prewarm })
    }

    fn handshake_request(&self, opts: &AsrStreamOptions) -> HandshakeRequest {
        HandshakeRequest {
            user: HandshakeUser {
                uid: self.config.uid.clone(),
            },
            audio: HandshakeAudio {
                format: opts.format.format.clone(),
                rate: opts.format.rate,
                bits: opts.format.bits,
                channel: opts.format.channel,
                language: opts.format.language.clone(),
            },
            request: HandshakeParams {
                model_name: self.config.model_name.clone(),
                end_window_size: self.config.end_window_size,
                enable_punc: true,
                enable_itn: true,
                enable_ddc: false,
                result_type: "single".to_string(),
                show_utterances: true,
            },
        }
    }
}

#[async_trait]
impl Provider for StreamingAsr {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Asr
    }

    async fn health_check(&self) -> edgevoice_core::Result<()> {
        let mut ws = dial(&self.config)
            .await
            .map_err(|e| edgevoice_core::Error::transport("asr.health", e.to_string()))?;
        let _ = ws.close(None).await;
        Ok(())
    }

    async fn close(&self) -> edgevoice_core::Result<()> {
        self.prewarm.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl AsrEngine for StreamingAsr {
    async fn open_stream(
        &self,
        opts: AsrStreamOptions,
    ) -> edgevoice_core::Result<(
        Box<dyn AsrStreamHandle>,
        mpsc::Receiver<AsrEvent>,
    )> {
        let state = Arc::new(Mutex::new(SessionState::Connecting));
        let session_id = opts.session_id.clone();

        // Adopt a warm socket if one is ready; dial otherwise, retrying the
        // cold path twice with a growing backoff.
        let mut ws = match self.prewarm.adopt().await {
            Some(ws) => {
                tracing::debug!(session_id = %session_id, "adopted pre-warmed asr connection");
                ws
            }
            None => {
                let mut attempt = 0u32;
                loop {
                    match dial(&self.config).await {
                        Ok(ws) => break ws,
                        Err(e) if attempt < 2 => {
                            attempt += 1;
                            let backoff = Duration::from_millis(500) * attempt;
                            tracing::warn!(
                                session_id = %session_id,
                                attempt,
                                error = %e,
                                "asr dial failed, backing off"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        Err(e) => {
                            return Err(edgevoice_core::Error::transport(
                                "asr.dial",
                                e.to_string(),
                            ))
                        }
                    }
                }
            }
        };

        // Handshake: one client-full frame, one server acknowledgement.
        *state.lock() = SessionState::Handshaking;
        let handshake = encode_client_full(&self.handshake_request(&opts))
            .map_err(|e| edgevoice_core::Error::platform("asr.handshake", e.to_string()))?;
        ws.send(Message::Binary(handshake))
            .await
            .map_err(|e| edgevoice_core::Error::transport("asr.handshake", e.to_string()))?;

        loop {
            let msg = tokio::time::timeout(self.config.dial_timeout, ws.next())
                .await
                .map_err(|_| {
                    edgevoice_core::Error::transport("asr.handshake", "ack timed out")
                })?
                .ok_or_else(|| {
                    edgevoice_core::Error::transport("asr.handshake", "socket closed during ack")
                })?
                .map_err(|e| edgevoice_core::Error::transport("asr.handshake", e.to_string()))?;

            match msg {
                Message::Binary(bytes) => {
                    let frame = parse_frame(&bytes)
                        .map_err(|e| edgevoice_core::Error::platform("asr.handshake", e.to_string()))?;
                    if frame.message_type == MessageType::ServerError {
                        return Err(edgevoice_core::Error::platform(
                            "asr.handshake",
                            format!(
                                "server rejected handshake: code {:?}",
                                frame.error_code
                            ),
                        ));
                    }
                    break;
                }
                // Stale control traffic from the pre-warmed socket.
                Message::Ping(_) | Message::Pong(_) => continue,
                other => {
                    return Err(edgevoice_core::Error::platform(
                        "asr.handshake",
                        format!("unexpected handshake message: {other:?}"),
                    ))
                }
            }
        }

        *state.lock() = SessionState::Streaming;
        tracing::debug!(session_id = %session_id, "asr session streaming");

        let (write_half, read_half) = ws.split();
        let (cmd_tx, cmd_rx) = mpsc::channel::<WriterCmd>(32);
        let (event_tx, event_rx) = mpsc::channel::<AsrEvent>(32);

        let listen_started = Arc::new(Mutex::new(Instant::now()));

        tokio::spawn(writer_task(
            write_half,
            cmd_rx,
            self.config.keepalive_interval,
            state.clone(),
        ));
        tokio::spawn(reader_task(
            read_half,
            event_tx,
            state.clone(),
            listen_started.clone(),
            self.config.silence_timeout,
            session_id,
        ));

        let handle = AsrStream {
            cmd_tx,
            state,
            listen_started,
        };
        Ok((Box::new(handle), event_rx))
    }
}

enum WriterCmd {
    Audio { pcm: Vec<u8>, last: bool },
    Close,
}

async fn writer_task(
    mut sink: SplitSink<WsStream, Message>,
    mut cmd_rx: mpsc::Receiver<WriterCmd>,
    keepalive: Duration,
    state: Arc<Mutex<SessionState>>,
) {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WriterCmd::Audio { pcm, last }) => {
                        let frame = match encode_client_audio(&pcm, last) {
                            Ok(f) => f,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to encode audio frame");
                                continue;
                            }
                        };
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                        if last {
                            *state.lock() = SessionState::Draining;
                        }
                    }
                    Some(WriterCmd::Close) | None => break,
                }
            }
            _ = ticker.tick() => {
                // Keep-alive: one empty audio frame while streaming.
                if *state.lock() != SessionState::Streaming {
                    continue;
                }
                let frame = match encode_client_audio(&[], false) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn reader_task(
    mut stream: SplitStream<WsStream>,
    event_tx: mpsc::Sender<AsrEvent>,
    state: Arc<Mutex<SessionState>>,
    listen_started: Arc<Mutex<Instant>>,
    silence_timeout: Duration,
    session_id: String,
) {
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(m) => m,
            Err(e) => {
                if *state.lock() != SessionState::Closed {
                    let _ = event_tx
                        .send(AsrEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
                break;
            }
        };

        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Close(_) => {
                let _ = event_tx.send(AsrEvent::Closed).await;
                break;
            }
            _ => continue,
        };

        let frame = match parse_frame(&bytes) {
            Ok(f) => f,
            Err(e) => {
                let _ = event_tx
                    .send(AsrEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        };

        match frame.message_type {
            MessageType::ServerError => {
                let code = frame.error_code.map(i64::from).unwrap_or(-1);
                if code == CODE_SESSION_TIMEOUT {
                    tracing::debug!(session_id = %session_id, "asr server session timeout, closing quietly");
                    let _ = event_tx.send(AsrEvent::Closed).await;
                } else {
                    let _ = event_tx
                        .send(AsrEvent::Error {
                            message: format!("server error code {code}"),
                        })
                        .await;
                }
                break;
            }
            MessageType::ServerFull | MessageType::ServerAck => {
                let response = match parse_server_response(&frame) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = event_tx
                            .send(AsrEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                };

                if response.code != 0 {
                    if response.code == CODE_SESSION_TIMEOUT {
                        tracing::debug!(session_id = %session_id, "asr server session timeout, closing quietly");
                        let _ = event_tx.send(AsrEvent::Closed).await;
                    } else {
                        let _ = event_tx
                            .send(AsrEvent::Error {
                                message: format!(
                                    "server error code {}: {}",
                                    response.code, response.message
                                ),
                            })
                            .await;
                    }
                    break;
                }

                if let Some(result) = response.result {
                    let definite = result.is_definite();
                    if definite && result.text.is_empty() {
                        // Idle window check: an empty final past the timeout
                        // becomes the silence prompt and resets the clock.
                        let elapsed = listen_started.lock().elapsed();
                        if elapsed >= silence_timeout {
                            *listen_started.lock() = Instant::now();
                            if event_tx
                                .send(AsrEvent::Final {
                                    text: SILENCE_TIMEOUT_TEXT.to_string(),
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    } else if definite {
                        *listen_started.lock() = Instant::now();
                        if event_tx
                            .send(AsrEvent::Final { text: result.text })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    } else if !result.text.is_empty()
                        && event_tx
                            .send(AsrEvent::Partial { text: result.text })
                            .await
                            .is_err()
                    {
                        break;
                    }
                }

                if response.is_last_package {
                    let _ = event_tx.send(AsrEvent::Closed).await;
                    break;
                }
            }
            other => {
                tracing::debug!(?other, "ignoring unexpected frame from server");
            }
        }
    }
    *state.lock() = SessionState::Closed;
}

/// Write side of an open session.
struct AsrStream {
    cmd_tx: mpsc::Sender<WriterCmd>,
    state: Arc<Mutex<SessionState>>,
    listen_started: Arc<Mutex<Instant>>,
}

#[async_trait]
impl AsrStreamHandle for AsrStream {
    async fn send_audio(&mut self, pcm: Vec<u8>, last: bool) -> edgevoice_core::Result<()> {
        if *self.state.lock() == SessionState::Closed {
            return Err(edgevoice_core::Error::transport(
                "asr.send",
                "session closed",
            ));
        }
        self.cmd_tx
            .send(WriterCmd::Audio { pcm, last })
            .await
            .map_err(|_| edgevoice_core::Error::transport("asr.send", "writer task gone"))
    }

    async fn reset(&mut self) -> edgevoice_core::Result<()> {
        // End the in-flight utterance and give the remote a beat to clean up
        // before the next send.
        let _ = self
            .cmd_tx
            .send(WriterCmd::Audio {
                pcm: Vec::new(),
                last: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        *self.listen_started.lock() = Instant::now();
        Ok(())
    }

    async fn close(&mut self) -> edgevoice_core::Result<()> {
        let _ = self.cmd_tx.send(WriterCmd::Close).await;
        *self.state.lock() = SessionState::Closed;
        Ok(())
    }
}
