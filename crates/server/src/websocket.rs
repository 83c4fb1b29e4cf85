//! Device data plane
//!
//! One bidirectional stream per connection: binary frames carry audio, text
//! frames carry tagged JSON control messages. The first message must be
//! `hello`; the reply carries the session id and the symmetric key material
//! for the secure channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use edgevoice_core::{AudioFrame, Event};
use edgevoice_pipeline::{Orchestrator, OrchestratorConfig, OutboundFrame};

use crate::metrics;
use crate::state::AppState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-to-server control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Hello {
        device_id: String,
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Abort,
    ListenStart,
    ListenStop,
    TtsState {
        #[serde(default)]
        state: String,
    },
}

/// Server-to-client control messages; audio goes out as binary frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Hello {
        session_id: String,
        sym_key: String,
        nonce: String,
        audio_params: AudioParams,
    },
    AsrResult {
        text: String,
        is_final: bool,
    },
    LlmChunk {
        text: String,
        is_final: bool,
    },
    SystemError {
        message: String,
    },
}

#[derive(Debug, Serialize)]
struct AudioParams {
    format: &'static str,
    sample_rate: u32,
    channels: u32,
    frame_duration_ms: u32,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // The device must introduce itself before anything else flows.
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg @ ClientMessage::Hello { .. }) => msg,
            Ok(_) => {
                let _ = send_error(&mut socket, "first message must be hello").await;
                return;
            }
            Err(e) => {
                let _ = send_error(&mut socket, &format!("malformed hello: {e}")).await;
                return;
            }
        },
        _ => {
            tracing::debug!("socket closed before hello");
            return;
        }
    };

    let ClientMessage::Hello {
        device_id,
        client_id,
        username,
        password,
    } = hello
    else {
        unreachable!("matched above");
    };

    // Gate: only approved devices get a conversation.
    match state.device_registry.get_device(&device_id).await {
        Ok(Some(device)) if device.is_approved() => {}
        Ok(Some(_)) => {
            let _ = send_error(&mut socket, "device not activated").await;
            return;
        }
        Ok(None) => {
            let _ = send_error(&mut socket, "unknown device").await;
            return;
        }
        Err(e) => {
            tracing::error!(device_id, error = %e, "device lookup failed");
            let _ = send_error(&mut socket, "internal error").await;
            return;
        }
    }

    // Optional credential check when the device presents one.
    if let (Some(username), Some(password)) = (username.as_deref(), password.as_deref()) {
        match state
            .auth
            .validate_client(&client_id, username, password)
            .await
        {
            Ok((_, true)) => {}
            Ok((_, false)) => {
                let _ = send_error(&mut socket, "invalid credentials").await;
                return;
            }
            Err(e) => {
                let _ = send_error(&mut socket, &format!("auth failed: {e}")).await;
                return;
            }
        }
    }

    let session = match state.sessions.create(&device_id) {
        Ok(session) => session,
        Err(e) => {
            let _ = send_error(&mut socket, &e.to_string()).await;
            return;
        }
    };
    let session_id = session.id.clone();

    let keys = match state.auth.generate_session_keys(&session_id) {
        Ok(keys) => keys,
        Err(e) => {
            tracing::error!(session_id, error = %e, "session key generation failed");
            state.sessions.remove(&session_id);
            let _ = send_error(&mut socket, "internal error").await;
            return;
        }
    };

    // Reserve one instance of each capability for this connection.
    let (vad_guard, asr_guard, llm_guard, tts_guard) = match tokio::try_join!(
        state.providers.vad.acquire(),
        state.providers.asr.acquire(),
        state.providers.llm.acquire(),
        state.providers.tts.acquire(),
    ) {
        Ok(guards) => guards,
        Err(e) => {
            tracing::error!(session_id, error = %e, "provider acquisition failed");
            state.auth.revoke_session_keys(&session_id);
            state.sessions.remove(&session_id);
            let _ = send_error(&mut socket, "service unavailable").await;
            return;
        }
    };

    let (vad, asr, llm, tts) = match (
        vad_guard.as_vad(),
        asr_guard.as_asr(),
        llm_guard.as_llm(),
        tts_guard.as_tts(),
    ) {
        (Some(vad), Some(asr), Some(llm), Some(tts)) => (vad, asr, llm, tts),
        _ => {
            tracing::error!(session_id, "pool returned wrong capability");
            state.auth.revoke_session_keys(&session_id);
            state.sessions.remove(&session_id);
            let _ = send_error(&mut socket, "internal error").await;
            return;
        }
    };

    let settings = state.settings.read().clone();
    let frame_duration_ms = settings.pipeline.frame_duration_ms;

    let hello_reply = ServerMessage::Hello {
        session_id: session_id.clone(),
        sym_key: keys.sym_key,
        nonce: keys.nonce,
        audio_params: AudioParams {
            format: "pcm",
            sample_rate: edgevoice_core::SAMPLE_RATE,
            channels: 1,
            frame_duration_ms,
        },
    };
    if socket
        .send(Message::Text(
            serde_json::to_string(&hello_reply).expect("hello serializes"),
        ))
        .await
        .is_err()
    {
        state.auth.revoke_session_keys(&session_id);
        state.sessions.remove(&session_id);
        return;
    }

    state.bus.publish(Event::ConnectionHello {
        session_id: session_id.clone(),
        device_id: device_id.clone(),
    });
    metrics::record_connection_opened();

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(settings.pipeline.queue_depth);
    let orchestrator = Orchestrator::new(
        &session_id,
        &device_id,
        state.bus.clone(),
        vad,
        asr,
        llm,
        tts,
        Some(state.tools.clone()),
        out_tx,
        OrchestratorConfig {
            queue_depth: settings.pipeline.queue_depth,
            ..Default::default()
        },
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: orchestrator frames onto the wire. Audio is binary, the rest is
    // JSON.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutboundFrame::TtsAudio { audio, .. } => Message::Binary(audio),
                OutboundFrame::AsrResult { text, is_final, .. } => Message::Text(
                    serde_json::to_string(&ServerMessage::AsrResult { text, is_final })
                        .expect("serializes"),
                ),
                OutboundFrame::LlmChunk { text, is_final, .. } => Message::Text(
                    serde_json::to_string(&ServerMessage::LlmChunk { text, is_final })
                        .expect("serializes"),
                ),
                OutboundFrame::SystemError { message } => Message::Text(
                    serde_json::to_string(&ServerMessage::SystemError { message })
                        .expect("serializes"),
                ),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader: device frames into the orchestrator.
    let mut sequence: u64 = 0;
    let close_cause;
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Binary(pcm))) => {
                session.touch();
                let frame = AudioFrame::new(pcm, frame_duration_ms, sequence);
                sequence += 1;
                if let Err(e) = orchestrator.handle_audio(frame).await {
                    tracing::warn!(session_id, error = %e, "audio handling failed");
                    state.bus.publish(Event::SystemError {
                        session_id: Some(session_id.clone()),
                        message: e.to_string(),
                    });
                }
            }
            Some(Ok(Message::Text(text))) => {
                session.touch();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Abort) => {
                        let _ = orchestrator.handle_abort().await;
                    }
                    Ok(ClientMessage::ListenStart) => {
                        let _ = orchestrator.handle_listen_start().await;
                    }
                    Ok(ClientMessage::ListenStop) => {
                        let _ = orchestrator.handle_listen_stop().await;
                    }
                    Ok(ClientMessage::TtsState { state: tts_state }) => {
                        tracing::trace!(session_id, tts_state, "client playback state");
                    }
                    Ok(ClientMessage::Hello { .. }) => {
                        tracing::debug!(session_id, "duplicate hello ignored");
                    }
                    Err(e) => {
                        tracing::debug!(session_id, error = %e, "unparseable control message");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                close_cause = "client closed";
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                state.bus.publish(Event::ConnectionError {
                    session_id: session_id.clone(),
                    message: e.to_string(),
                });
                close_cause = "socket error";
                break;
            }
        }
    }

    // Teardown: conversation first, then bookkeeping.
    orchestrator.close(close_cause).await;
    writer.abort();

    let rounds = orchestrator.turns().len() as u64;
    let tokens = orchestrator.tokens_used();
    for _ in 0..rounds {
        metrics::record_round_completed();
    }
    if tokens > 0 {
        metrics::record_tokens(tokens);
        if let Err(e) = state
            .device_registry
            .record_token_usage(&device_id, tokens)
            .await
        {
            tracing::warn!(device_id, error = %e, "token accounting failed");
        }
    }

    state.bus.publish(Event::ConnectionClosed {
        session_id: session_id.clone(),
    });
    state.auth.revoke_session_keys(&session_id);
    state.sessions.remove(&session_id);

    // Guards drop here, returning the provider instances to their pools.
    drop(vad_guard);
    drop(asr_guard);
    drop(llm_guard);
    drop(tts_guard);

    tracing::info!(session_id, device_id, rounds, tokens, "connection finished");
}

async fn send_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(&ServerMessage::SystemError {
        message: message.to_string(),
    })
    .expect("serializes");
    socket.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        let hello: ClientMessage = serde_json::from_str(
            r#"{"type":"hello","device_id":"dev-A","client_id":"cli-1"}"#,
        )
        .unwrap();
        assert!(matches!(hello, ClientMessage::Hello { .. }));

        let abort: ClientMessage = serde_json::from_str(r#"{"type":"abort"}"#).unwrap();
        assert!(matches!(abort, ClientMessage::Abort));

        let listen: ClientMessage = serde_json::from_str(r#"{"type":"listen_start"}"#).unwrap();
        assert!(matches!(listen, ClientMessage::ListenStart));
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_value(ServerMessage::AsrResult {
            text: "几点了".to_string(),
            is_final: true,
        })
        .unwrap();
        assert_eq!(json["type"], "asr_result");
        assert_eq!(json["is_final"], true);
    }
}
