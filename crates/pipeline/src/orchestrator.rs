//! Conversation orchestrator
//!
//! One instance per device connection, wiring VAD-gated audio into the
//! recognizer, transcripts into the tool-augmented model, and streamed reply
//! text into synthesis. Owns the per-conversation cancellation tree: a root
//! token for the connection and a child token per turn, reset on every new
//! utterance so barge-in can kill the in-flight reply without touching the
//! connection.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use edgevoice_core::{
    AsrEngine, AsrEvent, AsrStreamHandle, AsrStreamOptions, AudioFrame, ChatRequest, Event,
    EventBus, LlmChunk, LlmEngine, Message, ToolCall, ToolExecutor, TtsEngine, VadEngine,
};
use futures::StreamExt;

use crate::tts::{synthesize_ordered, SentenceSegmenter, TtsText};

/// Conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Listening,
    Recognizing,
    Thinking,
    Calling,
    Speaking,
    Closed,
}

/// Cancellation token with a recorded cause. Cancelling twice keeps the first
/// cause.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(cause);
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn cause(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            return;
        }
        while rx.changed().await.is_ok() {
            if rx.borrow().is_some() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames bound for the device socket. Conversation-scoped frames carry the
/// round so the egress side can enforce the cross-round ordering guarantee.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    AsrResult {
        round: u64,
        text: String,
        is_final: bool,
    },
    LlmChunk {
        round: u64,
        text: String,
        is_final: bool,
    },
    TtsAudio {
        round: u64,
        text_index: u32,
        audio: Vec<u8>,
    },
    SystemError {
        message: String,
    },
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Depth of the bounded queues between stages
    pub queue_depth: usize,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Spoken when the model fails mid-turn
    pub fallback_text: String,
    /// Upper bound on tool round-trips within one turn
    pub max_tool_iterations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            system_prompt: "You are a concise voice assistant. Keep replies short; they are \
                            spoken aloud."
                .to_string(),
            temperature: 0.7,
            max_tokens: 512,
            fallback_text: "抱歉，我这边出了点问题，请再说一次。".to_string(),
            max_tool_iterations: 4,
        }
    }
}

/// One user-utterance / reply / synthesis cycle, held in memory for the
/// lifetime of the conversation.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub session_id: String,
    pub round: u64,
    pub user_text: String,
    pub asr_final: bool,
    pub llm_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tts_segments: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct Orchestrator {
    session_id: String,
    device_id: String,
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    vad: Arc<dyn VadEngine>,
    asr: Arc<dyn AsrEngine>,
    llm: Arc<dyn LlmEngine>,
    tts: Arc<dyn TtsEngine>,
    tools: Option<Arc<dyn ToolExecutor>>,
    out_tx: mpsc::Sender<OutboundFrame>,

    root_cancel: CancelToken,
    turn_cancel: Mutex<CancelToken>,
    state: Mutex<ConversationState>,
    /// Utterance counter; bumps when a new utterance starts recognizing
    round: AtomicU64,
    /// One quiet reconnect per round on recognizer failure
    asr_retry_spent: AtomicBool,
    /// Monotonic recognizer-session id; guards against a stale session's
    /// events touching its successor
    asr_epoch: AtomicU64,
    asr_session: tokio::sync::Mutex<Option<AsrSessionSlot>>,
    history: Mutex<Vec<Message>>,
    turns: Mutex<Vec<ConversationTurn>>,
    tokens_used: AtomicU64,
}

struct AsrSessionSlot {
    epoch: u64,
    handle: Box<dyn AsrStreamHandle>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        bus: Arc<EventBus>,
        vad: Arc<dyn VadEngine>,
        asr: Arc<dyn AsrEngine>,
        llm: Arc<dyn LlmEngine>,
        tts: Arc<dyn TtsEngine>,
        tools: Option<Arc<dyn ToolExecutor>>,
        out_tx: mpsc::Sender<OutboundFrame>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            config,
            bus,
            vad,
            asr,
            llm,
            tts,
            tools,
            out_tx,
            root_cancel: CancelToken::new(),
            turn_cancel: Mutex::new(CancelToken::new()),
            state: Mutex::new(ConversationState::Idle),
            round: AtomicU64::new(0),
            asr_retry_spent: AtomicBool::new(false),
            asr_epoch: AtomicU64::new(0),
            asr_session: tokio::sync::Mutex::new(None),
            history: Mutex::new(Vec::new()),
            turns: Mutex::new(Vec::new()),
            tokens_used: AtomicU64::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConversationState {
        *self.state.lock()
    }

    pub fn round(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.lock().clone()
    }

    fn set_state(&self, next: ConversationState) {
        let mut state = self.state.lock();
        if *state != ConversationState::Closed {
            *state = next;
        }
    }

    /// Feed one uplink audio frame through the state machine.
    pub async fn handle_audio(self: &Arc<Self>, frame: AudioFrame) -> edgevoice_core::Result<()> {
        let state = self.state();
        match state {
            ConversationState::Closed => Ok(()),
            ConversationState::Speaking
            | ConversationState::Thinking
            | ConversationState::Calling => {
                // Only a confirmed new utterance interrupts the reply.
                if self.vad.process_frame(&frame)? {
                    self.barge_in().await?;
                    self.begin_recognizing(frame).await?;
                }
                Ok(())
            }
            ConversationState::Idle => {
                self.set_state(ConversationState::Listening);
                self.gate_frame(frame).await
            }
            ConversationState::Listening => self.gate_frame(frame).await,
            ConversationState::Recognizing => self.forward_audio(frame, false).await,
        }
    }

    /// VAD gate while listening: speech opens the recognizer.
    async fn gate_frame(self: &Arc<Self>, frame: AudioFrame) -> edgevoice_core::Result<()> {
        if self.vad.process_frame(&frame)? {
            self.begin_recognizing(frame).await?;
        }
        Ok(())
    }

    /// A new utterance starts here: bump the round, make sure a recognizer
    /// session is live, and feed it the triggering frame.
    async fn begin_recognizing(self: &Arc<Self>, frame: AudioFrame) -> edgevoice_core::Result<()> {
        self.ensure_asr_open().await?;
        self.round.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConversationState::Recognizing);
        self.bus.publish(Event::AsrStarted {
            session_id: self.session_id.clone(),
            round: self.round(),
        });
        self.forward_audio(frame, false).await
    }

    // Boxed (rather than `async fn`) so its Send-ness is asserted by the
    // signature instead of inferred from the body: `pump_asr_events` calls
    // back into this function via `reopen_asr`, and an anonymous
    // `impl Future` return type here would make that mutual recursion an
    // unresolvable cycle for rustc's auto-trait inference.
    fn ensure_asr_open(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = edgevoice_core::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.asr_session.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let (handle, events) = self
                .asr
                .open_stream(AsrStreamOptions::new(&self.session_id))
                .await?;
            let epoch = self.asr_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *guard = Some(AsrSessionSlot { epoch, handle });
            drop(guard);

            let this = Arc::clone(self);
            tokio::spawn(async move { this.pump_asr_events(events, epoch).await });
            Ok(())
        })
    }

    /// Drop the current recognizer session if it still belongs to `epoch`.
    async fn release_asr_session(&self, epoch: u64, close: bool) {
        let mut guard = self.asr_session.lock().await;
        let owned = guard.as_ref().map(|slot| slot.epoch == epoch).unwrap_or(false);
        if owned {
            if let Some(mut slot) = guard.take() {
                if close {
                    let _ = slot.handle.close().await;
                }
            }
        }
    }

    async fn forward_audio(
        self: &Arc<Self>,
        frame: AudioFrame,
        last: bool,
    ) -> edgevoice_core::Result<()> {
        let mut guard = self.asr_session.lock().await;
        if let Some(slot) = guard.as_mut() {
            slot.handle.send_audio(frame.pcm, last).await?;
        }
        Ok(())
    }

    /// Consume recognizer events until the stream ends. `epoch` ties this
    /// pump to the session it was spawned for.
    async fn pump_asr_events(self: Arc<Self>, mut events: mpsc::Receiver<AsrEvent>, epoch: u64) {
        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = self.root_cancel.cancelled() => break,
            };
            let Some(event) = event else { break };

            match event {
                AsrEvent::Partial { text } => {
                    let round = self.round();
                    self.bus.publish(Event::AsrResult {
                        session_id: self.session_id.clone(),
                        round,
                        text: text.clone(),
                        is_final: false,
                    });
                    let _ = self
                        .out_tx
                        .send(OutboundFrame::AsrResult {
                            round,
                            text,
                            is_final: false,
                        })
                        .await;
                }
                AsrEvent::Final { text } => {
                    let round = self.round();
                    self.bus.publish(Event::AsrResult {
                        session_id: self.session_id.clone(),
                        round,
                        text: text.clone(),
                        is_final: true,
                    });
                    let _ = self
                        .out_tx
                        .send(OutboundFrame::AsrResult {
                            round,
                            text: text.clone(),
                            is_final: true,
                        })
                        .await;

                    let live_epoch = self.asr_epoch.load(Ordering::SeqCst) == epoch;
                    if live_epoch && self.state() == ConversationState::Recognizing {
                        self.set_state(ConversationState::Thinking);
                        let turn_cancel = self.turn_cancel.lock().clone();
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.run_turn(text, round, turn_cancel).await;
                        });
                    } else {
                        tracing::debug!(
                            session_id = %self.session_id,
                            state = ?self.state(),
                            live_epoch,
                            "dropping final transcript"
                        );
                    }
                }
                AsrEvent::Closed => {
                    // Cooperative close (last package or recoverable upstream
                    // timeout). Reconnect quietly, same round.
                    self.bus.publish(Event::AsrStopped {
                        session_id: self.session_id.clone(),
                    });
                    self.release_asr_session(epoch, false).await;
                    let live_epoch = self.asr_epoch.load(Ordering::SeqCst) == epoch;
                    if live_epoch
                        && matches!(
                            self.state(),
                            ConversationState::Recognizing | ConversationState::Listening
                        )
                        && !self.root_cancel.is_cancelled()
                    {
                        if let Err(e) = self.reopen_asr().await {
                            self.report_asr_failure(e.to_string()).await;
                        }
                    }
                    break;
                }
                AsrEvent::Error { message } => {
                    self.bus.publish(Event::AsrError {
                        session_id: self.session_id.clone(),
                        message: message.clone(),
                    });
                    self.release_asr_session(epoch, false).await;
                    if self.asr_epoch.load(Ordering::SeqCst) != epoch {
                        // A newer session took over; nothing to recover.
                        break;
                    }
                    if !self.asr_retry_spent.swap(true, Ordering::SeqCst) {
                        tracing::warn!(
                            session_id = %self.session_id,
                            error = %message,
                            "asr stream failed, reconnecting once"
                        );
                        if let Err(e) = self.reopen_asr().await {
                            self.report_asr_failure(e.to_string()).await;
                        }
                    } else {
                        self.report_asr_failure(message).await;
                    }
                    break;
                }
            }
        }
    }

    async fn reopen_asr(self: &Arc<Self>) -> edgevoice_core::Result<()> {
        self.ensure_asr_open().await
    }

    async fn report_asr_failure(&self, message: String) {
        self.bus.publish(Event::SystemError {
            session_id: Some(self.session_id.clone()),
            message: message.clone(),
        });
        let _ = self.out_tx.send(OutboundFrame::SystemError { message }).await;
        self.set_state(ConversationState::Idle);
    }

    /// One reply turn: model stream (with tool round-trips) into ordered
    /// synthesis.
    async fn run_turn(self: Arc<Self>, user_text: String, round: u64, cancel: CancelToken) {
        let started_at = chrono::Utc::now();
        self.bus.publish(Event::ChatStarted {
            session_id: self.session_id.clone(),
        });
        self.bus.publish(Event::ChatMessage {
            session_id: self.session_id.clone(),
            role: "user".to_string(),
            content: user_text.clone(),
        });
        self.bus.publish(Event::LlmStarted {
            session_id: self.session_id.clone(),
            round,
        });

        // Synthesis chain for this turn.
        let (text_tx, text_rx) = mpsc::channel::<TtsText>(self.config.queue_depth);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(self.config.queue_depth);
        let synth = tokio::spawn(synthesize_ordered(
            Arc::clone(&self.tts),
            self.session_id.clone(),
            round,
            text_rx,
            chunk_tx,
        ));

        // Egress: forward synthesized chunks while this round is current.
        let egress = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let chunk = tokio::select! {
                        c = chunk_rx.recv() => c,
                        _ = cancel.cancelled() => break,
                    };
                    let Some(chunk) = chunk else { break };
                    if this.round() != round {
                        break;
                    }
                    if chunk.audio.is_empty() {
                        continue;
                    }
                    if this
                        .out_tx
                        .send(OutboundFrame::TtsAudio {
                            round,
                            text_index: chunk.text_index,
                            audio: chunk.audio,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let outcome = self
            .drive_llm(&user_text, round, &cancel, &text_tx)
            .await;

        // Closing the text channel lets synthesis finish the queued tail.
        drop(text_tx);
        let synth_result = synth.await;
        let _ = egress.await;

        let mut llm_text = String::new();
        let mut tool_calls = Vec::new();
        let mut tts_segments = Vec::new();
        let mut completed = false;

        match outcome {
            Ok(turn) => {
                llm_text = turn.llm_text;
                tool_calls = turn.tool_calls;
                tts_segments = turn.tts_segments;
                completed = !cancel.is_cancelled();
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, round, error = %e, "llm turn failed");
            }
        }

        match synth_result {
            Ok(Ok(())) => {
                if completed {
                    self.bus.publish(Event::TtsCompleted {
                        session_id: self.session_id.clone(),
                        round,
                    });
                }
            }
            Ok(Err(e)) => {
                // Synthesis failure aborts the round; the conversation stays
                // usable.
                tracing::error!(session_id = %self.session_id, round, error = %e, "tts failed");
                self.bus.publish(Event::TtsError {
                    session_id: self.session_id.clone(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, round, error = %e, "tts task panicked");
            }
        }

        if completed {
            self.bus.publish(Event::LlmCompleted {
                session_id: self.session_id.clone(),
                round,
            });
            self.bus.publish(Event::ChatCompleted {
                session_id: self.session_id.clone(),
            });

            let mut history = self.history.lock();
            history.push(Message::user(&user_text));
            if !llm_text.is_empty() {
                history.push(Message::assistant(&llm_text));
            }
        }

        self.turns.lock().push(ConversationTurn {
            session_id: self.session_id.clone(),
            round,
            user_text,
            asr_final: true,
            llm_text,
            tool_calls,
            tts_segments,
            started_at,
            ended_at: Some(chrono::Utc::now()),
        });

        // Back to idle unless a newer round took over.
        if self.round() == round {
            self.set_state(ConversationState::Idle);
        }
    }

    async fn drive_llm(
        self: &Arc<Self>,
        user_text: &str,
        round: u64,
        cancel: &CancelToken,
        text_tx: &mpsc::Sender<TtsText>,
    ) -> edgevoice_core::Result<TurnOutcome> {
        let mut messages = vec![Message::system(&self.config.system_prompt)];
        messages.extend(self.history.lock().iter().cloned());
        messages.push(Message::user(user_text));

        let tool_defs = self
            .tools
            .as_ref()
            .map(|t| t.definitions())
            .unwrap_or_default();

        let mut outcome = TurnOutcome::default();
        let mut segmenter = SentenceSegmenter::default();
        let mut text_index = 0u32;
        let mut llm_failed = false;

        'turn: for iteration in 0..self.config.max_tool_iterations {
            let request = ChatRequest {
                session_id: self.session_id.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };

            let mut stream = self.llm.chat_stream(request);
            let mut final_chunk = None;

            loop {
                let next = tokio::select! {
                    n = stream.next() => n,
                    _ = cancel.cancelled() => {
                        tracing::debug!(session_id = %self.session_id, round, "llm turn cancelled");
                        return Ok(outcome);
                    }
                };
                let Some(next) = next else { break };

                match next {
                    Ok(LlmChunk::TextDelta(delta)) => {
                        let _ = self
                            .out_tx
                            .send(OutboundFrame::LlmChunk {
                                round,
                                text: delta.clone(),
                                is_final: false,
                            })
                            .await;
                        for segment in segmenter.push(&delta) {
                            self.enqueue_segment(segment, &mut text_index, round, text_tx, &mut outcome)
                                .await;
                        }
                    }
                    Ok(LlmChunk::ToolCall(_)) => {
                        // Accumulated again on the final chunk; nothing to do
                        // until the model finishes the request list.
                    }
                    Ok(chunk @ LlmChunk::Final { .. }) => {
                        final_chunk = Some(chunk);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.session_id, round, error = %e, "llm stream error");
                        self.bus.publish(Event::LlmError {
                            session_id: self.session_id.clone(),
                            message: e.to_string(),
                        });
                        llm_failed = true;
                        break 'turn;
                    }
                }
            }

            let Some(LlmChunk::Final {
                full_text,
                tool_calls,
                usage,
                ..
            }) = final_chunk
            else {
                llm_failed = true;
                break 'turn;
            };

            self.tokens_used.fetch_add(usage.total(), Ordering::Relaxed);

            if tool_calls.is_empty() {
                outcome.llm_text.push_str(&full_text);
                self.bus.publish(Event::LlmResponse {
                    session_id: self.session_id.clone(),
                    round,
                    text: full_text,
                    is_final: true,
                    tool_calls: Vec::new(),
                });
                let _ = self
                    .out_tx
                    .send(OutboundFrame::LlmChunk {
                        round,
                        text: String::new(),
                        is_final: true,
                    })
                    .await;
                if let Some(rest) = segmenter.flush() {
                    self.enqueue_segment(rest, &mut text_index, round, text_tx, &mut outcome)
                        .await;
                }
                self.set_state(ConversationState::Speaking);
                return Ok(outcome);
            }

            // Tool round-trip.
            self.bus.publish(Event::LlmResponse {
                session_id: self.session_id.clone(),
                round,
                text: String::new(),
                is_final: false,
                tool_calls: tool_calls.clone(),
            });
            let Some(executor) = self.tools.as_ref() else {
                tracing::warn!(
                    session_id = %self.session_id,
                    "model requested tools but no executor is wired"
                );
                llm_failed = true;
                break 'turn;
            };

            self.set_state(ConversationState::Calling);
            messages.push(Message::assistant_tool_calls(tool_calls.clone()));
            for call in &tool_calls {
                outcome.tool_calls.push(call.clone());
                let result = match executor.execute(&call.name, &call.arguments).await {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            tool = %call.name,
                            error = %e,
                            "tool execution failed"
                        );
                        format!("tool error: {e}")
                    }
                };
                messages.push(Message::tool_result(&call.id, result));
            }
            self.set_state(ConversationState::Thinking);

            if iteration + 1 == self.config.max_tool_iterations {
                tracing::warn!(session_id = %self.session_id, "tool iteration budget exhausted");
                llm_failed = true;
            }
        }

        if llm_failed && !cancel.is_cancelled() {
            // Speak the fallback so the device is not left waiting.
            let fallback = self.config.fallback_text.clone();
            outcome.llm_text = fallback.clone();
            self.bus.publish(Event::LlmResponse {
                session_id: self.session_id.clone(),
                round,
                text: fallback.clone(),
                is_final: true,
                tool_calls: Vec::new(),
            });
            self.enqueue_segment(fallback, &mut text_index, round, text_tx, &mut outcome)
                .await;
            self.set_state(ConversationState::Speaking);
        }
        Ok(outcome)
    }

    async fn enqueue_segment(
        &self,
        segment: String,
        text_index: &mut u32,
        round: u64,
        text_tx: &mpsc::Sender<TtsText>,
        outcome: &mut TurnOutcome,
    ) {
        self.bus.publish(Event::TtsSpeak {
            session_id: self.session_id.clone(),
            round,
            text: segment.clone(),
            text_index: *text_index,
        });
        outcome.tts_segments.push(segment.clone());
        let _ = text_tx
            .send(TtsText {
                text: segment,
                text_index: *text_index,
            })
            .await;
        *text_index += 1;
    }

    /// User interrupted the reply: kill the turn, discard queued synthesis,
    /// and come back up listening on a fresh recognizer session. The round
    /// advances when the new utterance starts recognizing.
    async fn barge_in(self: &Arc<Self>) -> edgevoice_core::Result<()> {
        tracing::info!(session_id = %self.session_id, round = self.round(), "barge-in");

        // Cancel the turn context; queued ttsIn/llmOut drain through the
        // cancelled egress task.
        self.turn_cancel.lock().cancel("barge-in");
        *self.turn_cancel.lock() = CancelToken::new();

        if let Some(mut slot) = self.asr_session.lock().await.take() {
            let _ = slot.handle.close().await;
        }

        self.asr_retry_spent.store(false, Ordering::SeqCst);
        self.vad.reset();
        self.set_state(ConversationState::Listening);

        // Fresh recognizer session for the new utterance.
        self.ensure_asr_open().await
    }

    /// Device-initiated abort of the current reply.
    pub async fn handle_abort(self: &Arc<Self>) -> edgevoice_core::Result<()> {
        self.turn_cancel.lock().cancel("client abort");
        *self.turn_cancel.lock() = CancelToken::new();
        self.asr_retry_spent.store(false, Ordering::SeqCst);
        self.set_state(ConversationState::Idle);
        Ok(())
    }

    /// Explicit listen window control from the device.
    pub async fn handle_listen_start(self: &Arc<Self>) -> edgevoice_core::Result<()> {
        if self.state() == ConversationState::Idle {
            self.set_state(ConversationState::Listening);
        }
        Ok(())
    }

    pub async fn handle_listen_stop(self: &Arc<Self>) -> edgevoice_core::Result<()> {
        let mut guard = self.asr_session.lock().await;
        if let Some(slot) = guard.as_mut() {
            slot.handle.send_audio(Vec::new(), true).await?;
        }
        Ok(())
    }

    /// Tear the conversation down. Idempotent.
    pub async fn close(self: &Arc<Self>, cause: &str) {
        if self.state() == ConversationState::Closed {
            return;
        }
        self.root_cancel.cancel(cause);
        self.turn_cancel.lock().cancel(cause);
        if let Some(mut slot) = self.asr_session.lock().await.take() {
            let _ = slot.handle.close().await;
        }
        *self.state.lock() = ConversationState::Closed;
        tracing::info!(session_id = %self.session_id, cause, "conversation closed");
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[derive(Default)]
struct TurnOutcome {
    llm_text: String,
    tool_calls: Vec<ToolCall>,
    tts_segments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::SilenceTts;
    use crate::vad::{EnergyVad, VadConfig};
    use async_trait::async_trait;
    use edgevoice_core::{
        AsrStreamOptions, LlmChunk, Provider, ProviderKind, TokenUsage, ToolDefinition, Topic,
    };
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Recognizer stub: audio is discarded, events are injected by the test.
    struct ScriptedAsr {
        event_tx: Mutex<Option<mpsc::Sender<AsrEvent>>>,
        opened: AtomicU64,
    }

    impl ScriptedAsr {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                event_tx: Mutex::new(None),
                opened: AtomicU64::new(0),
            })
        }

        fn injector(&self) -> mpsc::Sender<AsrEvent> {
            self.event_tx.lock().clone().expect("stream not open")
        }

        fn opened(&self) -> u64 {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedAsr {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Asr
        }
    }

    struct NoopHandle;

    #[async_trait]
    impl AsrStreamHandle for NoopHandle {
        async fn send_audio(&mut self, _pcm: Vec<u8>, _last: bool) -> edgevoice_core::Result<()> {
            Ok(())
        }
        async fn reset(&mut self) -> edgevoice_core::Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> edgevoice_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl AsrEngine for ScriptedAsr {
        async fn open_stream(
            &self,
            _opts: AsrStreamOptions,
        ) -> edgevoice_core::Result<(Box<dyn AsrStreamHandle>, mpsc::Receiver<AsrEvent>)> {
            let (tx, rx) = mpsc::channel(32);
            *self.event_tx.lock() = Some(tx);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok((Box::new(NoopHandle), rx))
        }
    }

    /// Model stub replaying one scripted chunk list per invocation.
    struct ScriptedLlm {
        scripts: Mutex<VecDeque<Vec<LlmChunk>>>,
        delay: Duration,
    }

    impl ScriptedLlm {
        fn new(scripts: Vec<Vec<LlmChunk>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                delay: Duration::from_millis(1),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedLlm {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Llm
        }
    }

    impl LlmEngine for ScriptedLlm {
        fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> BoxStream<'static, edgevoice_core::Result<LlmChunk>> {
            let chunks = self.scripts.lock().pop_front().unwrap_or_default();
            let delay = self.delay;
            Box::pin(async_stream::stream! {
                for chunk in chunks {
                    tokio::time::sleep(delay).await;
                    yield Ok(chunk);
                }
            })
        }
    }

    struct ClockExecutor;

    #[async_trait]
    impl ToolExecutor for ClockExecutor {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "time".to_string(),
                description: "current time".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }]
        }

        async fn execute(&self, name: &str, _args: &str) -> edgevoice_core::Result<String> {
            assert_eq!(name, "time");
            Ok("14:30".to_string())
        }
    }

    fn loud_frame(seq: u64) -> AudioFrame {
        let pcm: Vec<u8> = std::iter::repeat(8000i16.to_le_bytes())
            .take(320)
            .flatten()
            .collect();
        AudioFrame::new(pcm, 20, seq)
    }

    fn final_chunk(text: &str, tool_calls: Vec<ToolCall>) -> LlmChunk {
        LlmChunk::Final {
            full_text: text.to_string(),
            tool_calls,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            spent_ms: 1,
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        asr: Arc<ScriptedAsr>,
        out_rx: mpsc::Receiver<OutboundFrame>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn fixture(llm_scripts: Vec<Vec<LlmChunk>>, tts_ms_per_char: u32) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe_session(
            &[
                Topic::AsrStarted,
                Topic::AsrResult,
                Topic::LlmStarted,
                Topic::LlmResponse,
                Topic::TtsSpeak,
                Topic::TtsCompleted,
                Topic::LlmCompleted,
            ],
            "sess-1",
        );
        let asr = ScriptedAsr::new();
        let llm = ScriptedLlm::new(llm_scripts);
        let vad = Arc::new(EnergyVad::new(VadConfig {
            sensitivity: 0.02,
            frame_duration_ms: 20,
            min_speech_ms: 60,
            max_silence_ms: 200,
        }));
        let (out_tx, out_rx) = mpsc::channel(64);

        let orchestrator = Orchestrator::new(
            "sess-1",
            "dev-A",
            bus,
            vad,
            asr.clone(),
            llm,
            Arc::new(SilenceTts {
                ms_per_char: tts_ms_per_char,
            }),
            Some(Arc::new(ClockExecutor)),
            out_tx,
            OrchestratorConfig::default(),
        );

        Fixture {
            orchestrator,
            asr,
            out_rx,
            events,
        }
    }

    async fn speak_until_recognizing(fx: &Fixture) {
        for i in 0..20 {
            fx.orchestrator.handle_audio(loud_frame(i)).await.unwrap();
            if fx.orchestrator.state() == ConversationState::Recognizing {
                return;
            }
        }
        panic!("never reached recognizing");
    }

    async fn wait_for_idle(orchestrator: &Arc<Orchestrator>) {
        for _ in 0..500 {
            if orchestrator.state() == ConversationState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("turn never completed, state = {:?}", orchestrator.state());
    }

    #[tokio::test]
    async fn full_round_with_tool_call_emits_events_in_order() {
        let mut fx = fixture(
            vec![
                vec![final_chunk(
                    "",
                    vec![ToolCall {
                        id: "call_1".into(),
                        name: "time".into(),
                        arguments: "{}".into(),
                    }],
                )],
                vec![
                    LlmChunk::TextDelta("现在是下午两点半".into()),
                    final_chunk("现在是下午两点半", Vec::new()),
                ],
            ],
            5,
        );

        speak_until_recognizing(&fx).await;
        fx.asr
            .injector()
            .send(AsrEvent::Final {
                text: "几点了".into(),
            })
            .await
            .unwrap();

        wait_for_idle(&fx.orchestrator).await;

        let mut labels = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            labels.push(match event {
                Event::AsrStarted { .. } => "asr:started",
                Event::AsrResult { is_final: true, .. } => "asr:result(final)",
                Event::AsrResult { .. } => "asr:result",
                Event::LlmStarted { .. } => "llm:started",
                Event::LlmResponse {
                    is_final: false, ..
                } => "llm:response(tool_calls)",
                Event::LlmResponse { is_final: true, .. } => "llm:response(final)",
                Event::TtsSpeak { .. } => "tts:speak",
                Event::TtsCompleted { .. } => "tts:completed",
                Event::LlmCompleted { .. } => "llm:completed",
                _ => "other",
            });
        }
        assert_eq!(
            labels,
            vec![
                "asr:started",
                "asr:result(final)",
                "llm:started",
                "llm:response(tool_calls)",
                "llm:response(final)",
                "tts:speak",
                "tts:completed",
                "llm:completed",
            ]
        );

        // Tool call recorded on the turn, tokens accounted for both passes.
        let turns = fx.orchestrator.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].tool_calls.len(), 1);
        assert_eq!(turns[0].llm_text, "现在是下午两点半");
        assert_eq!(fx.orchestrator.tokens_used(), 30);

        // Device saw the final transcript and some audio.
        let mut saw_final_asr = false;
        let mut saw_audio = false;
        while let Ok(frame) = fx.out_rx.try_recv() {
            match frame {
                OutboundFrame::AsrResult { is_final: true, .. } => saw_final_asr = true,
                OutboundFrame::TtsAudio { round: 1, .. } => saw_audio = true,
                _ => {}
            }
        }
        assert!(saw_final_asr);
        assert!(saw_audio);
    }

    #[tokio::test]
    async fn barge_in_advances_round_and_stops_old_audio() {
        let mut fx = fixture(
            vec![
                vec![
                    LlmChunk::TextDelta("这是一段很长很长的回答。".into()),
                    final_chunk("这是一段很长很长的回答。", Vec::new()),
                ],
                vec![
                    LlmChunk::TextDelta("好的。".into()),
                    final_chunk("好的。", Vec::new()),
                ],
            ],
            // Slow synthesis keeps round 1 speaking long enough to interrupt.
            200,
        );

        speak_until_recognizing(&fx).await;
        fx.asr
            .injector()
            .send(AsrEvent::Final {
                text: "讲个故事".into(),
            })
            .await
            .unwrap();

        // Wait until round 1 is speaking.
        for _ in 0..200 {
            if fx.orchestrator.state() == ConversationState::Speaking {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.orchestrator.state(), ConversationState::Speaking);
        assert_eq!(fx.orchestrator.round(), 1);

        // New speech triggers barge-in.
        for i in 100..130 {
            fx.orchestrator.handle_audio(loud_frame(i)).await.unwrap();
            if fx.orchestrator.round() == 2 {
                break;
            }
        }
        assert_eq!(fx.orchestrator.round(), 2);
        assert_eq!(fx.asr.opened(), 2, "barge-in reopens a fresh asr session");

        let round_at_barge_in = 2u64;
        // Drain a beat to let any in-flight sends land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(frame) = fx.out_rx.try_recv() {
            if let OutboundFrame::TtsAudio { round, .. } = frame {
                assert!(
                    round < round_at_barge_in,
                    "pre-barge-in audio only at this point"
                );
            }
        }

        // Round 2 runs to completion.
        fx.asr
            .injector()
            .send(AsrEvent::Final {
                text: "换个话题".into(),
            })
            .await
            .unwrap();
        wait_for_idle(&fx.orchestrator).await;

        // After round 2 audio appears, no round 1 audio may follow.
        let mut seen_round2 = false;
        while let Ok(frame) = fx.out_rx.try_recv() {
            if let OutboundFrame::TtsAudio { round, .. } = frame {
                if round == 2 {
                    seen_round2 = true;
                }
                assert!(!(seen_round2 && round == 1), "round 1 audio after round 2");
            }
        }
        assert!(seen_round2);
    }

    #[tokio::test]
    async fn llm_error_speaks_fallback() {
        // Empty script: the stream ends without a final chunk.
        let mut fx = fixture(vec![vec![]], 5);

        speak_until_recognizing(&fx).await;
        fx.asr
            .injector()
            .send(AsrEvent::Final { text: "你好".into() })
            .await
            .unwrap();
        wait_for_idle(&fx.orchestrator).await;

        let turns = fx.orchestrator.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(
            turns[0].llm_text,
            OrchestratorConfig::default().fallback_text
        );

        // Fallback audio reached the device.
        let mut saw_audio = false;
        while let Ok(frame) = fx.out_rx.try_recv() {
            if matches!(frame, OutboundFrame::TtsAudio { .. }) {
                saw_audio = true;
            }
        }
        assert!(saw_audio);
    }

    #[tokio::test]
    async fn silence_timeout_is_a_normal_turn() {
        let fx = fixture(
            vec![vec![
                LlmChunk::TextDelta("还在吗？".into()),
                final_chunk("还在吗？", Vec::new()),
            ]],
            5,
        );

        speak_until_recognizing(&fx).await;
        fx.asr
            .injector()
            .send(AsrEvent::Final {
                text: crate::asr::SILENCE_TIMEOUT_TEXT.into(),
            })
            .await
            .unwrap();
        wait_for_idle(&fx.orchestrator).await;

        let turns = fx.orchestrator.turns();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].user_text.starts_with("[SILENCE_TIMEOUT]"));
        assert_eq!(turns[0].llm_text, "还在吗？");
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let fx = fixture(vec![], 5);
        fx.orchestrator.close("test over").await;
        assert_eq!(fx.orchestrator.state(), ConversationState::Closed);

        fx.orchestrator.handle_audio(loud_frame(0)).await.unwrap();
        assert_eq!(fx.orchestrator.state(), ConversationState::Closed);
    }

    #[tokio::test]
    async fn cancel_token_records_first_cause() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.cause().as_deref(), Some("first"));
        token.cancelled().await;
    }
}
