//! In-process typed event bus
//!
//! Decouples the ASR/LLM/TTS drivers from the conversation orchestrator.
//! Publish is synchronous: subscribers run on the publisher's call stack in
//! registration order. Nothing is persisted or replayed.
//!
//! The subscriber map is copy-on-write — publish takes a read lock, clones the
//! `Arc`, and iterates without holding the lock, so subscribers may themselves
//! publish or subscribe.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::ToolCall;

/// Topic names, one per event variant family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    AsrStarted,
    AsrResult,
    AsrStopped,
    AsrError,
    LlmStarted,
    LlmResponse,
    LlmCompleted,
    LlmError,
    TtsSpeak,
    TtsCompleted,
    TtsError,
    ChatMessage,
    ChatStarted,
    ChatCompleted,
    ConnectionHello,
    ConnectionClosed,
    ConnectionError,
    SystemInfo,
    SystemError,
}

/// Bus event payloads. Every conversation-scoped event carries the session id
/// so subscribers can filter without a back-pointer to the orchestrator.
#[derive(Debug, Clone)]
pub enum Event {
    AsrStarted {
        session_id: String,
        round: u64,
    },
    AsrResult {
        session_id: String,
        round: u64,
        text: String,
        is_final: bool,
    },
    AsrStopped {
        session_id: String,
    },
    AsrError {
        session_id: String,
        message: String,
    },
    LlmStarted {
        session_id: String,
        round: u64,
    },
    LlmResponse {
        session_id: String,
        round: u64,
        text: String,
        is_final: bool,
        tool_calls: Vec<ToolCall>,
    },
    LlmCompleted {
        session_id: String,
        round: u64,
    },
    LlmError {
        session_id: String,
        message: String,
    },
    TtsSpeak {
        session_id: String,
        round: u64,
        text: String,
        text_index: u32,
    },
    TtsCompleted {
        session_id: String,
        round: u64,
    },
    TtsError {
        session_id: String,
        message: String,
    },
    ChatMessage {
        session_id: String,
        role: String,
        content: String,
    },
    ChatStarted {
        session_id: String,
    },
    ChatCompleted {
        session_id: String,
    },
    ConnectionHello {
        session_id: String,
        device_id: String,
    },
    ConnectionClosed {
        session_id: String,
    },
    ConnectionError {
        session_id: String,
        message: String,
    },
    SystemInfo {
        message: String,
    },
    SystemError {
        session_id: Option<String>,
        message: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::AsrStarted { .. } => Topic::AsrStarted,
            Event::AsrResult { .. } => Topic::AsrResult,
            Event::AsrStopped { .. } => Topic::AsrStopped,
            Event::AsrError { .. } => Topic::AsrError,
            Event::LlmStarted { .. } => Topic::LlmStarted,
            Event::LlmResponse { .. } => Topic::LlmResponse,
            Event::LlmCompleted { .. } => Topic::LlmCompleted,
            Event::LlmError { .. } => Topic::LlmError,
            Event::TtsSpeak { .. } => Topic::TtsSpeak,
            Event::TtsCompleted { .. } => Topic::TtsCompleted,
            Event::TtsError { .. } => Topic::TtsError,
            Event::ChatMessage { .. } => Topic::ChatMessage,
            Event::ChatStarted { .. } => Topic::ChatStarted,
            Event::ChatCompleted { .. } => Topic::ChatCompleted,
            Event::ConnectionHello { .. } => Topic::ConnectionHello,
            Event::ConnectionClosed { .. } => Topic::ConnectionClosed,
            Event::ConnectionError { .. } => Topic::ConnectionError,
            Event::SystemInfo { .. } => Topic::SystemInfo,
            Event::SystemError { .. } => Topic::SystemError,
        }
    }

    /// Session id for conversation-scoped events, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::AsrStarted { session_id, .. }
            | Event::AsrResult { session_id, .. }
            | Event::AsrStopped { session_id }
            | Event::AsrError { session_id, .. }
            | Event::LlmStarted { session_id, .. }
            | Event::LlmResponse { session_id, .. }
            | Event::LlmCompleted { session_id, .. }
            | Event::LlmError { session_id, .. }
            | Event::TtsSpeak { session_id, .. }
            | Event::TtsCompleted { session_id, .. }
            | Event::TtsError { session_id, .. }
            | Event::ChatMessage { session_id, .. }
            | Event::ChatStarted { session_id }
            | Event::ChatCompleted { session_id }
            | Event::ConnectionHello { session_id, .. }
            | Event::ConnectionClosed { session_id }
            | Event::ConnectionError { session_id, .. } => Some(session_id.as_str()),
            Event::SystemError { session_id, .. } => session_id.as_deref(),
            Event::SystemInfo { .. } => None,
        }
    }
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;
type SubscriberMap = HashMap<Topic, Vec<Subscriber>>;

/// Process-wide typed pub/sub.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Arc<SubscriberMap>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a single topic. Delivery order per topic is
    /// the registration order; there is no unsubscribe — subscribers live as
    /// long as the bus.
    pub fn subscribe<F>(&self, topic: Topic, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_arc(topic, Arc::new(f));
    }

    /// Register one subscriber for several topics at once.
    pub fn subscribe_many<F>(&self, topics: &[Topic], f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let f: Subscriber = Arc::new(f);
        for topic in topics {
            self.subscribe_arc(*topic, f.clone());
        }
    }

    fn subscribe_arc(&self, topic: Topic, f: Subscriber) {
        let mut guard = self.subscribers.write();
        let mut map = (**guard).clone();
        map.entry(topic).or_default().push(f);
        *guard = Arc::new(map);
    }

    /// Forward matching events into a tokio channel, filtered by session id.
    /// Used by the orchestrator to consume driver events without holding a
    /// reference to the drivers.
    pub fn subscribe_session(
        &self,
        topics: &[Topic],
        session_id: impl Into<String>,
    ) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let session_id = session_id.into();
        self.subscribe_many(topics, move |event| {
            if event.session_id() == Some(session_id.as_str()) {
                let _ = tx.send(event.clone());
            }
        });
        rx
    }

    /// Publish an event to its topic. Synchronous; subscriber panics are not
    /// caught.
    pub fn publish(&self, event: Event) {
        let map = self.subscribers.read().clone();
        if let Some(subs) = map.get(&event.topic()) {
            for sub in subs {
                sub(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(Topic::SystemInfo, move |e| {
            if let Event::SystemInfo { message } = e {
                seen2.lock().push(message.clone());
            }
        });

        for i in 0..5 {
            bus.publish(Event::SystemInfo {
                message: format!("m{i}"),
            });
        }
        assert_eq!(*seen.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn topic_isolation() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0usize));
        let count2 = count.clone();
        bus.subscribe(Topic::AsrResult, move |_| *count2.lock() += 1);

        bus.publish(Event::SystemInfo {
            message: "ignored".into(),
        });
        bus.publish(Event::AsrResult {
            session_id: "s".into(),
            round: 1,
            text: "hi".into(),
            is_final: true,
        });
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn session_filter_drops_other_sessions() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_session(&[Topic::AsrResult], "mine");

        bus.publish(Event::AsrResult {
            session_id: "other".into(),
            round: 1,
            text: "x".into(),
            is_final: true,
        });
        bus.publish(Event::AsrResult {
            session_id: "mine".into(),
            round: 1,
            text: "y".into(),
            is_final: true,
        });

        let got = rx.recv().await.unwrap();
        match got {
            Event::AsrResult { text, .. } => assert_eq!(text, "y"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribing_from_subscriber_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();
        bus.subscribe(Topic::SystemInfo, move |_| {
            bus2.subscribe(Topic::SystemError, |_| {});
        });
        bus.publish(Event::SystemInfo {
            message: "go".into(),
        });
    }
}
