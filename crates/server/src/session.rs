//! Connection session registry
//!
//! One session per live device websocket. Sessions hold no conversation
//! history; they are liveness bookkeeping plus the handle the vision endpoint
//! uses to attach an image to an ongoing conversation.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::ServerError;

pub struct Session {
    pub id: String,
    pub device_id: String,
    pub created_at: Instant,
    pub last_activity: RwLock<Instant>,
    active: RwLock<bool>,
    /// Most recent validated vision upload, consumed by the next turn
    vision_frame: RwLock<Option<Vec<u8>>>,
}

impl Session {
    fn new(id: String, device_id: String) -> Self {
        Self {
            id,
            device_id,
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            active: RwLock::new(true),
            vision_frame: RwLock::new(None),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    pub fn close(&self) {
        *self.active.write() = false;
    }

    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    pub fn attach_vision_frame(&self, image: Vec<u8>) {
        *self.vision_frame.write() = Some(image);
    }

    pub fn take_vision_frame(&self) -> Option<Vec<u8>> {
        self.vision_frame.write().take()
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    max_sessions: usize,
    session_timeout: Duration,
    cleanup_interval: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            session_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }

    pub fn with_timeouts(
        max_sessions: usize,
        session_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            session_timeout,
            cleanup_interval,
        }
    }

    /// Periodic cleanup of sessions whose sockets stopped talking. Returns
    /// the shutdown handle.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = manager.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_expired();
                        if removed > 0 {
                            tracing::info!(removed, remaining = manager.count(), "session cleanup");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    pub fn create(&self, device_id: &str) -> Result<Arc<Session>, ServerError> {
        if self.sessions.len() >= self.max_sessions {
            self.cleanup_expired();
            if self.sessions.len() >= self.max_sessions {
                return Err(ServerError::Session("max sessions reached".to_string()));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), device_id.to_string()));
        self.sessions.insert(id, session.clone());
        tracing::info!(session_id = %session.id, device_id, "created session");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.close();
            tracing::info!(session_id = %id, "removed session");
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        let timeout = self.session_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let keep = !session.is_expired(timeout);
            if !keep {
                session.close();
            }
            keep
        });
        before.saturating_sub(self.sessions.len())
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_remove() {
        let manager = SessionManager::new(4);
        let session = manager.create("dev-A").unwrap();
        assert!(session.is_active());

        let got = manager.get(&session.id).unwrap();
        assert_eq!(got.device_id, "dev-A");

        manager.remove(&session.id);
        assert!(manager.get(&session.id).is_none());
        assert!(!session.is_active());
    }

    #[test]
    fn capacity_is_enforced() {
        let manager = SessionManager::new(1);
        manager.create("dev-A").unwrap();
        assert!(manager.create("dev-B").is_err());
    }

    #[test]
    fn vision_frame_is_consumed_once() {
        let manager = SessionManager::new(4);
        let session = manager.create("dev-A").unwrap();
        session.attach_vision_frame(vec![1, 2, 3]);
        assert_eq!(session.take_vision_frame(), Some(vec![1, 2, 3]));
        assert_eq!(session.take_vision_frame(), None);
    }

    #[test]
    fn expired_sessions_are_swept() {
        let manager = SessionManager::with_timeouts(
            4,
            Duration::from_millis(0),
            Duration::from_secs(300),
        );
        let session = manager.create("dev-A").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(manager.cleanup_expired(), 1);
        assert!(manager.get(&session.id).is_none());
        assert!(!session.is_active());
    }
}
