//! In-memory auth store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::{AuthError, ClientCredential, StoreStats};

use super::AuthStore;

/// Map-backed store. Expired entries linger until the GC ticker or an explicit
/// `cleanup_expired` removes them; reads skip them.
#[derive(Default)]
pub struct MemoryAuthStore {
    entries: RwLock<HashMap<String, ClientCredential>>,
    gc_shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the background GC ticker. Idempotent per store; the previous
    /// ticker is stopped if called twice.
    pub fn start_gc(self: &Arc<Self>, interval: Duration) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.cleanup_now();
                        if removed > 0 {
                            tracing::debug!(removed, "auth store gc removed expired credentials");
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

        if let Some(previous) = self.gc_shutdown.lock().replace(shutdown_tx) {
            let _ = previous.send(true);
        }
    }

    fn cleanup_now(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cred| !cred.is_expired());
        before - entries.len()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn store(&self, info: ClientCredential) -> Result<(), AuthError> {
        self.entries.write().insert(info.client_id.clone(), info);
        Ok(())
    }

    async fn validate(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(Option<ClientCredential>, bool), AuthError> {
        let entries = self.entries.read();
        let Some(cred) = entries.get(client_id) else {
            return Ok((None, false));
        };
        if cred.is_expired() {
            return Err(AuthError::Expired(client_id.to_string()));
        }
        if cred.matches(username, password) {
            Ok((Some(cred.clone()), true))
        } else {
            Ok((None, false))
        }
    }

    async fn get(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        let entries = self.entries.read();
        match entries.get(client_id) {
            None => Ok(None),
            Some(cred) if cred.is_expired() => Err(AuthError::Expired(client_id.to_string())),
            Some(cred) => Ok(Some(cred.clone())),
        }
    }

    async fn remove(&self, client_id: &str) -> Result<(), AuthError> {
        self.entries.write().remove(client_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientCredential>, AuthError> {
        let entries = self.entries.read();
        Ok(entries
            .values()
            .filter(|c| !c.is_expired())
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        Ok(self.cleanup_now())
    }

    async fn stats(&self) -> Result<StoreStats, AuthError> {
        let entries = self.entries.read();
        let total = entries.len();
        let expired = entries.values().filter(|c| c.is_expired()).count();
        Ok(StoreStats {
            driver: "memory".to_string(),
            total,
            active: total - expired,
            expired,
        })
    }

    async fn close(&self) -> Result<(), AuthError> {
        if let Some(shutdown) = self.gc_shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn expired_cred(id: &str) -> ClientCredential {
        let mut cred = ClientCredential::new(id, "user", "pass");
        cred.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        cred
    }

    #[tokio::test]
    async fn validate_matches_and_rejects() {
        let store = MemoryAuthStore::new();
        store
            .store(ClientCredential::new("c1", "user", "pass"))
            .await
            .unwrap();

        let (cred, ok) = store.validate("c1", "user", "pass").await.unwrap();
        assert!(ok);
        assert_eq!(cred.unwrap().client_id, "c1");

        let (cred, ok) = store.validate("c1", "user", "wrong").await.unwrap();
        assert!(!ok);
        assert!(cred.is_none());

        let (cred, ok) = store.validate("nope", "user", "pass").await.unwrap();
        assert!(!ok);
        assert!(cred.is_none());
    }

    #[tokio::test]
    async fn expired_hit_is_an_error() {
        let store = MemoryAuthStore::new();
        store.store(expired_cred("c1")).await.unwrap();

        assert!(matches!(
            store.validate("c1", "user", "pass").await,
            Err(AuthError::Expired(_))
        ));
        assert!(matches!(store.get("c1").await, Err(AuthError::Expired(_))));
    }

    #[tokio::test]
    async fn list_skips_expired_without_deleting() {
        let store = MemoryAuthStore::new();
        store
            .store(ClientCredential::new("live", "u", "p"))
            .await
            .unwrap();
        store.store(expired_cred("dead")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].client_id, "live");

        // Entry still present until cleanup.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.expired, 1);

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn store_replaces_existing() {
        let store = MemoryAuthStore::new();
        store
            .store(ClientCredential::new("c1", "user", "old"))
            .await
            .unwrap();
        store
            .store(ClientCredential::new("c1", "user", "new"))
            .await
            .unwrap();

        let (_, ok) = store.validate("c1", "user", "new").await.unwrap();
        assert!(ok);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }
}
