//! Auth manager (C3)
//!
//! Composes the credential store and the session key manager, enforces TTLs
//! on registration, and drives one background cleanup loop over both.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use edgevoice_config::AuthConfig;

use crate::store::AuthStore;
use crate::{AuthError, ClientCredential, SessionKeyManager, SessionKeyStats, SessionKeys, StoreStats};

/// Cleanup never ticks faster than this.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AuthManagerConfig {
    /// Credential lifetime; zero disables expiry
    pub session_ttl: Duration,
    /// Requested cleanup cadence, floored to 30 s
    pub cleanup_interval: Duration,
    pub key_ttl_secs: u64,
}

impl From<&AuthConfig> for AuthManagerConfig {
    fn from(cfg: &AuthConfig) -> Self {
        Self {
            session_ttl: Duration::from_secs(cfg.session_ttl_secs),
            cleanup_interval: Duration::from_secs(cfg.cleanup_interval_secs),
            key_ttl_secs: cfg.key_ttl_secs,
        }
    }
}

pub struct AuthManager {
    store: Arc<dyn AuthStore>,
    session_keys: SessionKeyManager,
    config: AuthManagerConfig,
    cleanup_shutdown: parking_lot::Mutex<Option<watch::Sender<bool>>>,
    closed: AtomicBool,
}

impl AuthManager {
    pub fn new(store: Arc<dyn AuthStore>, config: AuthManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            session_keys: SessionKeyManager::new(config.key_ttl_secs),
            store,
            config,
            cleanup_shutdown: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        manager.start_cleanup();
        manager
    }

    fn start_cleanup(self: &Arc<Self>) {
        let interval = self.config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.cleanup_shutdown.lock() = Some(shutdown_tx);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let keys_removed = manager.session_keys.cleanup_expired();
                        match manager.store.cleanup_expired().await {
                            Ok(creds_removed) => {
                                if keys_removed > 0 || creds_removed > 0 {
                                    tracing::info!(
                                        credentials = creds_removed,
                                        session_keys = keys_removed,
                                        "auth cleanup pass"
                                    );
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "auth store cleanup failed"),
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
    }

    /// Register (or replace) a client credential. Timestamps are stamped
    /// here: `created_at = now`, `expires_at = now + ttl` when a TTL is
    /// configured.
    pub async fn register_client(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
        ip: Option<String>,
        device_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ClientCredential, AuthError> {
        if client_id.is_empty() {
            return Err(AuthError::InvalidArgument(
                "client id must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let mut cred = ClientCredential::new(client_id, username, password);
        cred.ip = ip;
        cred.device_id = device_id;
        cred.metadata = metadata;
        cred.created_at = now;
        if !self.config.session_ttl.is_zero() {
            cred.expires_at =
                Some(now + ChronoDuration::from_std(self.config.session_ttl).unwrap_or_default());
        }

        self.store.store(cred.clone()).await?;
        tracing::debug!(client_id, "registered client credential");
        Ok(cred)
    }

    /// Validation mismatches are a boolean, never an error.
    pub async fn validate_client(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(Option<ClientCredential>, bool), AuthError> {
        self.store.validate(client_id, username, password).await
    }

    pub async fn get_client(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        self.store.get(client_id).await
    }

    pub async fn remove_client(&self, client_id: &str) -> Result<(), AuthError> {
        self.store.remove(client_id).await
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientCredential>, AuthError> {
        self.store.list().await
    }

    pub fn generate_session_keys(&self, session_id: &str) -> Result<SessionKeys, AuthError> {
        self.session_keys.generate(session_id)
    }

    pub fn get_session_keys(&self, session_id: &str) -> Result<SessionKeys, AuthError> {
        self.session_keys.get(session_id)
    }

    pub fn revoke_session_keys(&self, session_id: &str) {
        self.session_keys.revoke(session_id)
    }

    pub async fn store_stats(&self) -> Result<StoreStats, AuthError> {
        self.store.stats().await
    }

    pub fn key_stats(&self) -> SessionKeyStats {
        self.session_keys.stats()
    }

    /// Stop the cleanup loop (exactly once) and close the store. Subsequent
    /// calls are no-ops.
    pub async fn close(&self) -> Result<(), AuthError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(shutdown) = self.cleanup_shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuthStore;

    fn test_config(ttl_secs: u64) -> AuthManagerConfig {
        AuthManagerConfig {
            session_ttl: Duration::from_secs(ttl_secs),
            cleanup_interval: Duration::from_secs(600),
            key_ttl_secs: 3600,
        }
    }

    #[tokio::test]
    async fn register_stamps_ttl() {
        let manager = AuthManager::new(Arc::new(MemoryAuthStore::new()), test_config(60));
        let cred = manager
            .register_client("c1", "u", "p", None, None, HashMap::new())
            .await
            .unwrap();

        let expires = cred.expires_at.expect("ttl should be set");
        assert!(expires > cred.created_at);
    }

    #[tokio::test]
    async fn zero_ttl_stores_indefinitely() {
        let manager = AuthManager::new(Arc::new(MemoryAuthStore::new()), test_config(0));
        let cred = manager
            .register_client("c1", "u", "p", None, None, HashMap::new())
            .await
            .unwrap();
        assert!(cred.expires_at.is_none());
    }

    #[tokio::test]
    async fn validate_mismatch_is_boolean_not_error() {
        let manager = AuthManager::new(Arc::new(MemoryAuthStore::new()), test_config(60));
        manager
            .register_client("c1", "u", "p", None, None, HashMap::new())
            .await
            .unwrap();

        let (_, ok) = manager.validate_client("c1", "u", "bad").await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = AuthManager::new(Arc::new(MemoryAuthStore::new()), test_config(60));
        manager.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn session_keys_flow_through_manager() {
        let manager = AuthManager::new(Arc::new(MemoryAuthStore::new()), test_config(60));
        let issued = manager.generate_session_keys("sess").unwrap();
        assert_eq!(manager.get_session_keys("sess").unwrap(), issued);

        manager.revoke_session_keys("sess");
        assert!(matches!(
            manager.get_session_keys("sess"),
            Err(AuthError::NotFound(_))
        ));
    }
}
