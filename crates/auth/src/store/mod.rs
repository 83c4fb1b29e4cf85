//! Auth store drivers
//!
//! One interface, three drivers selected by the `auth.driver` config key:
//! `memory` (RwLock map + GC ticker), `sqlite` (embedded SQL via sqlx) and
//! `redis` (remote KV with delegated expiry).

mod memory;
mod redis_store;
mod sqlite;

pub use memory::MemoryAuthStore;
pub use redis_store::RedisAuthStore;
pub use sqlite::SqliteAuthStore;

use async_trait::async_trait;
use std::sync::Arc;

use edgevoice_config::AuthConfig;

use crate::{AuthError, ClientCredential, StoreStats};

/// Credential persistence interface (C1).
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Insert or replace the credential for `info.client_id`.
    async fn store(&self, info: ClientCredential) -> Result<(), AuthError>;

    /// Check `(username, password)` for a client. Unknown client or mismatched
    /// password yield `Ok((None, false))`; a matching but expired credential
    /// yields `Err(Expired)`.
    async fn validate(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(Option<ClientCredential>, bool), AuthError>;

    /// Fetch a credential. Expired entries yield `Err(Expired)`.
    async fn get(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError>;

    async fn remove(&self, client_id: &str) -> Result<(), AuthError>;

    /// All live credentials. Expired entries are skipped, not deleted.
    async fn list(&self) -> Result<Vec<ClientCredential>, AuthError>;

    /// Purge expired entries. No-op for drivers that delegate expiry.
    async fn cleanup_expired(&self) -> Result<usize, AuthError>;

    async fn stats(&self) -> Result<StoreStats, AuthError>;

    async fn close(&self) -> Result<(), AuthError>;
}

/// Build a store from configuration. Unknown drivers fail deterministically.
pub async fn create_store(config: &AuthConfig) -> Result<Arc<dyn AuthStore>, AuthError> {
    match config.driver.as_str() {
        "memory" => {
            let store = Arc::new(MemoryAuthStore::new());
            store.start_gc(std::time::Duration::from_secs(config.gc_interval_secs));
            Ok(store)
        }
        "sqlite" => Ok(Arc::new(SqliteAuthStore::connect(&config.sqlite_path).await?)),
        "redis" => Ok(Arc::new(
            RedisAuthStore::connect(&config.redis_url, &config.redis_prefix, config.session_ttl_secs)
                .await?,
        )),
        other => Err(AuthError::InvalidArgument(format!(
            "unknown auth store driver '{other}'"
        ))),
    }
}
