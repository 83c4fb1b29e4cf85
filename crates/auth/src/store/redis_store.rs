//! Remote KV auth store (redis)
//!
//! Credentials are JSON values at `prefix + client_id` with TTL applied on
//! write (`EX` semantics). Expiry is the server's job: `cleanup_expired` is a
//! no-op and this driver never reports `Expired` — an expired entry is simply
//! gone.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{AuthError, ClientCredential, StoreStats};

use super::AuthStore;

const SCAN_PAGE: usize = 100;

pub struct RedisAuthStore {
    conn: ConnectionManager,
    prefix: String,
    default_ttl_secs: u64,
}

impl RedisAuthStore {
    pub async fn connect(
        url: &str,
        prefix: &str,
        default_ttl_secs: u64,
    ) -> Result<Self, AuthError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            default_ttl_secs,
        })
    }

    fn key(&self, client_id: &str) -> String {
        format!("{}{}", self.prefix, client_id)
    }

    /// TTL for a credential: remaining lifetime if `expires_at` is set,
    /// otherwise the configured default (0 = no expiry).
    fn ttl_for(&self, info: &ClientCredential) -> Option<u64> {
        match info.expires_at {
            Some(exp) => {
                let remaining = (exp - Utc::now()).num_seconds();
                Some(remaining.max(1) as u64)
            }
            None if self.default_ttl_secs > 0 => Some(self.default_ttl_secs),
            None => None,
        }
    }

    async fn scan_keys(&self) -> Result<Vec<String>, AuthError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn fetch(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(client_id)).await?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| AuthError::Storage(format!("corrupt credential json: {e}"))),
        }
    }
}

#[async_trait]
impl AuthStore for RedisAuthStore {
    async fn store(&self, info: ClientCredential) -> Result<(), AuthError> {
        let json =
            serde_json::to_string(&info).map_err(|e| AuthError::Storage(e.to_string()))?;
        let key = self.key(&info.client_id);
        let mut conn = self.conn.clone();
        match self.ttl_for(&info) {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, json, ttl).await?,
            None => conn.set::<_, _, ()>(key, json).await?,
        }
        Ok(())
    }

    async fn validate(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(Option<ClientCredential>, bool), AuthError> {
        match self.fetch(client_id).await? {
            Some(cred) if cred.matches(username, password) => Ok((Some(cred), true)),
            _ => Ok((None, false)),
        }
    }

    async fn get(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        self.fetch(client_id).await
    }

    async fn remove(&self, client_id: &str) -> Result<(), AuthError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(client_id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientCredential>, AuthError> {
        let keys = self.scan_keys().await?;
        let mut out = Vec::with_capacity(keys.len());
        let mut conn = self.conn.clone();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                match serde_json::from_str(&json) {
                    Ok(cred) => out.push(cred),
                    Err(e) => tracing::warn!(key, error = %e, "skipping corrupt credential"),
                }
            }
        }
        Ok(out)
    }

    async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        // The server expires keys itself.
        Ok(0)
    }

    async fn stats(&self) -> Result<StoreStats, AuthError> {
        let total = self.scan_keys().await?.len();
        Ok(StoreStats {
            driver: "redis".to_string(),
            total,
            active: total,
            expired: 0,
        })
    }

    async fn close(&self) -> Result<(), AuthError> {
        Ok(())
    }
}
