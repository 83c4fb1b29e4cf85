//! Short-lived symmetric session keys (C2)

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;

use crate::AuthError;

/// Key material for one secure channel. Both fields are hex-encoded 16-byte
/// values.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionKeys {
    pub session_id: String,
    pub sym_key: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionKeys {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Counters reported by [`SessionKeyManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionKeyStats {
    pub ttl_secs: u64,
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

/// In-memory session key issuance and lookup. Expired entries are deleted
/// lazily on read and in bulk by `cleanup_expired`.
pub struct SessionKeyManager {
    keys: RwLock<HashMap<String, SessionKeys>>,
    ttl: Duration,
}

impl SessionKeyManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Issue a fresh key pair for `session_id`, replacing any previous one.
    pub fn generate(&self, session_id: &str) -> Result<SessionKeys, AuthError> {
        if session_id.is_empty() {
            return Err(AuthError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }

        let mut key = [0u8; 16];
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut nonce);

        let now = Utc::now();
        let keys = SessionKeys {
            session_id: session_id.to_string(),
            sym_key: hex::encode(key),
            nonce: hex::encode(nonce),
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.keys
            .write()
            .insert(session_id.to_string(), keys.clone());
        Ok(keys)
    }

    /// Look up keys. An expired entry is removed and reported as such.
    pub fn get(&self, session_id: &str) -> Result<SessionKeys, AuthError> {
        let mut keys = self.keys.write();
        match keys.get(session_id) {
            None => Err(AuthError::NotFound(session_id.to_string())),
            Some(entry) if entry.is_expired() => {
                keys.remove(session_id);
                Err(AuthError::Expired(session_id.to_string()))
            }
            Some(entry) => Ok(entry.clone()),
        }
    }

    pub fn revoke(&self, session_id: &str) {
        self.keys.write().remove(session_id);
    }

    pub fn cleanup_expired(&self) -> usize {
        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|_, entry| !entry.is_expired());
        before - keys.len()
    }

    pub fn stats(&self) -> SessionKeyStats {
        let keys = self.keys.read();
        let total = keys.len();
        let expired = keys.values().filter(|k| k.is_expired()).count();
        SessionKeyStats {
            ttl_secs: self.ttl.num_seconds().max(0) as u64,
            total,
            active: total - expired,
            expired,
        }
    }
}
