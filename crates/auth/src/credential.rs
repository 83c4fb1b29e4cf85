//! Client credential record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One registered client. Replaced wholesale on re-register, removed by
/// `Remove` or TTL expiry — never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCredential {
    pub client_id: String,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ClientCredential {
    pub fn new(
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            ip: None,
            device_id: None,
            created_at: Utc::now(),
            expires_at: None,
            metadata: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Aggregate counters reported by `AuthStore::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub driver: String,
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn no_expiry_never_expires() {
        let cred = ClientCredential::new("c1", "u", "p");
        assert!(!cred.is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let mut cred = ClientCredential::new("c1", "u", "p");
        cred.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(cred.is_expired());
    }
}
