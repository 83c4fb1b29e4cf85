//! One-shot verification codes

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// Purpose tag for device activation codes.
pub const PURPOSE_ACTIVATE_DEVICE: &str = "activity_device";

/// A six-digit one-shot secret binding a registration to an approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCode {
    pub id: String,
    pub code: String,
    pub purpose: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    /// Generate a cryptographically random 6-decimal-digit code.
    pub fn generate(device_id: impl Into<String>, purpose: impl Into<String>, ttl: Duration) -> Self {
        let value: u32 = rand::thread_rng().gen_range(0..1_000_000);
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: format!("{value:06}"),
            purpose: purpose.into(),
            device_id: device_id.into(),
            expires_at: now + ttl,
            used: false,
            used_at: None,
            created_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Consume the code for `device_id`. Valid at most once, within the TTL,
    /// and only for the device it was issued to.
    pub fn consume(&mut self, device_id: &str) -> Result<(), RegistryError> {
        if self.used || self.is_expired() || self.device_id != device_id {
            return Err(RegistryError::CodeNotValid);
        }
        self.used = true;
        self.used_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_six_decimal_digits() {
        for _ in 0..32 {
            let code = VerificationCode::generate("dev", PURPOSE_ACTIVATE_DEVICE, Duration::hours(24));
            assert_eq!(code.code.len(), 6);
            assert!(code.code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn consume_succeeds_at_most_once() {
        let mut code =
            VerificationCode::generate("dev-A", PURPOSE_ACTIVATE_DEVICE, Duration::hours(24));
        code.consume("dev-A").unwrap();
        assert!(code.used_at.is_some());
        assert!(matches!(
            code.consume("dev-A"),
            Err(RegistryError::CodeNotValid)
        ));
    }

    #[test]
    fn consume_rejects_wrong_device() {
        let mut code =
            VerificationCode::generate("dev-A", PURPOSE_ACTIVATE_DEVICE, Duration::hours(24));
        assert!(matches!(
            code.consume("dev-B"),
            Err(RegistryError::CodeNotValid)
        ));
        assert!(!code.used);
    }

    #[test]
    fn consume_rejects_expired() {
        let mut code =
            VerificationCode::generate("dev-A", PURPOSE_ACTIVATE_DEVICE, Duration::seconds(-1));
        assert!(matches!(
            code.consume("dev-A"),
            Err(RegistryError::CodeNotValid)
        ));
    }
}
