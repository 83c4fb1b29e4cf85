//! Device aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// Onboarding state. `Approved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Last-reported radio state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiInfo {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub ip: String,
}

/// Hardware details reported in the register payload's `appInfo`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppInfo {
    #[serde(default)]
    pub board_type: String,
    #[serde(default)]
    pub chip_model: String,
    #[serde(default)]
    pub wifi: WifiInfo,
}

impl AppInfo {
    /// Lenient parse: a missing or malformed payload is an empty report, not
    /// an error — old firmware sends free-form text here.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_default()
    }
}

/// One physical device in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_id: String,
    pub client_id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub firmware_version: String,
    pub board_type: String,
    pub chip_model: String,
    pub wifi: WifiInfo,
    pub auth_status: AuthStatus,
    /// Pending activation code; cleared on approval
    pub auth_code: String,
    pub register_time: DateTime<Utc>,
    pub last_active_time: DateTime<Utc>,
    pub last_ip: String,
    pub total_tokens: u64,
    pub used_tokens: u64,
    pub last_session_end_at: Option<DateTime<Utc>>,
    pub conversation_id: String,
    pub mode: String,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        client_id: impl Into<String>,
        name: impl Into<String>,
        firmware_version: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            client_id: client_id.into(),
            user_id: None,
            name: name.into(),
            firmware_version: firmware_version.into(),
            board_type: String::new(),
            chip_model: String::new(),
            wifi: WifiInfo::default(),
            auth_status: AuthStatus::Pending,
            auth_code: String::new(),
            register_time: now,
            last_active_time: now,
            last_ip: ip.into(),
            total_tokens: 0,
            used_tokens: 0,
            last_session_end_at: None,
            conversation_id: String::new(),
            mode: String::new(),
        }
    }

    pub fn apply_app_info(&mut self, info: AppInfo) {
        if !info.board_type.is_empty() {
            self.board_type = info.board_type;
        }
        if !info.chip_model.is_empty() {
            self.chip_model = info.chip_model;
        }
        if !info.wifi.ssid.is_empty() || !info.wifi.ip.is_empty() {
            self.wifi = info.wifi;
        }
    }

    pub fn touch(&mut self, ip: impl Into<String>) {
        self.last_active_time = Utc::now();
        self.last_ip = ip.into();
    }

    /// Transition to `Approved`. Clears the pending code and records the
    /// owning user — approved devices never carry a code and always have an
    /// owner.
    pub fn approve(&mut self, user_id: impl Into<String>) -> Result<(), RegistryError> {
        match self.auth_status {
            AuthStatus::Pending => {
                self.auth_status = AuthStatus::Approved;
                self.auth_code = String::new();
                self.user_id = Some(user_id.into());
                Ok(())
            }
            AuthStatus::Approved => Err(RegistryError::AlreadyApproved(self.device_id.clone())),
            AuthStatus::Rejected => Err(RegistryError::Rejected(self.device_id.clone())),
        }
    }

    pub fn reject(&mut self) -> Result<(), RegistryError> {
        match self.auth_status {
            AuthStatus::Pending => {
                self.auth_status = AuthStatus::Rejected;
                self.auth_code = String::new();
                Ok(())
            }
            AuthStatus::Approved => Err(RegistryError::AlreadyApproved(self.device_id.clone())),
            AuthStatus::Rejected => Ok(()),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.auth_status == AuthStatus::Approved
    }

    /// Add to the per-device token counter.
    pub fn record_token_usage(&mut self, tokens: u64) {
        self.used_tokens = self.used_tokens.saturating_add(tokens);
        self.total_tokens = self.total_tokens.saturating_add(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_clears_code_and_sets_owner() {
        let mut device = Device::new("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4");
        device.auth_code = "123456".to_string();

        device.approve("admin").unwrap();
        assert!(device.is_approved());
        assert_eq!(device.auth_code, "");
        assert_eq!(device.user_id.as_deref(), Some("admin"));
    }

    #[test]
    fn approved_is_terminal() {
        let mut device = Device::new("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4");
        device.approve("admin").unwrap();

        assert!(matches!(
            device.approve("admin"),
            Err(RegistryError::AlreadyApproved(_))
        ));
        assert!(matches!(
            device.reject(),
            Err(RegistryError::AlreadyApproved(_))
        ));
    }

    #[test]
    fn rejected_device_cannot_be_approved() {
        let mut device = Device::new("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4");
        device.reject().unwrap();
        assert!(matches!(
            device.approve("admin"),
            Err(RegistryError::Rejected(_))
        ));
    }

    #[test]
    fn app_info_parse_is_lenient() {
        let info = AppInfo::parse("not json at all");
        assert_eq!(info.board_type, "");

        let info =
            AppInfo::parse(r#"{"board_type":"esp32-s3","chip_model":"esp32","wifi":{"ssid":"lab","channel":6,"rssi":-41,"ip":"10.0.0.9"}}"#);
        assert_eq!(info.board_type, "esp32-s3");
        assert_eq!(info.wifi.channel, 6);
    }
}
