//! Device registration and activation flows (C4)

use chrono::Duration;
use std::sync::Arc;

use crate::code::PURPOSE_ACTIVATE_DEVICE;
use crate::store::{CodeStore, DeviceStore};
use crate::{AppInfo, Device, RegistryError, VerificationCode};

#[derive(Debug, Clone)]
pub struct DeviceRegistryConfig {
    /// Gate onboarding behind one-time activation codes
    pub require_activation_code: bool,
    /// Owner of auto-approved devices
    pub default_admin_user_id: String,
    /// Activation code lifetime
    pub code_ttl: Duration,
}

impl Default for DeviceRegistryConfig {
    fn default() -> Self {
        Self {
            require_activation_code: true,
            default_admin_user_id: "admin".to_string(),
            code_ttl: Duration::hours(24),
        }
    }
}

/// Outcome of a register call.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub device: Device,
    pub is_new: bool,
}

pub struct DeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    codes: Arc<dyn CodeStore>,
    config: DeviceRegistryConfig,
}

impl DeviceRegistry {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        codes: Arc<dyn CodeStore>,
        config: DeviceRegistryConfig,
    ) -> Self {
        Self {
            devices,
            codes,
            config,
        }
    }

    /// Register a device, or refresh its liveness if it already exists.
    pub async fn register_device(
        &self,
        device_id: &str,
        client_id: &str,
        name: &str,
        firmware_version: &str,
        ip: &str,
        app_info: &str,
    ) -> Result<RegisterOutcome, RegistryError> {
        if device_id.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "device id must not be empty".to_string(),
            ));
        }

        if let Some(mut existing) = self.devices.get(device_id).await? {
            existing.touch(ip);
            existing.apply_app_info(AppInfo::parse(app_info));
            self.devices.save(&existing).await?;
            tracing::debug!(device_id, "re-register refreshed existing device");
            return Ok(RegisterOutcome {
                device: existing,
                is_new: false,
            });
        }

        let mut device = Device::new(device_id, client_id, name, firmware_version, ip);
        device.apply_app_info(AppInfo::parse(app_info));

        if self.config.require_activation_code {
            let code = VerificationCode::generate(
                device_id,
                PURPOSE_ACTIVATE_DEVICE,
                self.config.code_ttl,
            );
            self.codes.save(&code).await?;
            device.auth_code = code.code.clone();
            tracing::info!(device_id, "device registered pending activation");
        } else {
            device.approve(&self.config.default_admin_user_id)?;
            tracing::info!(device_id, "device registered and auto-approved");
        }

        self.devices.save(&device).await?;
        Ok(RegisterOutcome {
            device,
            is_new: true,
        })
    }

    /// Consume an activation code and approve the device. Re-activation of an
    /// approved device fails; the code is one-shot.
    pub async fn activate_device(
        &self,
        device_id: &str,
        auth_code: &str,
    ) -> Result<Device, RegistryError> {
        let mut device = self
            .devices
            .get(device_id)
            .await?
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.to_string()))?;

        // Code validity first: a consumed or expired code reads the same to
        // the caller whether or not the device got approved in the meantime.
        let mut code = self
            .codes
            .find(auth_code, PURPOSE_ACTIVATE_DEVICE)
            .await?
            .ok_or(RegistryError::CodeNotValid)?;

        code.consume(device_id)?;
        device.approve(&self.config.default_admin_user_id)?;

        self.codes
            .persist_activation(self.devices.as_ref(), &device, &code)
            .await?;

        tracing::info!(device_id, "device activated");
        Ok(device)
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>, RegistryError> {
        self.devices.get(device_id).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, RegistryError> {
        self.devices.list().await
    }

    /// Refresh liveness from the data plane.
    pub async fn touch_device(&self, device_id: &str, ip: &str) -> Result<(), RegistryError> {
        if let Some(mut device) = self.devices.get(device_id).await? {
            device.touch(ip);
            self.devices.save(&device).await?;
        }
        Ok(())
    }

    /// Add used tokens after a conversation round.
    pub async fn record_token_usage(
        &self,
        device_id: &str,
        tokens: u64,
    ) -> Result<(), RegistryError> {
        if tokens == 0 {
            return Ok(());
        }
        if let Some(mut device) = self.devices.get(device_id).await? {
            device.record_token_usage(tokens);
            self.devices.save(&device).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCodeStore, MemoryDeviceStore};
    use crate::AuthStatus;

    fn registry(require_code: bool) -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MemoryCodeStore::new()),
            DeviceRegistryConfig {
                require_activation_code: require_code,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn register_then_activate_happy_path() {
        let registry = registry(true);
        let outcome = registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4", "")
            .await
            .unwrap();

        assert!(outcome.is_new);
        assert_eq!(outcome.device.auth_status, AuthStatus::Pending);
        let code = outcome.device.auth_code.clone();
        assert_eq!(code.len(), 6);

        let device = registry.activate_device("dev-A", &code).await.unwrap();
        assert!(device.is_approved());
        assert_eq!(device.auth_code, "");
        assert!(device.user_id.is_some());

        // Same code again: one-shot.
        assert!(matches!(
            registry.activate_device("dev-A", &code).await,
            Err(RegistryError::CodeNotValid)
        ));
    }

    #[tokio::test]
    async fn used_code_is_rejected_for_second_device() {
        let registry = registry(true);
        let a = registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4", "")
            .await
            .unwrap();
        registry
            .register_device("dev-B", "cli-2", "n", "1.0.0", "1.2.3.5", "")
            .await
            .unwrap();

        registry
            .activate_device("dev-A", &a.device.auth_code)
            .await
            .unwrap();
        // dev-B trying dev-A's (already consumed) code
        assert!(matches!(
            registry.activate_device("dev-B", &a.device.auth_code).await,
            Err(RegistryError::CodeNotValid)
        ));
    }

    #[tokio::test]
    async fn auto_approve_when_codes_disabled() {
        let registry = registry(false);
        let outcome = registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4", "")
            .await
            .unwrap();

        assert!(outcome.device.is_approved());
        assert_eq!(outcome.device.auth_code, "");
        assert_eq!(outcome.device.user_id.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn re_register_updates_liveness_only() {
        let registry = registry(true);
        let first = registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4", "")
            .await
            .unwrap();
        let second = registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "5.6.7.8", "")
            .await
            .unwrap();

        assert!(!second.is_new);
        assert_eq!(second.device.id, first.device.id);
        assert_eq!(second.device.last_ip, "5.6.7.8");
        assert!(second.device.last_active_time >= first.device.last_active_time);
        assert_eq!(registry.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn activate_unknown_device_is_not_found() {
        let registry = registry(true);
        assert!(matches!(
            registry.activate_device("ghost", "000000").await,
            Err(RegistryError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn token_usage_accumulates() {
        let registry = registry(false);
        registry
            .register_device("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4", "")
            .await
            .unwrap();

        registry.record_token_usage("dev-A", 120).await.unwrap();
        registry.record_token_usage("dev-A", 80).await.unwrap();

        let device = registry.get_device("dev-A").await.unwrap().unwrap();
        assert_eq!(device.used_tokens, 200);
    }
}
