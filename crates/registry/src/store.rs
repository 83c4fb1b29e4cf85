//! Device and code persistence interfaces
//!
//! The SQL implementations live in the persistence crate; the in-memory ones
//! here back tests and the zero-dependency development setup.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::{Device, RegistryError, VerificationCode};

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn save(&self, device: &Device) -> Result<(), RegistryError>;

    async fn get(&self, device_id: &str) -> Result<Option<Device>, RegistryError>;

    async fn list(&self) -> Result<Vec<Device>, RegistryError>;

    async fn remove(&self, device_id: &str) -> Result<(), RegistryError>;
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn save(&self, code: &VerificationCode) -> Result<(), RegistryError>;

    /// Look up by `(code, purpose)` pair.
    async fn find(
        &self,
        code: &str,
        purpose: &str,
    ) -> Result<Option<VerificationCode>, RegistryError>;

    /// Persist an approval and the consumed code together. Implementations
    /// with transactions make this atomic.
    async fn persist_activation(
        &self,
        device_store: &dyn DeviceStore,
        device: &Device,
        code: &VerificationCode,
    ) -> Result<(), RegistryError> {
        self.save(code).await?;
        device_store.save(device).await
    }
}

/// Map-backed device store.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        self.devices
            .write()
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Device>, RegistryError> {
        Ok(self.devices.read().get(device_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        Ok(self.devices.read().values().cloned().collect())
    }

    async fn remove(&self, device_id: &str) -> Result<(), RegistryError> {
        self.devices.write().remove(device_id);
        Ok(())
    }
}

/// Map-backed code store, keyed by `(code, purpose)`.
#[derive(Default)]
pub struct MemoryCodeStore {
    codes: RwLock<HashMap<(String, String), VerificationCode>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn save(&self, code: &VerificationCode) -> Result<(), RegistryError> {
        self.codes
            .write()
            .insert((code.code.clone(), code.purpose.clone()), code.clone());
        Ok(())
    }

    async fn find(
        &self,
        code: &str,
        purpose: &str,
    ) -> Result<Option<VerificationCode>, RegistryError> {
        Ok(self
            .codes
            .read()
            .get(&(code.to_string(), purpose.to_string()))
            .cloned())
    }
}
