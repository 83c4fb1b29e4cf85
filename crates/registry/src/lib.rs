//! Device registry and activation-code lifecycle
//!
//! The aggregate root for physical devices: registration, the one-shot
//! activation code bridge, and the `pending -> approved | rejected` state
//! machine.

mod code;
mod device;
mod service;
pub mod store;

pub use code::{VerificationCode, PURPOSE_ACTIVATE_DEVICE};
pub use device::{AppInfo, AuthStatus, Device, WifiInfo};
pub use service::{DeviceRegistry, DeviceRegistryConfig, RegisterOutcome};
pub use store::{CodeStore, DeviceStore, MemoryCodeStore, MemoryDeviceStore};

use edgevoice_core::{Error, Kind};
use thiserror::Error as ThisError;

/// Device registry errors. The HTTP layer maps these onto status codes:
/// not-found -> 404, domain violations -> 400, storage -> 500.
#[derive(ThisError, Debug)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device already approved: {0}")]
    AlreadyApproved(String),

    #[error("device rejected: {0}")]
    Rejected(String),

    #[error("verification code expired or used")]
    CodeNotValid,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::Storage(_) => Kind::Storage,
            _ => Kind::Domain,
        };
        Error::new(kind, "device-registry", err.to_string()).with_source(err)
    }
}
