//! Provider registry and warm instance pool
//!
//! The registry maps `(capability, name)` to factories; the pool keeps
//! initialized, health-checked instances warm so conversations never pay
//! cold-start latency.

mod pool;
mod registry;

pub use pool::{InstanceFactory, PoolConfig, PoolStats, PooledProvider, ProviderPool};
pub use registry::{ProviderFactory, ProviderRegistry};

use edgevoice_core::{Error, Kind, ProviderKind};
use thiserror::Error as ThisError;

/// Provider layer errors.
#[derive(ThisError, Debug)]
pub enum ProviderError {
    #[error("unknown provider {kind}/{name}")]
    UnknownProvider { kind: ProviderKind, name: String },

    #[error("factory error: {0}")]
    Factory(String),

    #[error("pool {0} is closed")]
    Closed(String),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::UnknownProvider { .. } => Kind::Config,
            ProviderError::Factory(_) => Kind::Platform,
            ProviderError::Closed(_) => Kind::Domain,
        };
        Error::new(kind, "providers", err.to_string()).with_source(err)
    }
}
