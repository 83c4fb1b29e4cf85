//! Client credential stores and session key management
//!
//! Three pieces compose here:
//! - [`AuthStore`]: persisted `clientID -> credential` mapping with pluggable
//!   memory / sqlite / redis drivers
//! - [`SessionKeyManager`]: short-lived symmetric key pairs for secure
//!   channels
//! - [`AuthManager`]: the facade the server uses, owning TTL enforcement and
//!   the background cleanup loop

mod credential;
mod manager;
mod session_keys;
pub mod store;

pub use credential::{ClientCredential, StoreStats};
pub use manager::{AuthManager, AuthManagerConfig};
pub use session_keys::{SessionKeyManager, SessionKeyStats, SessionKeys};
pub use store::{create_store, AuthStore};

use edgevoice_core::{Error, Kind};
use thiserror::Error as ThisError;

/// Errors surfaced by the auth layer.
#[derive(ThisError, Debug)]
pub enum AuthError {
    /// Credential or session key exists but its TTL has elapsed
    #[error("expired: {0}")]
    Expired(String),

    /// No entry for the given id
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        let kind = match &err {
            AuthError::Expired(_) | AuthError::NotFound(_) | AuthError::InvalidArgument(_) => {
                Kind::Domain
            }
            AuthError::Storage(_) => Kind::Storage,
        };
        Error::new(kind, "auth", err.to_string()).with_source(err)
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        AuthError::Storage(err.to_string())
    }
}
