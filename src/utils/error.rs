//! Crate-wide error type.
//!
//! Lower layers (storage, transport, directory) have their own small error
//! enums; they convert into [`DealerError`] at the component boundary. Only the
//! signing and cache paths ever hand a `DealerError` back to a caller of
//! `send_message`; delivery problems travel through the response callback.

use thiserror::Error;
use uuid::Uuid;

use crate::persistence::StorageError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, DealerError>;

#[derive(Debug, Error)]
pub enum DealerError {
    /// No key of the required kind is registered for the identity.
    #[error("unauthorized identity '{0}'")]
    UnauthorizedIdentity(String),

    #[error("invalid signature from identity '{0}'")]
    InvalidSignature(String),

    #[error("delivery of message {uuid} exhausted after {attempts} attempt(s)")]
    DeliveryExhausted { uuid: Uuid, attempts: u32 },

    #[error("message {uuid} expired after {elapsed_ms}ms")]
    Expired { uuid: Uuid, elapsed_ms: i64 },

    #[error("host unreachable: {0}")]
    HostUnreachable(#[from] TransportError),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// The uuid is already bound to a callback or its result was reported.
    #[error("message {0} has already been sent")]
    DuplicateMessage(Uuid),

    /// No registry exists for the service.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("credential directory {path}: {reason}")]
    KeyDirectory { path: String, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
