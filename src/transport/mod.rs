//! Transport seam between the registry and remote hosts.
//!
//! The engine only uses [`Transport`] and [`Connection`]; failures come back
//! as [`TransportError`] values and never unwind the caller. The bundled
//! implementation speaks WebSocket and carries [`Frame`]s encoded as JSON.

pub mod message;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use message::Frame;
pub use websocket::{WsConnection, WsTransport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("receive timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Frame(String),
}

/// Opens connections to host addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One open, bidirectional link to a host.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next frame; [`TransportError::Timeout`]
    /// when nothing arrived.
    async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    async fn close(&self);
}

#[cfg(test)]
pub(crate) mod mock;
