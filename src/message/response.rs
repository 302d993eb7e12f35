use std::time::Duration;

use uuid::Uuid;

use super::MessagePath;

/// Payload of a response, as returned by the remote handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseData {
    pub payload: Vec<u8>,
}

/// Outcome carried by every callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    /// The remote handle answered with an error.
    Failed,
    /// The retry budget ran out before any host accepted the message.
    DeliveryExhausted,
    /// The message deadline passed before a response arrived.
    Expired,
}

/// Metadata handed to the callback next to the [`ResponseData`].
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub uuid: Uuid,
    pub path: MessagePath,
    /// Host that produced the response, if one did.
    pub host: Option<String>,
    /// Time between the last send and the response.
    pub latency: Duration,
    pub status: ResponseStatus,
    pub error: Option<String>,
}

impl ResponseInfo {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Single callback type for every outcome of a message; invoked at most once.
pub type ResponseCallback = Box<dyn FnOnce(ResponseData, ResponseInfo) + Send + 'static>;
