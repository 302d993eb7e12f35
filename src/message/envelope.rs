use chrono::Utc;
use uuid::Uuid;

use super::{MessagePath, MessagePolicy};

/// An application message addressed to a service handle.
///
/// Built by `DispatchClient::create_message`; the uuid is assigned there and
/// cannot be chosen by the caller, so two live messages never share one.
#[derive(Debug)]
pub struct Message {
    pub(crate) uuid: Uuid,
    pub(crate) path: MessagePath,
    pub(crate) payload: Vec<u8>,
    pub(crate) policy: MessagePolicy,
    /// Milliseconds since the UNIX epoch.
    pub(crate) enqueue_time: i64,
    pub(crate) attempt_count: u32,
}

impl Message {
    pub(crate) fn new(payload: Vec<u8>, path: MessagePath, policy: MessagePolicy) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            path,
            payload,
            policy,
            enqueue_time: Utc::now().timestamp_millis(),
            attempt_count: 0,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn path(&self) -> &MessagePath {
        &self.path
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    pub fn enqueue_time(&self) -> i64 {
        self.enqueue_time
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}

/// A message together with the signature that travels with it.
#[derive(Debug)]
pub struct Envelope {
    pub message: Message,
    pub identity: String,
    pub signature: Vec<u8>,
}
