//! Cache entries for persistent messages.
//!
//! One entry per outstanding persistent message, keyed by uuid. Entries are
//! written before the message is enqueued and removed once the message is
//! acknowledged, exhausted or expired.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Storage, StorageError};
use crate::message::{Message, MessagePath, MessagePolicy};

/// Durable form of a persistent [`Message`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub uuid: Uuid,
    pub path: MessagePath,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub policy: MessagePolicy,
    pub enqueue_time: i64,
    pub attempt_count: u32,
}

impl From<&Message> for CacheEntry {
    fn from(message: &Message) -> Self {
        Self {
            uuid: message.uuid,
            path: message.path.clone(),
            payload: message.payload.clone(),
            policy: message.policy,
            enqueue_time: message.enqueue_time,
            attempt_count: message.attempt_count,
        }
    }
}

impl From<CacheEntry> for Message {
    fn from(entry: CacheEntry) -> Self {
        Self {
            uuid: entry.uuid,
            path: entry.path,
            payload: entry.payload,
            policy: entry.policy,
            enqueue_time: entry.enqueue_time,
            attempt_count: entry.attempt_count,
        }
    }
}

/// Typed view over the durable [`Storage`].
///
/// A cache without storage is transient: writes succeed without doing
/// anything and recovery finds nothing.
#[derive(Clone)]
pub struct MessageCache {
    storage: Option<Arc<dyn Storage>>,
}

impl MessageCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
        }
    }

    pub fn transient() -> Self {
        Self { storage: None }
    }

    pub fn is_durable(&self) -> bool {
        self.storage.is_some()
    }

    pub fn store(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let value = serde_json::to_vec(entry)?;
        storage.put(&entry.uuid.to_string(), &value)
    }

    pub fn load(&self, uuid: Uuid) -> Result<Option<CacheEntry>, StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        match storage.get(&uuid.to_string())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, uuid: Uuid) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.delete(&uuid.to_string()),
            None => Ok(()),
        }
    }

    /// Reads back every entry, oldest first. Entries that cannot be decoded are logged and
    /// deleted so they are not retried on every start.
    pub fn restore(&self) -> Result<Vec<CacheEntry>, StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut corrupt = Vec::new();

        for item in storage.iterate() {
            let (key, value) = item?;
            match serde_json::from_slice::<CacheEntry>(&value) {
                Ok(entry) if entry.uuid.to_string() == key => entries.push(entry),
                Ok(entry) => {
                    warn!(%key, uuid = %entry.uuid, "cache entry key does not match its uuid");
                    corrupt.push(key);
                }
                Err(e) => {
                    warn!(%key, "dropping undecodable cache entry: {e}");
                    corrupt.push(key);
                }
            }
        }

        for key in corrupt {
            storage.delete(&key)?;
        }

        entries.sort_by_key(|e| e.enqueue_time);
        debug!(count = entries.len(), "restored cache entries");
        Ok(entries)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCache")
            .field("durable", &self.is_durable())
            .finish()
    }
}
