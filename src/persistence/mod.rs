//! Durable storage for persistent messages.
//!
//! The engine only sees the [`Storage`] trait (put/get/iterate/delete).
//! `sled` provides the default implementation; [`MessageCache`] layers the
//! cache entry format on top and is owned by the dispatch client alone.

pub mod cache;
pub mod sled_store;

use thiserror::Error;

pub use cache::{CacheEntry, MessageCache};
pub use sled_store::SledStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("cache entry encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid key {0:?}")]
    InvalidKey(Vec<u8>),
}

/// Key-value storage consumed by the message cache.
pub trait Storage: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Lazily walks every stored pair. Used once, at startup.
    fn iterate(&self) -> Box<dyn Iterator<Item = Result<(String, Vec<u8>), StorageError>> + '_>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Blocks until every previous write is durable.
    fn flush(&self) -> Result<(), StorageError>;
}
