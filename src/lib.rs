//! # Dealer
//!
//! `dealer` is the client side of a distributed task-dispatch framework.
//! Applications hand it opaque payloads addressed to a service handle; it
//! finds the hosts serving that handle, delivers each message to one of them,
//! retries across host failures and topology changes, keeps persistent
//! messages in a local cache until they are answered, and signs and verifies
//! all traffic per identity.
//!
//! ## Core Modules
//!
//! - `client`: The `DispatchClient` façade: message creation, sending, response callbacks and cache recovery.
//! - `registry`: One `ServiceRegistry` per service, owning the per-handle queues and host connections.
//! - `topology`: The heartbeat collector that tracks which hosts serve which handles.
//! - `security`: The identity-keyed signature store.
//! - `persistence`: Durable storage (sled) and the message cache built on it.
//! - `transport`: The connection seam and its WebSocket implementation.
//! - `message`: Messages, paths, policies and response types.
//! - `config`: Loading and merging configuration.
//! - `utils`: Error type and logging setup.

pub mod client;
pub mod config;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod security;
pub mod topology;
pub mod transport;
pub mod utils;

pub use client::DispatchClient;
pub use message::{Message, MessagePath, MessagePolicy, ResponseData, ResponseInfo, ResponseStatus};
pub use utils::{DealerError, Result};
