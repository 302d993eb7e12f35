//! Service registries: per-handle outbound queues, host connections and
//! redistribution on topology changes.

pub mod queue;
pub mod service;

pub use queue::{HandleQueue, Queued};
pub use service::{Acknowledged, InboundResponse, RegistryEvent, ServiceRegistry};

#[cfg(test)]
mod tests;
