//! Service topology: which hosts serve which handles.
//!
//! The [`TopologyCollector`] polls a [`Directory`] on a fixed interval and
//! emits one [`TopologyEvent`] per service per cycle.

pub mod collector;
pub mod directory;
pub mod types;

pub use collector::{CollectorState, TopologyCollector};
pub use directory::{Directory, DirectoryError, WsDirectory};
pub use types::{HandleInfo, HostInfo, ServiceInfo, TopologyEvent};
