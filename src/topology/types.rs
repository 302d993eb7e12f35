use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A host as advertised by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostInfo {
    pub id: String,
    pub address: String,
}

impl HostInfo {
    /// Host identified by its own address.
    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            address,
        }
    }
}

/// A handle endpoint served by one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleInfo {
    pub name: String,
    pub endpoint: String,
}

/// Snapshot of one service's topology. Replaced wholesale on every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service: String,
    pub hosts: BTreeMap<String, HostInfo>,
    pub handles: BTreeMap<String, BTreeSet<HandleInfo>>,
    /// Hosts that missed their last ping but are not yet considered gone.
    pub failing: BTreeSet<String>,
}

impl ServiceInfo {
    pub fn empty(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }

    pub fn serves(&self, host_id: &str, handle: &str) -> bool {
        self.handles
            .get(host_id)
            .is_some_and(|handles| handles.iter().any(|h| h.name == handle))
    }
}

/// Result of one polling cycle for one service.
///
/// Emitted even when nothing changed; an empty diff still proves the
/// collector is alive.
#[derive(Debug, Clone)]
pub struct TopologyEvent {
    pub service: String,
    pub info: Arc<ServiceInfo>,
    pub added: Vec<HostInfo>,
    pub removed: Vec<HostInfo>,
    /// Hosts present before and after whose handle set changed.
    pub changed: Vec<String>,
}

impl TopologyEvent {
    pub fn diff(previous: &ServiceInfo, current: Arc<ServiceInfo>) -> Self {
        let added = current
            .hosts
            .values()
            .filter(|h| !previous.hosts.contains_key(&h.id))
            .cloned()
            .collect();
        let removed = previous
            .hosts
            .values()
            .filter(|h| !current.hosts.contains_key(&h.id))
            .cloned()
            .collect();
        let changed = current
            .hosts
            .keys()
            .filter(|id| {
                previous.hosts.contains_key(*id) && previous.handles.get(*id) != current.handles.get(*id)
            })
            .cloned()
            .collect();

        Self {
            service: current.service.clone(),
            info: current,
            added,
            removed,
            changed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
