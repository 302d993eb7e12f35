//! Heartbeat collector
//!
//! Every `poll_interval_ms` each tracked service goes through
//! `Stable -> Pinging -> Stable` (starting from `Unknown`):
//! - the directory is asked for the hosts advertised for the service,
//! - every advertised or previously known host is pinged concurrently,
//! - the answers become a new [`ServiceInfo`], diffed against the previous one,
//! - exactly one [`TopologyEvent`] goes to the service's subscriber.
//!
//! A host that misses a ping stays in the snapshot, flagged as failing, until
//! it has missed `dead_after_cycles` pings in a row. Ping and lookup failures
//! are logged and counted; they never stop the cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Directory, HandleInfo, HostInfo, ServiceInfo, TopologyEvent};
use crate::config::DiscoverySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Unknown,
    Pinging,
    Stable,
}

struct ServiceTracker {
    state: CollectorState,
    info: Arc<ServiceInfo>,
    failures: HashMap<String, u32>,
    subscriber: Option<mpsc::UnboundedSender<TopologyEvent>>,
}

pub struct TopologyCollector {
    directory: Arc<dyn Directory>,
    settings: DiscoverySettings,
    services: Mutex<BTreeMap<String, ServiceTracker>>,
}

impl TopologyCollector {
    pub fn new(directory: Arc<dyn Directory>, settings: DiscoverySettings) -> Self {
        Self {
            directory,
            settings,
            services: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts tracking `service`; its events go to `subscriber`, replacing any
    /// previous subscriber.
    pub fn track(&self, service: &str, subscriber: mpsc::UnboundedSender<TopologyEvent>) {
        let mut services = self.services.lock();
        let tracker = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceTracker {
                state: CollectorState::Unknown,
                info: Arc::new(ServiceInfo::empty(service)),
                failures: HashMap::new(),
                subscriber: None,
            });
        tracker.subscriber = Some(subscriber);
    }

    pub fn state(&self, service: &str) -> Option<CollectorState> {
        self.services.lock().get(service).map(|t| t.state)
    }

    pub fn snapshot(&self, service: &str) -> Option<Arc<ServiceInfo>> {
        self.services.lock().get(service).map(|t| t.info.clone())
    }

    /// Runs one cycle over every tracked service and returns the events that
    /// were emitted.
    pub async fn poll_cycle(&self) -> Vec<TopologyEvent> {
        let names: Vec<String> = self.services.lock().keys().cloned().collect();
        join_all(names.iter().map(|name| self.poll_service(name)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn poll_service(&self, service: &str) -> Option<TopologyEvent> {
        let known: Vec<HostInfo> = {
            let mut services = self.services.lock();
            let tracker = services.get_mut(service)?;
            tracker.state = CollectorState::Pinging;
            tracker.info.hosts.values().cloned().collect()
        };

        let listed = match self.directory.list_hosts(service).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(service, "host lookup failed: {e}");
                Vec::new()
            }
        };

        let mut candidates: BTreeMap<String, HostInfo> =
            known.into_iter().map(|h| (h.id.clone(), h)).collect();
        candidates.extend(listed.into_iter().map(|h| (h.id.clone(), h)));

        let timeout = Duration::from_millis(self.settings.ping_timeout_ms);
        let answers = join_all(candidates.values().map(|host| async move {
            let answer = tokio::time::timeout(timeout, self.directory.ping(host, service)).await;
            let handles = match answer {
                Ok(Ok(handles)) => Some(handles),
                Ok(Err(e)) => {
                    debug!(service, host = %host.id, "ping failed: {e}");
                    None
                }
                Err(_) => {
                    debug!(service, host = %host.id, "ping timed out");
                    None
                }
            };
            (host.clone(), handles)
        }))
        .await;

        let mut services = self.services.lock();
        let tracker = services.get_mut(service)?;
        let previous = tracker.info.clone();

        let mut next = ServiceInfo::empty(service);
        for (host, handles) in answers {
            match handles {
                Some(handles) => {
                    tracker.failures.remove(&host.id);
                    if handles.is_empty() {
                        continue;
                    }
                    next.handles
                        .insert(host.id.clone(), handles.into_iter().collect::<BTreeSet<HandleInfo>>());
                    next.hosts.insert(host.id.clone(), host);
                }
                None => {
                    let failures = tracker.failures.entry(host.id.clone()).or_insert(0);
                    *failures += 1;
                    if *failures < self.settings.dead_after_cycles
                        && previous.hosts.contains_key(&host.id)
                    {
                        if let Some(handles) = previous.handles.get(&host.id) {
                            next.handles.insert(host.id.clone(), handles.clone());
                        }
                        next.failing.insert(host.id.clone());
                        next.hosts.insert(host.id.clone(), host);
                    }
                }
            }
        }
        tracker.failures.retain(|id, _| candidates.contains_key(id));

        let event = TopologyEvent::diff(&previous, Arc::new(next));
        for host in &event.added {
            info!(service, host = %host.id, "host added");
        }
        for host in &event.removed {
            warn!(service, host = %host.id, "host removed");
        }

        tracker.info = event.info.clone();
        tracker.state = CollectorState::Stable;

        if let Some(subscriber) = &tracker.subscriber {
            if subscriber.send(event.clone()).is_err() {
                debug!(service, "topology subscriber went away");
                tracker.subscriber = None;
            }
        }

        Some(event)
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.settings.poll_interval_ms, "topology collector started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("topology collector stopped");
    }
}
