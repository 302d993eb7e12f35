//! Per-service registry
//!
//! Owns one [`HandleQueue`] per handle, the open host connections and the
//! set of in-flight messages. Two background tasks drive it:
//! - the delivery task wakes on enqueue or on every `retry_interval_ms` tick,
//!   sweeps expired and unacknowledged messages, then pumps the queues;
//! - the topology task applies every [`TopologyEvent`] for the service.
//!
//! Every open connection also gets a reader task that forwards response
//! frames as [`RegistryEvent::Response`]. Nothing here verifies signatures or
//! touches callbacks; that is the dispatch client's job.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HandleQueue, Queued};
use crate::config::DeliverySettings;
use crate::message::{Envelope, MessagePath};
use crate::persistence::cache::CacheEntry;
use crate::topology::{HostInfo, ServiceInfo, TopologyEvent};
use crate::transport::{Connection, Frame, Transport, TransportError};

/// Idle wait of a connection reader between two checks of its connection.
const READ_IDLE: Duration = Duration::from_secs(30);

/// A response frame read from a host, not yet verified.
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub uuid: Uuid,
    pub path: MessagePath,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub identity: String,
    pub error: Option<String>,
    pub host: String,
}

/// What a registry reports to its owner.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Response(InboundResponse),
    /// The retry budget ran out; the message is gone from the registry.
    Exhausted {
        uuid: Uuid,
        path: MessagePath,
        attempts: u32,
        reason: String,
    },
    /// The deadline passed; the message is gone from the registry.
    Expired {
        uuid: Uuid,
        path: MessagePath,
        elapsed_ms: i64,
    },
    /// A persistent message failed an attempt and is queued again; carries
    /// its updated durable form.
    Attempted(CacheEntry),
}

/// Returned by [`ServiceRegistry::acknowledge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledged {
    pub host: Option<String>,
    pub latency: Duration,
}

struct InFlight {
    queued: Queued,
    host: String,
    sent_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    queues: BTreeMap<String, HandleQueue>,
    /// Handle to the healthy hosts serving it, ordered by host id.
    routes: HashMap<String, Vec<HostInfo>>,
    cursors: HashMap<String, usize>,
    connections: HashMap<String, Arc<dyn Connection>>,
    in_flight: HashMap<Uuid, InFlight>,
    topology: Arc<ServiceInfo>,
    next_seq: u64,
}

impl RegistryState {
    fn queue(&mut self, handle: &str) -> &mut HandleQueue {
        self.queues.entry(handle.to_string()).or_default()
    }

    fn requeue(&mut self, queued: Queued) {
        let handle = queued.envelope.message.path.handle.clone();
        self.queue(&handle).push(queued);
    }

    /// Next round-robin host for `handle`.
    fn select_host(&mut self, handle: &str) -> Option<HostInfo> {
        let hosts = self.routes.get(handle).filter(|h| !h.is_empty())?;
        let cursor = self.cursors.entry(handle.to_string()).or_insert(0);
        let host = hosts[*cursor % hosts.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(host)
    }

    /// Moves every in-flight message sent to `host` back to its queue.
    fn requeue_host(&mut self, host: &str) -> usize {
        let uuids: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.host == host)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in &uuids {
            if let Some(flight) = self.in_flight.remove(uuid) {
                self.requeue(flight.queued);
            }
        }
        uuids.len()
    }
}

pub struct ServiceRegistry {
    name: String,
    transport: Arc<dyn Transport>,
    delivery: DeliverySettings,
    events: mpsc::UnboundedSender<RegistryEvent>,
    state: Mutex<RegistryState>,
    wakeup: Notify,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        delivery: DeliverySettings,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            name: name.to_string(),
            transport,
            delivery,
            events,
            state: Mutex::new(RegistryState {
                topology: Arc::new(ServiceInfo::empty(name)),
                ..RegistryState::default()
            }),
            wakeup: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the delivery task and the task consuming `topology`.
    pub fn spawn(self: &Arc<Self>, mut topology: mpsc::UnboundedReceiver<TopologyEvent>) {
        let delivery = {
            let registry = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let period = Duration::from_millis(registry.delivery.retry_interval_ms.max(1));
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = registry.wakeup.notified() => {}
                        _ = tick.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    registry.sweep(Instant::now());
                    registry.pump().await;
                }
                debug!(service = %registry.name, "delivery task stopped");
            })
        };

        let topology_task = {
            let registry = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = topology.recv() => {
                            let Some(event) = event else { break };
                            let added = registry.apply_topology(&event);
                            for host in added {
                                if let Err(e) = registry.connection_for(&host).await {
                                    debug!(service = %registry.name, host = %host.id, "eager connect failed: {e}");
                                }
                            }
                            registry.wakeup.notify_one();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!(service = %registry.name, "topology task stopped");
            })
        };

        self.tasks.lock().extend([delivery, topology_task]);
    }

    /// Appends a signed message to its handle queue and wakes the delivery task.
    pub fn enqueue(&self, envelope: Envelope) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let handle = envelope.message.path.handle.clone();
            state.queue(&handle).push(Queued {
                envelope,
                seq,
                not_before: None,
            });
        }
        self.wakeup.notify_one();
    }

    /// Attempts every ready message at most once. Returns how many were sent.
    pub async fn pump(self: &Arc<Self>) -> usize {
        let mut attempted: HashSet<Uuid> = HashSet::new();
        let mut sent = 0;

        while let Some((uuid, host, frame)) = self.next_delivery(&mut attempted) {
            let connection = match self.connection_for(&host).await {
                Ok(connection) => connection,
                Err(_) if self.is_closing() => {
                    self.release_in_flight(uuid);
                    break;
                }
                Err(e) => {
                    self.fail_in_flight(uuid, e.to_string());
                    continue;
                }
            };

            let outcome = match frame.encode() {
                Ok(bytes) => connection.send(bytes).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    debug!(service = %self.name, %uuid, host = %host.id, "message sent");
                    sent += 1;
                }
                Err(e) => {
                    self.fail_in_flight(uuid, e.to_string());
                    if !matches!(e, TransportError::Frame(_)) {
                        self.drop_connection(&host.id, &connection);
                    }
                }
            }
        }

        sent
    }

    /// Takes the next ready message off a queue, registers it as in flight on
    /// the chosen host and returns the frame to send.
    fn next_delivery(&self, attempted: &mut HashSet<Uuid>) -> Option<(Uuid, HostInfo, Frame)> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let handles: Vec<String> = state.queues.keys().cloned().collect();
        for handle in handles {
            let ready = state.queues.get(&handle).and_then(|q| q.peek_ready(now)).map(Queued::uuid);
            let Some(uuid) = ready.filter(|u| !attempted.contains(u)) else {
                continue;
            };
            let Some(host) = state.select_host(&handle) else {
                continue;
            };
            let Some(queued) = state.queue(&handle).pop_front() else {
                continue;
            };
            attempted.insert(uuid);

            let message = &queued.envelope.message;
            let frame = Frame::Request {
                uuid,
                service: message.path.service.clone(),
                handle: message.path.handle.clone(),
                payload: message.payload.clone(),
                signature: queued.envelope.signature.clone(),
                identity: queued.envelope.identity.clone(),
            };
            state.in_flight.insert(
                uuid,
                InFlight {
                    queued,
                    host: host.id.clone(),
                    sent_at: now,
                },
            );
            return Some((uuid, host, frame));
        }
        None
    }

    fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Puts an in-flight message back without counting an attempt.
    fn release_in_flight(&self, uuid: Uuid) {
        let mut state = self.state.lock();
        if let Some(flight) = state.in_flight.remove(&uuid) {
            state.requeue(flight.queued);
        }
    }

    fn fail_in_flight(&self, uuid: Uuid, reason: String) {
        let mut state = self.state.lock();
        if let Some(flight) = state.in_flight.remove(&uuid) {
            self.fail_attempt(&mut state, flight.queued, reason);
        }
    }

    /// Counts a failed attempt: reports exhaustion, or puts the message back
    /// with backoff.
    fn fail_attempt(&self, state: &mut RegistryState, mut queued: Queued, reason: String) {
        let message = &mut queued.envelope.message;
        message.attempt_count += 1;
        let attempts = message.attempt_count;

        if message.policy.retries_exhausted(attempts) {
            warn!(service = %self.name, uuid = %message.uuid, attempts, "delivery exhausted: {reason}");
            let _ = self.events.send(RegistryEvent::Exhausted {
                uuid: message.uuid,
                path: message.path.clone(),
                attempts,
                reason,
            });
            return;
        }

        let delay = self.delivery.backoff_delay(attempts);
        debug!(
            service = %self.name,
            uuid = %message.uuid,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "attempt failed: {reason}"
        );
        if message.policy.persistent {
            let _ = self.events.send(RegistryEvent::Attempted(CacheEntry::from(&*message)));
        }
        queued.not_before = Some(Instant::now() + delay);
        state.requeue(queued);
    }

    /// Drops expired messages and fails in-flight ones whose ack timeout ran
    /// out.
    pub fn sweep(&self, now: Instant) {
        let now_ms = Utc::now().timestamp_millis();
        let ack_timeout = Duration::from_millis(self.delivery.ack_timeout_ms);
        let mut state = self.state.lock();

        let mut expired = Vec::new();
        for queue in state.queues.values_mut() {
            expired.extend(queue.drain_where(|q| {
                let m = &q.envelope.message;
                m.policy.expired(m.enqueue_time, now_ms)
            }));
        }

        let mut timed_out = Vec::new();
        let uuids: Vec<Uuid> = state.in_flight.keys().copied().collect();
        for uuid in uuids {
            let Some(flight) = state.in_flight.get(&uuid) else {
                continue;
            };
            let message = &flight.queued.envelope.message;
            if message.policy.expired(message.enqueue_time, now_ms) {
                if let Some(flight) = state.in_flight.remove(&uuid) {
                    expired.push(flight.queued);
                }
            } else if now.saturating_duration_since(flight.sent_at) >= ack_timeout {
                if let Some(flight) = state.in_flight.remove(&uuid) {
                    timed_out.push(flight);
                }
            }
        }

        for queued in expired {
            let message = &queued.envelope.message;
            let elapsed_ms = now_ms - message.enqueue_time;
            info!(service = %self.name, uuid = %message.uuid, elapsed_ms, "message expired");
            let _ = self.events.send(RegistryEvent::Expired {
                uuid: message.uuid,
                path: message.path.clone(),
                elapsed_ms,
            });
        }

        for flight in timed_out {
            let reason = format!("no response from {} within {}ms", flight.host, ack_timeout.as_millis());
            self.fail_attempt(&mut state, flight.queued, reason);
        }
    }

    /// Installs a new topology snapshot.
    ///
    /// Closes connections to removed hosts, rebuilds routing and puts every
    /// in-flight message whose host no longer serves its handle back in its
    /// queue. Returns the hosts that were added, for eager connection.
    pub fn apply_topology(&self, event: &TopologyEvent) -> Vec<HostInfo> {
        let closing: Vec<Arc<dyn Connection>> = {
            let mut state = self.state.lock();

            let mut routes: HashMap<String, Vec<HostInfo>> = HashMap::new();
            for (host_id, handles) in &event.info.handles {
                if event.info.failing.contains(host_id) {
                    continue;
                }
                let Some(host) = event.info.hosts.get(host_id) else {
                    continue;
                };
                for handle in handles {
                    routes.entry(handle.name.clone()).or_default().push(host.clone());
                }
            }
            for hosts in routes.values_mut() {
                hosts.sort();
            }
            state.routes = routes;
            state.topology = event.info.clone();

            let stranded: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, f)| !event.info.serves(&f.host, &f.queued.envelope.message.path.handle))
                .map(|(uuid, _)| *uuid)
                .collect();
            if !stranded.is_empty() {
                info!(service = %self.name, count = stranded.len(), "redistributing in-flight messages");
            }
            for uuid in stranded {
                if let Some(flight) = state.in_flight.remove(&uuid) {
                    state.requeue(flight.queued);
                }
            }

            event
                .removed
                .iter()
                .filter_map(|h| state.connections.remove(&h.id))
                .collect()
        };

        for connection in closing {
            tokio::spawn(async move { connection.close().await });
        }

        if !event.is_empty() {
            self.wakeup.notify_one();
        }
        event.added.clone()
    }

    /// Completes an in-flight (or requeued) message sent on `path`. `None`
    /// when the registry no longer knows the uuid or knows it under another
    /// path; the message is left untouched then.
    pub fn acknowledge(&self, uuid: Uuid, path: &MessagePath) -> Option<Acknowledged> {
        let mut state = self.state.lock();
        if let Some(flight) = state.in_flight.get(&uuid) {
            if flight.queued.envelope.message.path != *path {
                return None;
            }
            let flight = state.in_flight.remove(&uuid)?;
            return Some(Acknowledged {
                host: Some(flight.host),
                latency: flight.sent_at.elapsed(),
            });
        }
        if path.service != self.name {
            return None;
        }
        state
            .queues
            .get_mut(&path.handle)
            .and_then(|q| q.remove(uuid))
            .map(|_| Acknowledged {
                host: None,
                latency: Duration::ZERO,
            })
    }

    async fn connection_for(self: &Arc<Self>, host: &HostInfo) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(connection) = self.state.lock().connections.get(&host.id) {
            return Ok(connection.clone());
        }

        let connection = self.transport.connect(&host.address).await?;

        // `close` raises the flag before draining connections, so checking it
        // under the state lock keeps a late connect out of the drained map.
        let registered = {
            let mut state = self.state.lock();
            if *self.shutdown.borrow() {
                Err(TransportError::Closed)
            } else if let Some(existing) = state.connections.get(&host.id) {
                Ok(Some(existing.clone()))
            } else {
                state.connections.insert(host.id.clone(), connection.clone());
                Ok(None)
            }
        };
        match registered {
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
            Ok(Some(existing)) => {
                connection.close().await;
                return Ok(existing);
            }
            Ok(None) => {}
        }

        info!(service = %self.name, host = %host.id, "connected");
        let reader = tokio::spawn(read_responses(
            Arc::downgrade(self),
            host.id.clone(),
            connection.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().push(reader);
        Ok(connection)
    }

    /// Forgets `connection` if it is still the one registered for `host` and
    /// requeues what was in flight on it.
    fn drop_connection(&self, host: &str, connection: &Arc<dyn Connection>) {
        let requeued = {
            let mut state = self.state.lock();
            let current = state
                .connections
                .get(host)
                .is_some_and(|c| Arc::ptr_eq(c, connection));
            if !current {
                return;
            }
            state.connections.remove(host);
            state.requeue_host(host)
        };
        warn!(service = %self.name, host, requeued, "connection lost");
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await });
        if requeued > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Stops every task and closes every connection.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let connections: Vec<Arc<dyn Connection>> = {
            let mut state = self.state.lock();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close().await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!(service = %self.name, "registry closed");
    }

    pub fn topology(&self) -> Arc<ServiceInfo> {
        self.state.lock().topology.clone()
    }

    /// Queued uuids of `handle` in delivery order.
    pub fn queued_uuids(&self, handle: &str) -> Vec<Uuid> {
        self.state
            .lock()
            .queues
            .get(handle)
            .map(HandleQueue::uuids)
            .unwrap_or_default()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queues.values().map(HandleQueue::len).sum()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Host the message was last sent to, while it is in flight.
    pub fn in_flight_host(&self, uuid: Uuid) -> Option<String> {
        self.state.lock().in_flight.get(&uuid).map(|f| f.host.clone())
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state.lock().connections.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Reader task of one connection.
async fn read_responses(
    registry: Weak<ServiceRegistry>,
    host: String,
    connection: Arc<dyn Connection>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            received = connection.recv(READ_IDLE) => received,
            _ = shutdown.wait_for(|closing| *closing) => return,
        };
        let Some(registry) = registry.upgrade() else {
            return;
        };

        match received {
            Ok(bytes) => match Frame::decode(&bytes) {
                Ok(Frame::Response {
                    uuid,
                    service,
                    handle,
                    payload,
                    signature,
                    identity,
                    error,
                }) => {
                    let _ = registry.events.send(RegistryEvent::Response(InboundResponse {
                        uuid,
                        path: MessagePath::new(service, handle),
                        payload,
                        signature,
                        identity,
                        error,
                        host: host.clone(),
                    }));
                }
                Ok(other) => debug!(%host, "ignoring frame {other:?}"),
                Err(e) => warn!(%host, "dropping malformed frame: {e}"),
            },
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                debug!(%host, "reader stopped: {e}");
                registry.drop_connection(&host, &connection);
                return;
            }
        }
    }
}
