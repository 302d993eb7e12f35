//! Dispatch client
//!
//! Entry point of the engine. It owns:
//! - the [`SignatureStore`] used to sign requests and verify responses,
//! - the [`MessageCache`] holding outstanding persistent messages,
//! - the [`TopologyCollector`] and one [`ServiceRegistry`] per service,
//! - the callback table, keyed by message uuid.
//!
//! Registries report through one event channel; a single task consumes it,
//! so callbacks run one at a time and never under a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::CallbackTable;
use crate::config::Settings;
use crate::message::{
    Envelope, Message, MessagePath, MessagePolicy, ResponseCallback, ResponseData, ResponseInfo,
    ResponseStatus,
};
use crate::persistence::{CacheEntry, MessageCache, SledStore};
use crate::registry::{InboundResponse, RegistryEvent, ServiceRegistry};
use crate::security::SignatureStore;
use crate::topology::{Directory, TopologyCollector};
use crate::transport::Transport;
use crate::utils::{DealerError, Result};

pub struct DispatchClient {
    settings: Settings,
    signatures: Arc<SignatureStore>,
    cache: MessageCache,
    transport: Arc<dyn Transport>,
    collector: Arc<TopologyCollector>,
    registries: Mutex<HashMap<String, Arc<ServiceRegistry>>>,
    callbacks: Mutex<CallbackTable>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    recovered: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
}

impl DispatchClient {
    /// Loads the credential directory, opens the durable cache and starts the
    /// collector. Both failures are fatal.
    pub async fn start(
        settings: Settings,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
    ) -> Result<Arc<Self>> {
        let signatures = Arc::new(SignatureStore::load(&settings.security.keys_path)?);

        let cache = if settings.storage.disabled {
            warn!("durable storage disabled, persistent messages are delivered best-effort");
            MessageCache::transient()
        } else {
            let store = SledStore::open(&settings.storage.path)?;
            info!(path = %settings.storage.path, "message cache opened");
            MessageCache::new(Arc::new(store))
        };

        Ok(Self::start_with(settings, signatures, cache, transport, directory).await)
    }

    /// Starts a client on already-built parts.
    pub async fn start_with(
        settings: Settings,
        signatures: Arc<SignatureStore>,
        cache: MessageCache,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let collector = Arc::new(TopologyCollector::new(directory, settings.discovery.clone()));

        let client = Arc::new(Self {
            settings,
            signatures,
            cache,
            transport,
            collector: collector.clone(),
            registries: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(CallbackTable::default()),
            events,
            recovered: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            runtime: Handle::current(),
        });

        let dispatcher = {
            let mut shutdown = client.shutdown.subscribe();
            let client: Weak<Self> = Arc::downgrade(&client);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        event = events_rx.recv() => {
                            let Some(event) = event else { break };
                            let Some(client) = client.upgrade() else { break };
                            client.handle_event(event);
                        }
                        _ = shutdown.changed() => {
                            // registries are closed by now; apply what they left
                            let Some(client) = client.upgrade() else { break };
                            let mut drained = 0;
                            while let Ok(event) = events_rx.try_recv() {
                                client.handle_event(event);
                                drained += 1;
                            }
                            debug!(drained, "pending events applied");
                            break;
                        }
                    }
                }
                debug!("event dispatcher stopped");
            })
        };
        let polling = tokio::spawn(collector.run(client.shutdown.subscribe()));
        client.tasks.lock().extend([dispatcher, polling]);

        let mut configured: Vec<&String> = client.settings.services.keys().collect();
        configured.sort();
        for service in configured {
            client.registry_for(service);
        }

        info!(
            services = client.settings.services.len(),
            durable = client.cache.is_durable(),
            "dispatch client started"
        );
        client
    }

    /// Builds a message for `path`. Nothing is sent until [`send_message`].
    ///
    /// [`send_message`]: Self::send_message
    pub fn create_message(
        &self,
        data: impl Into<Vec<u8>>,
        path: MessagePath,
        policy: MessagePolicy,
    ) -> Message {
        Message::new(data.into(), path, policy)
    }

    /// Policy built from the `[delivery]` defaults.
    pub fn default_policy(&self) -> MessagePolicy {
        self.settings.delivery.default_policy()
    }

    /// Signs `message`, binds `callback` to it and hands it to its service's
    /// registry. Returns once the message is queued.
    pub fn send_message(&self, mut message: Message, callback: ResponseCallback) -> Result<Uuid> {
        let uuid = message.uuid;
        let path = message.path.clone();
        let identity = self.settings.identity_for(&path.service);

        let signature = self.signatures.sign(&message.payload, &identity)?;
        self.callbacks.lock().bind(uuid, path.clone(), callback)?;

        message.enqueue_time = Utc::now().timestamp_millis();
        if message.policy.persistent {
            if let Err(e) = self.cache.store(&CacheEntry::from(&message)) {
                error!(%uuid, %path, "cannot persist message: {e}");
                self.callbacks.lock().unbind(uuid, &path);
                return Err(e.into());
            }
        }

        debug!(%uuid, %path, urgent = message.policy.urgent, "message queued");
        self.registry_for(&path.service).enqueue(Envelope {
            message,
            identity,
            signature,
        });
        Ok(uuid)
    }

    /// Forgets the callback of `uuid`. The message itself keeps going; its
    /// response is dropped when it arrives.
    pub fn unset_response_callback(&self, uuid: Uuid, path: &MessagePath) -> bool {
        let mut callbacks = self.callbacks.lock();
        let removed = callbacks.unbind(uuid, path);
        if removed {
            callbacks.finish(uuid, path);
            debug!(%uuid, %path, "response callback unset");
        }
        removed
    }

    /// Re-enqueues every message found in the durable cache. Only the first
    /// call does anything; later calls return 0.
    pub fn recover(&self) -> Result<usize> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let entries = self.cache.restore()?;
        let mut restored = 0;
        for entry in entries {
            let message = Message::from(entry);
            let identity = self.settings.identity_for(&message.path.service);
            let signature = match self.signatures.sign(&message.payload, &identity) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!(uuid = %message.uuid, path = %message.path, "cannot re-sign cached message: {e}");
                    continue;
                }
            };
            let registry = self.registry_for(&message.path.service);
            registry.enqueue(Envelope {
                message,
                identity,
                signature,
            });
            restored += 1;
        }

        info!(restored, "cached messages recovered");
        Ok(restored)
    }

    /// Registry of `service`, created and tracked on first use.
    fn registry_for(&self, service: &str) -> Arc<ServiceRegistry> {
        let mut registries = self.registries.lock();
        if let Some(registry) = registries.get(service) {
            return registry.clone();
        }

        let registry = ServiceRegistry::new(
            service,
            self.transport.clone(),
            self.settings.delivery.clone(),
            self.events.clone(),
        );
        let (topology_tx, topology_rx) = mpsc::unbounded_channel();
        {
            let _runtime = self.runtime.enter();
            registry.spawn(topology_rx);
        }
        self.collector.track(service, topology_tx);
        registries.insert(service.to_string(), registry.clone());

        info!(service, "service registry created");
        registry
    }

    pub fn registry(&self, service: &str) -> Result<Arc<ServiceRegistry>> {
        self.registries
            .lock()
            .get(service)
            .cloned()
            .ok_or_else(|| DealerError::UnknownService(service.to_string()))
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn collector(&self) -> &TopologyCollector {
        &self.collector
    }

    /// Number of callbacks still waiting for a result.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    #[cfg(test)]
    pub(super) fn events(&self) -> mpsc::UnboundedSender<RegistryEvent> {
        self.events.clone()
    }

    fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Response(response) => self.handle_response(response),
            RegistryEvent::Exhausted {
                uuid,
                path,
                attempts,
                reason,
            } => {
                self.forget(uuid);
                let error = DealerError::DeliveryExhausted { uuid, attempts };
                self.report(
                    uuid,
                    path,
                    ResponseData::default(),
                    None,
                    Duration::ZERO,
                    ResponseStatus::DeliveryExhausted,
                    Some(format!("{error}: {reason}")),
                );
            }
            RegistryEvent::Expired {
                uuid,
                path,
                elapsed_ms,
            } => {
                self.forget(uuid);
                let error = DealerError::Expired { uuid, elapsed_ms };
                self.report(
                    uuid,
                    path,
                    ResponseData::default(),
                    None,
                    Duration::ZERO,
                    ResponseStatus::Expired,
                    Some(error.to_string()),
                );
            }
            RegistryEvent::Attempted(entry) => {
                if let Err(e) = self.cache.store(&entry) {
                    warn!(uuid = %entry.uuid, "cannot update cached attempt count: {e}");
                }
            }
        }
    }

    fn handle_response(&self, response: InboundResponse) {
        let InboundResponse {
            uuid,
            path,
            payload,
            signature,
            identity,
            error,
            host,
        } = response;

        if let Err(e) = self.signatures.verify(&payload, &signature, &identity) {
            warn!(%uuid, %path, %host, "discarding response: {e}");
            return;
        }

        let bound = self.callbacks.lock().path_of(uuid);
        if let Some(bound) = bound.filter(|bound| *bound != path) {
            warn!(%uuid, %path, %bound, %host, "discarding response for another path");
            return;
        }

        let Ok(registry) = self.registry(&path.service) else {
            debug!(%uuid, %path, "response for a service without registry");
            return;
        };
        let Some(ack) = registry.acknowledge(uuid, &path) else {
            debug!(%uuid, %path, %host, "late or duplicate response dropped");
            return;
        };

        self.forget(uuid);
        let status = if error.is_some() {
            ResponseStatus::Failed
        } else {
            ResponseStatus::Success
        };
        self.report(
            uuid,
            path,
            ResponseData { payload },
            Some(ack.host.unwrap_or(host)),
            ack.latency,
            status,
            error,
        );
    }

    /// Drops the cache entry of a finished message.
    fn forget(&self, uuid: Uuid) {
        if let Err(e) = self.cache.remove(uuid) {
            warn!(%uuid, "cannot remove cache entry: {e}");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        uuid: Uuid,
        path: MessagePath,
        data: ResponseData,
        host: Option<String>,
        latency: Duration,
        status: ResponseStatus,
        error: Option<String>,
    ) {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            let callback = callbacks.take(uuid, &path);
            callbacks.finish(uuid, &path);
            callback
        };
        let Some(callback) = callback else {
            debug!(%uuid, %path, ?status, "no callback bound, result dropped");
            return;
        };

        callback(
            data,
            ResponseInfo {
                uuid,
                path,
                host,
                latency,
                status,
                error,
            },
        );
    }

    /// Stops every task, closes every connection and flushes the cache.
    ///
    /// Registries stop first so no event is produced after the dispatcher
    /// drained its channel; cache writes those events carry land before the
    /// flush.
    pub async fn shutdown(&self) {
        let registries: Vec<Arc<ServiceRegistry>> =
            self.registries.lock().values().cloned().collect();
        for registry in registries {
            registry.close().await;
        }

        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        if let Err(e) = self.cache.flush() {
            error!("cache flush failed: {e}");
        }
        info!("dispatch client stopped");
    }
}

impl std::fmt::Debug for DispatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchClient")
            .field("signatures", &self.signatures)
            .field("cache", &self.cache)
            .field("registries", &self.registries.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
