//! In-memory transport used by unit tests.
//!
//! Every address maps to a [`MockHost`]. A host records the frames it
//! receives, can be told to refuse connections or fail the next N sends, and
//! answers through an optional responder closure. Replies go back on the
//! connection that carried the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connection, Frame, Transport, TransportError};
use crate::security::SignatureStore;

pub(crate) type Responder = Box<dyn Fn(&Frame) -> Option<Frame> + Send + Sync>;

pub(crate) struct MockHost {
    pub address: String,
    received: Mutex<Vec<Frame>>,
    reachable: AtomicBool,
    failing_sends: AtomicUsize,
    responder: Mutex<Option<Responder>>,
    connections: Mutex<HashMap<usize, mpsc::UnboundedSender<Vec<u8>>>>,
    next_connection: AtomicUsize,
}

impl MockHost {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            received: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            failing_sends: AtomicUsize::new(0),
            responder: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicUsize::new(0),
        }
    }

    fn open(self: &Arc<Self>) -> MockConnection {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().insert(id, tx);
        MockConnection {
            id,
            host: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn respond_with(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    /// Pushes a frame to every open connection.
    pub fn push(&self, frame: &Frame) {
        let bytes = frame.encode().unwrap();
        for tx in self.connections.lock().values() {
            let _ = tx.send(bytes.clone());
        }
    }

    /// Drops every open connection; pending and future reads see `Closed`.
    pub fn disconnect(&self) {
        self.connections.lock().clear();
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().clone()
    }

    /// Uuids of the requests this host accepted, in arrival order.
    pub fn request_uuids(&self) -> Vec<uuid::Uuid> {
        self.received
            .lock()
            .iter()
            .filter_map(|f| match f {
                Frame::Request { uuid, .. } => Some(*uuid),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    hosts: Mutex<HashMap<String, Arc<MockHost>>>,
}

impl MockTransport {
    pub fn host(&self, address: &str) -> Arc<MockHost> {
        self.hosts
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MockHost::new(address)))
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let host = self.host(address);
        if !host.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "unreachable".to_string(),
            });
        }
        Ok(Arc::new(host.open()))
    }
}

struct MockConnection {
    id: usize,
    host: Arc<MockHost>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.host.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Send("unreachable".to_string()));
        }
        if !self.host.connections.lock().contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        let failing = self
            .host
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Send("simulated failure".to_string()));
        }

        let frame = Frame::decode(&bytes)?;
        let reply = self
            .host
            .responder
            .lock()
            .as_ref()
            .and_then(|respond| respond(&frame));
        self.host.received.lock().push(frame);
        if let Some(reply) = reply {
            if let Some(tx) = self.host.connections.lock().get(&self.id) {
                let _ = tx.send(reply.encode()?);
            }
        }
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) {
        self.host.connections.lock().remove(&self.id);
    }
}

/// Responder that serves `handles` of `service` for info requests and echoes
/// request payloads back, signed as `identity`.
pub(crate) fn echo_responder(
    signatures: Arc<SignatureStore>,
    identity: &str,
    service: &str,
    handles: &[&str],
) -> Responder {
    let identity = identity.to_string();
    let service = service.to_string();
    let handles: Vec<String> = handles.iter().map(|h| h.to_string()).collect();

    Box::new(move |frame| match frame {
        Frame::Info => Some(Frame::InfoResponse {
            services: [(service.clone(), handles.clone())].into_iter().collect(),
        }),
        Frame::Request {
            uuid,
            service,
            handle,
            payload,
            ..
        } => Some(Frame::Response {
            uuid: *uuid,
            service: service.clone(),
            handle: handle.clone(),
            payload: payload.clone(),
            signature: signatures.sign(payload, &identity).unwrap(),
            identity: identity.clone(),
            error: None,
        }),
        _ => None,
    })
}
