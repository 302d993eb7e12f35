//! WebSocket transport
//!
//! Each [`WsConnection`] owns one client WebSocket split into a sink and a
//! stream, each behind its own async lock so a pending `recv` never blocks a
//! `send`. Frames travel as binary messages; text messages are accepted too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use super::{Connection, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] that dials `ws://<address>` (or the address as given when it
/// already carries a scheme).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

fn endpoint_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}")
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let url = endpoint_url(address);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        debug!(%url, "websocket connected");

        let (sink, stream) = ws_stream.split();
        Ok(Arc::new(WsConnection {
            address: address.to_string(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

pub struct WsConnection {
    address: String,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::binary(bytes))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stream = self.stream.lock().await;

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(TransportError::Timeout),
            };

            match next {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes.to_vec()),
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(WsMessage::Close(_))) => return Err(TransportError::Closed),
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(address = %self.address, "error while closing websocket: {e}");
        }
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("address", &self.address)
            .finish()
    }
}
