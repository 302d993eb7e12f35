use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::{HandleInfo, HostInfo};
use crate::config::ServiceSettings;
use crate::transport::{Frame, Transport, TransportError};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("host unreachable: {0}")]
    Unreachable(#[from] TransportError),

    #[error("unexpected reply from {host}")]
    UnexpectedReply { host: String },
}

/// Source of hosts and of per-host health.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Hosts currently advertised for `service`.
    async fn list_hosts(&self, service: &str) -> Result<Vec<HostInfo>, DirectoryError>;

    /// Asks `host` which handles of `service` it serves. An error means the
    /// host did not answer.
    async fn ping(&self, host: &HostInfo, service: &str) -> Result<Vec<HandleInfo>, DirectoryError>;
}

/// Directory whose host lists come from configuration and whose pings are
/// `info` frames sent over the transport.
pub struct WsDirectory {
    transport: Arc<dyn Transport>,
    services: HashMap<String, ServiceSettings>,
    ping_timeout: Duration,
}

impl WsDirectory {
    pub fn new(
        transport: Arc<dyn Transport>,
        services: HashMap<String, ServiceSettings>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            services,
            ping_timeout,
        }
    }
}

#[async_trait]
impl Directory for WsDirectory {
    async fn list_hosts(&self, service: &str) -> Result<Vec<HostInfo>, DirectoryError> {
        Ok(self
            .services
            .get(service)
            .map(|s| s.hosts.iter().map(HostInfo::from_address).collect())
            .unwrap_or_default())
    }

    async fn ping(&self, host: &HostInfo, service: &str) -> Result<Vec<HandleInfo>, DirectoryError> {
        let connection = self.transport.connect(&host.address).await?;

        let reply = async {
            connection.send(Frame::Info.encode()?).await?;
            connection.recv(self.ping_timeout).await
        }
        .await;
        connection.close().await;

        match Frame::decode(&reply?)? {
            Frame::InfoResponse { services } => {
                let handles = services.get(service).cloned().unwrap_or_default();
                debug!(host = %host.id, service, handles = handles.len(), "ping answered");
                Ok(handles
                    .into_iter()
                    .map(|name| HandleInfo {
                        name,
                        endpoint: host.address.clone(),
                    })
                    .collect())
            }
            _ => Err(DirectoryError::UnexpectedReply {
                host: host.id.clone(),
            }),
        }
    }
}
