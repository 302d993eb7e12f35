use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransportError;

/// Frames exchanged with a host.
///
/// Requests and responses both carry the (payload, signature, identity)
/// triple. `info` asks a host which services and handles it serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "request")]
    Request {
        uuid: Uuid,
        service: String,
        handle: String,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
        #[serde(with = "hex::serde")]
        signature: Vec<u8>,
        identity: String,
    },
    #[serde(rename = "response")]
    Response {
        uuid: Uuid,
        service: String,
        handle: String,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
        #[serde(with = "hex::serde")]
        signature: Vec<u8>,
        identity: String,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "info_response")]
    InfoResponse {
        /// Service name to the handles the host serves for it.
        services: BTreeMap<String, Vec<String>>,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Frame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Frame(e.to_string()))
    }
}
