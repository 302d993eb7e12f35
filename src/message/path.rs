use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical destination of a message: a service and one of its handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessagePath {
    pub service: String,
    pub handle: String,
}

impl MessagePath {
    pub fn new(service: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handle: handle.into(),
        }
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.handle)
    }
}
