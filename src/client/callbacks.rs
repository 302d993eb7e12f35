use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::message::{MessagePath, ResponseCallback};
use crate::utils::{DealerError, Result};

/// Reported uuids remembered for duplicate detection.
pub const REPORTED_CAPACITY: usize = 65_536;

/// Response callbacks keyed by message uuid.
///
/// A uuid can be bound once. After its result was handed out (`take`) the
/// uuid stays reserved, so a message can never be reported twice. Only the
/// last [`REPORTED_CAPACITY`] reported uuids are kept; older ones are
/// forgotten oldest first.
pub struct CallbackTable {
    bound: HashMap<Uuid, (MessagePath, ResponseCallback)>,
    reported: HashSet<Uuid>,
    reported_order: VecDeque<Uuid>,
    capacity: usize,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::with_capacity(REPORTED_CAPACITY)
    }
}

impl CallbackTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bound: HashMap::new(),
            reported: HashSet::new(),
            reported_order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn bind(&mut self, uuid: Uuid, path: MessagePath, callback: ResponseCallback) -> Result<()> {
        if self.bound.contains_key(&uuid) || self.reported.contains(&uuid) {
            return Err(DealerError::DuplicateMessage(uuid));
        }
        self.bound.insert(uuid, (path, callback));
        Ok(())
    }

    /// Drops the binding when it was made for `path`. Returns whether one was
    /// removed.
    pub fn unbind(&mut self, uuid: Uuid, path: &MessagePath) -> bool {
        match self.bound.get(&uuid) {
            Some((bound, _)) if bound == path => {
                self.bound.remove(&uuid);
                true
            }
            _ => false,
        }
    }

    /// Path the callback of `uuid` was bound for.
    pub fn path_of(&self, uuid: Uuid) -> Option<MessagePath> {
        self.bound.get(&uuid).map(|(path, _)| path.clone())
    }

    /// Removes and returns the callback for (`uuid`, `path`) and marks the
    /// uuid as reported.
    pub fn take(&mut self, uuid: Uuid, path: &MessagePath) -> Option<ResponseCallback> {
        match self.bound.get(&uuid) {
            Some((bound, _)) if bound == path => {
                self.mark_reported(uuid);
                self.bound.remove(&uuid).map(|(_, callback)| callback)
            }
            _ => None,
        }
    }

    /// Marks `uuid` as finished on `path`. A callback bound for another path
    /// is left alone.
    pub fn finish(&mut self, uuid: Uuid, path: &MessagePath) {
        if self.bound.get(&uuid).is_some_and(|(bound, _)| bound != path) {
            return;
        }
        self.bound.remove(&uuid);
        self.mark_reported(uuid);
    }

    fn mark_reported(&mut self, uuid: Uuid) {
        if !self.reported.insert(uuid) {
            return;
        }
        self.reported_order.push_back(uuid);
        while self.reported_order.len() > self.capacity {
            if let Some(oldest) = self.reported_order.pop_front() {
                self.reported.remove(&oldest);
            }
        }
    }

    pub fn is_bound(&self, uuid: Uuid) -> bool {
        self.bound.contains_key(&uuid)
    }

    pub fn is_reported(&self, uuid: Uuid) -> bool {
        self.reported.contains(&uuid)
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("bound", &self.bound.len())
            .field("reported", &self.reported.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
