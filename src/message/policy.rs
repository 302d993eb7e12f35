use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-message delivery policy, fixed when the message is created.
///
/// - `persistent`: keep the message in the durable cache until acknowledged
/// - `timeout`: overall deadline measured from enqueue time; `None` never expires
/// - `max_retries`: failed attempts tolerated after the first; `None` is unbounded
/// - `urgent`: jump ahead of every non-urgent message queued for the same handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePolicy {
    pub persistent: bool,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub urgent: bool,
}

impl MessagePolicy {
    /// True once `attempts` failed deliveries use up the retry budget.
    pub fn retries_exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts > max)
    }

    /// True when a message enqueued at `enqueue_time` (ms) is past its
    /// deadline at `now` (ms).
    pub fn expired(&self, enqueue_time: i64, now: i64) -> bool {
        self.timeout
            .is_some_and(|t| now.saturating_sub(enqueue_time) >= t.as_millis() as i64)
    }
}
