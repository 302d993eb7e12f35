use std::collections::VecDeque;
use std::time::Instant;

use uuid::Uuid;

use crate::message::Envelope;

/// A signed message waiting in, or borrowed from, a handle queue.
#[derive(Debug)]
pub struct Queued {
    pub envelope: Envelope,
    /// Position assigned on first enqueue; survives redistribution.
    pub seq: u64,
    /// Earliest instant of the next attempt, set by backoff.
    pub not_before: Option<Instant>,
}

impl Queued {
    pub fn uuid(&self) -> Uuid {
        self.envelope.message.uuid
    }

    pub fn is_urgent(&self) -> bool {
        self.envelope.message.policy.urgent
    }

    fn ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

/// Outbound queue of one handle.
///
/// Urgent messages always leave before non-urgent ones; inside each lane
/// messages leave by ascending sequence number. A message that is put back
/// keeps its sequence number and so lands where it was originally.
#[derive(Debug, Default)]
pub struct HandleQueue {
    urgent: VecDeque<Queued>,
    normal: VecDeque<Queued>,
}

impl HandleQueue {
    pub fn push(&mut self, item: Queued) {
        let lane = if item.is_urgent() {
            &mut self.urgent
        } else {
            &mut self.normal
        };
        let at = lane.partition_point(|q| q.seq < item.seq);
        lane.insert(at, item);
    }

    /// The next message in delivery order, if its backoff has elapsed.
    ///
    /// Head-of-line: a message still backing off holds back the ones behind it.
    pub fn peek_ready(&self, now: Instant) -> Option<&Queued> {
        self.front().filter(|q| q.ready(now))
    }

    pub fn front(&self) -> Option<&Queued> {
        self.urgent.front().or_else(|| self.normal.front())
    }

    pub fn pop_front(&mut self) -> Option<Queued> {
        self.urgent.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn remove(&mut self, uuid: Uuid) -> Option<Queued> {
        for lane in [&mut self.urgent, &mut self.normal] {
            if let Some(at) = lane.iter().position(|q| q.uuid() == uuid) {
                return lane.remove(at);
            }
        }
        None
    }

    /// Takes out every message for which `expired` holds.
    pub fn drain_where(&mut self, mut expired: impl FnMut(&Queued) -> bool) -> Vec<Queued> {
        let mut drained = Vec::new();
        for lane in [&mut self.urgent, &mut self.normal] {
            let mut kept = VecDeque::with_capacity(lane.len());
            for item in lane.drain(..) {
                if expired(&item) {
                    drained.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *lane = kept;
        }
        drained
    }

    /// Uuids in delivery order.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.urgent
            .iter()
            .chain(self.normal.iter())
            .map(Queued::uuid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
