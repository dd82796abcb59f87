//! Per-task sequencing
//!
//! Every envelope carries a sequence number scoped to its lane (the task id,
//! or the health lane). Lanes are independent. A receiver accepts only
//! numbers strictly above the last one it saw on that lane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::message::ControlMessage;

/// A message with its lane sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub message: ControlMessage,
}

/// Assigns outgoing sequence numbers, starting at 1 per lane.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: HashMap<String, u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seal(&mut self, message: ControlMessage) -> Envelope {
        let counter = self.next.entry(message.lane().to_string()).or_insert(0);
        *counter += 1;
        Envelope {
            seq: *counter,
            message,
        }
    }

    /// Drop the counter of a finished task.
    pub fn forget(&mut self, lane: &str) {
        self.next.remove(lane);
    }
}

/// Whether an incoming envelope should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Sequence number at or below the last accepted one on the lane
    Stale { last_seen: u64 },
}

/// Rejects stale and duplicate envelopes per lane. Gaps are accepted.
#[derive(Debug, Default)]
pub struct OrderingGuard {
    last_seen: HashMap<String, u64>,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, envelope: &Envelope) -> Admission {
        let lane = envelope.message.lane();
        match self.last_seen.get(lane) {
            Some(&last_seen) if envelope.seq <= last_seen => Admission::Stale { last_seen },
            _ => {
                self.last_seen.insert(lane.to_string(), envelope.seq);
                Admission::Accept
            }
        }
    }

    pub fn forget(&mut self, lane: &str) {
        self.last_seen.remove(lane);
    }
}
