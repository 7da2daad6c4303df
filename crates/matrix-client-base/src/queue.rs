// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::debug;

/// A client-generated transaction id, the idempotence key for `PUT send`.
///
/// Minted once when an event is enqueued and never regenerated on retry.
/// The timestamp component keeps ids unique across restarts where a fresh
/// random state might otherwise recur.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxnId(String);

impl TxnId {
    /// Mint a new transaction id from the current time and fresh randomness.
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self::from_parts(millis as u64, rand::random())
    }

    /// Build a transaction id from its two components.
    pub fn from_parts(millis: u64, random: u32) -> Self {
        TxnId(format!("{millis}{random}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event waiting to be sent to the homeserver.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    /// The transaction id identifying this send attempt.
    pub txn_id: TxnId,
    /// The type of the event, e.g. `m.room.message`.
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// The outbound event queue of a room.
///
/// Events retire in enqueue order through a single in-flight slot. A failed
/// send clears the slot but keeps the entry at the head of the queue, so
/// nothing is lost and the same transaction id is reused on the next
/// attempt.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<PendingEvent>,
    in_flight: bool,
}

impl EventQueue {
    /// Create a new, empty, queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the queue, minting its transaction id.
    pub fn enqueue(&mut self, event_type: &str, content: Value) -> TxnId {
        let txn_id = TxnId::new();
        debug!(event_type, txn_id = %txn_id, "enqueued event");
        self.queue.push_back(PendingEvent {
            txn_id: txn_id.clone(),
            event_type: event_type.to_owned(),
            content,
        });
        txn_id
    }

    /// Claim the head of the queue for sending.
    ///
    /// Returns `None` when the queue is empty or a send is already in
    /// flight. The entry stays queued until [`EventQueue::mark_sent`].
    pub fn begin_send(&mut self) -> Option<PendingEvent> {
        if self.in_flight {
            debug!("event send is already in progress");
            return None;
        }
        let event = self.queue.front()?.clone();
        self.in_flight = true;
        Some(event)
    }

    /// The in-flight send completed: pop the head and free the slot.
    pub fn mark_sent(&mut self) -> Option<PendingEvent> {
        self.in_flight = false;
        self.queue.pop_front()
    }

    /// The in-flight send failed: free the slot, keeping the head entry.
    pub fn mark_failed(&mut self) {
        self.in_flight = false;
    }

    /// True if any event is waiting or in flight.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued events, including one currently in flight.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drop all queued events. Used when the room is destroyed.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }
}
