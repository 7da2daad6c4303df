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

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{RawEvent, TimelineMessage};
use crate::members::MemberTable;
use crate::queue::EventQueue;
use crate::state::StateTable;

/// A Matrix room the user is joined to.
///
/// Every joined room owns exactly one state table, one member table and one
/// outbound event queue.
#[derive(Clone, Debug)]
pub struct Room {
    /// The unique id of the room.
    pub room_id: String,
    /// The mxid of our own user.
    pub own_user_id: String,
    /// The keyed state-event table of the room.
    pub state: StateTable,
    /// The membership mirror of the room.
    pub members: MemberTable,
    /// The outbound event queue of the room.
    pub queue: EventQueue,
    just_created: bool,
    reported_name: Option<String>,
}

impl Room {
    /// Create a new room.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The unique id of the room.
    ///
    /// * `own_user_id` - The mxid of our own user.
    pub fn new(room_id: &str, own_user_id: &str) -> Self {
        Room {
            room_id: room_id.to_owned(),
            own_user_id: own_user_id.to_owned(),
            state: StateTable::new(),
            members: MemberTable::new(),
            queue: EventQueue::new(),
            just_created: true,
            reported_name: None,
        }
    }

    /// True until the first batch of state for this room has been applied.
    ///
    /// Used to suppress arrival announcements while a room is initially
    /// populated.
    pub fn is_initial_sync(&self) -> bool {
        self.just_created
    }

    /// Mark the initial batch of state as applied.
    pub fn complete_initial_sync(&mut self) {
        self.just_created = false;
    }

    /// Apply a state event to the room.
    ///
    /// Membership events are mirrored into the member table; the resulting
    /// diffs are picked up by the caller once the batch is complete.
    pub fn receive_state_event(&mut self, raw: &Value) {
        let Some((_old, new)) = self.state.update(raw) else {
            return;
        };

        if new.event_type == "m.room.member" {
            let state_key = new.state_key.clone();
            let content = new.content.clone();
            self.members.update_member(&state_key, &content);
        }
    }

    /// Apply a timeline event to the room.
    ///
    /// Events carrying a `state_key` are routed through the state table.
    /// `m.room.message` events become a [`TimelineMessage`], unless they are
    /// a remote echo of one of our own sends: the homeserver reflects the
    /// transaction id only to the session that submitted the event, so the
    /// presence of `unsigned.transaction_id` identifies our echoes.
    pub fn receive_timeline_event(&mut self, raw: &Value) -> Option<TimelineMessage> {
        let event = RawEvent(raw);

        if event.state_key().is_some() {
            self.receive_state_event(raw);
            return None;
        }

        let event_type = event.event_type()?;
        if event_type != "m.room.message" {
            debug!(room_id = %self.room_id, event_type, "ignoring unknown room event");
            return None;
        }

        let Some(body) = event.content_string("body") else {
            warn!(room_id = %self.room_id, "no body in message event");
            return None;
        };

        if event.transaction_id().is_some() {
            debug!(room_id = %self.room_id, "got remote echo");
            return None;
        }

        let sender = event.sender().unwrap_or("<unknown>");
        Some(TimelineMessage {
            sender: sender.to_owned(),
            sender_display: self.members.displayname_for(sender),
            body: body.to_owned(),
            ts: event.origin_server_ts().unwrap_or(0) / 1000,
        })
    }

    /// Calculate the display name of the room.
    ///
    /// The official `m.room.name` wins, then any `m.room.aliases` entry,
    /// then a heuristic over the active members excluding ourselves.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.state.room_alias() {
            return name;
        }
        self.name_from_members()
    }

    /// Recompute the display name, returning it if it differs from the one
    /// last handed out by this method.
    pub fn updated_name(&mut self) -> Option<String> {
        let name = self.display_name();
        if self.reported_name.as_deref() == Some(&name) {
            return None;
        }
        self.reported_name = Some(name.clone());
        Some(name)
    }

    fn name_from_members(&self) -> String {
        let mut others: Vec<String> = self
            .members
            .active_members()
            .into_iter()
            .filter(|user_id| *user_id != self.own_user_id)
            .map(|user_id| self.members.displayname_for(user_id))
            .collect();
        // Stabilize ordering across the hash map.
        others.sort();

        match others.len() {
            // Nobody else here. Self-chat or an invitation.
            0 => "invitation".to_owned(),
            1 => others.remove(0),
            2 => format!("{} and {}", others[0], others[1]),
            n => format!("{} and {} others", others[0], n),
        }
    }
}
