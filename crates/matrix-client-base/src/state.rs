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

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::event::RawEvent;

/// A single entry in the state table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEvent {
    /// The event type, e.g. `m.room.member`.
    pub event_type: String,
    /// The state key. The empty string for most room-wide events, a user id
    /// for membership events.
    pub state_key: String,
    /// The sender of the event, if known.
    pub sender: Option<String>,
    /// The server-assigned event id, if known.
    pub event_id: Option<String>,
    /// The `content` of the event.
    pub content: Value,
}

/// The current state of a room: a map from event type to a map from state
/// key to the latest event seen for that `(type, state_key)` pair.
///
/// Later events with the same identity replace earlier ones.
#[derive(Clone, Debug, Default)]
pub struct StateTable {
    events: HashMap<String, HashMap<String, StateEvent>>,
}

impl StateTable {
    /// Create a new, empty, state table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a particular bit of state.
    ///
    /// Returns `None` if this `(type, state_key)` pair is not known.
    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&StateEvent> {
        self.events.get(event_type)?.get(state_key)
    }

    /// Apply a state event to the table.
    ///
    /// Events missing any of `type`, `state_key` or `content` are dropped
    /// with a warning. On success, the replaced entry (if any) is returned
    /// together with a reference to the newly installed one, so observers
    /// can diff the transition.
    pub fn update(&mut self, raw: &Value) -> Option<(Option<StateEvent>, &StateEvent)> {
        let event = RawEvent(raw);

        let (Some(event_type), Some(state_key), Some(content)) = (
            event.event_type(),
            event.state_key(),
            raw.get("content").filter(|c| c.is_object()),
        ) else {
            warn!("state event missing type, state_key or content, dropping");
            return None;
        };

        let new_event = StateEvent {
            event_type: event_type.to_owned(),
            state_key: state_key.to_owned(),
            sender: event.sender().map(ToOwned::to_owned),
            event_id: event.event_id().map(ToOwned::to_owned),
            content: content.clone(),
        };

        let entry = self.events.entry(event_type.to_owned()).or_default();
        let old_event = entry.insert(state_key.to_owned(), new_event);
        let new_event = &entry[state_key];

        Some((old_event, new_event))
    }

    /// Iterate over all events of the given type.
    pub fn events_of_type(&self, event_type: &str) -> impl Iterator<Item = &StateEvent> {
        self.events.get(event_type).into_iter().flatten().map(|(_, e)| e)
    }

    /// The official name or an alias of the room, if the table contains one.
    ///
    /// This looks at `m.room.name` first and falls back to the first entry
    /// of any `m.room.aliases` event. It is used to label rooms we are not
    /// joined to, such as invitations, where only a stripped state is
    /// available.
    pub fn room_alias(&self) -> Option<String> {
        if let Some(event) = self.get("m.room.name", "") {
            if let Some(name) = event.content.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    return Some(name.to_owned());
                }
            }
        }

        for event in self.events_of_type("m.room.aliases") {
            let alias = event
                .content
                .get("aliases")
                .and_then(Value::as_array)
                .and_then(|aliases| aliases.first())
                .and_then(Value::as_str);
            if let Some(alias) = alias {
                return Some(alias.to_owned());
            }
        }

        None
    }
}
