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

//! The wire model of a `/sync` response.
//!
//! Only the envelope is typed. Individual events stay raw [`Value`]s so a
//! malformed event can be dropped with a warning while the rest of the
//! batch is applied.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// The body of a `/sync` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncResponse {
    /// The token to supply in the `since` parameter of the next sync.
    ///
    /// A response without one cannot be applied safely and is treated as
    /// fatal by the sync engine.
    pub next_batch: Option<String>,
    /// Updates to rooms, keyed by membership bucket.
    #[serde(default)]
    pub rooms: Rooms,
    /// Device-to-device messages addressed to this device.
    #[serde(default)]
    pub to_device: ToDevice,
    /// The number of unclaimed one-time keys held by the server, per key
    /// algorithm.
    #[serde(default)]
    pub device_one_time_keys_count: HashMap<String, u64>,
}

/// The room buckets of a sync response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Rooms {
    /// Rooms the user is joined to.
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
    /// Rooms the user has been invited to.
    #[serde(default)]
    pub invite: HashMap<String, InvitedRoom>,
    /// Rooms the user has left. Currently unused beyond parsing.
    #[serde(default)]
    pub leave: HashMap<String, Value>,
}

/// The delta for a single joined room.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JoinedRoom {
    /// State events bringing the room state up to the start of the
    /// timeline.
    #[serde(default)]
    pub state: EventList,
    /// The timeline slice of this batch.
    #[serde(default)]
    pub timeline: EventList,
    /// Ephemeral events, e.g. typing notifications.
    #[serde(default)]
    pub ephemeral: EventList,
}

/// The stripped state of a room we have been invited to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvitedRoom {
    /// The stripped state events describing the invitation.
    #[serde(default)]
    pub invite_state: EventList,
}

/// A list of raw events.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventList {
    /// The events themselves.
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Device-to-device messages of a sync response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ToDevice {
    /// The raw to-device events.
    #[serde(default)]
    pub events: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SyncResponse;

    #[test]
    fn minimal_response_parses_with_defaults() {
        let response: SyncResponse =
            serde_json::from_value(json!({ "next_batch": "s72595_4483_1934" })).unwrap();

        assert_eq!(response.next_batch.as_deref(), Some("s72595_4483_1934"));
        assert!(response.rooms.join.is_empty());
        assert!(response.to_device.events.is_empty());
        assert!(response.device_one_time_keys_count.is_empty());
    }

    #[test]
    fn joined_room_events_stay_raw() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [ { "type": "m.room.name" } ] },
                "timeline": { "events": [ 42 ] },
            }}},
        }))
        .unwrap();

        let room = &response.rooms.join["!r:h"];
        assert_eq!(room.state.events.len(), 1);
        assert_eq!(room.timeline.events[0], 42);
    }
}
