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

use serde_json::{Map, Value};

/// A borrowing view over a raw JSON event from a `/sync` response.
///
/// Events inside a sync batch are kept as dynamic JSON: a malformed event
/// must only invalidate itself, not the batch it arrived in. Every accessor
/// returns `None` when the member is absent *or* has the wrong type, so
/// callers can drop-and-warn instead of failing.
#[derive(Clone, Copy, Debug)]
pub struct RawEvent<'a>(pub &'a Value);

impl<'a> RawEvent<'a> {
    /// The `type` of the event.
    pub fn event_type(&self) -> Option<&'a str> {
        self.string("type")
    }

    /// The `state_key`, present exactly on state events.
    pub fn state_key(&self) -> Option<&'a str> {
        self.string("state_key")
    }

    /// The user id of the event sender.
    pub fn sender(&self) -> Option<&'a str> {
        self.string("sender")
    }

    /// The event id assigned by the server.
    pub fn event_id(&self) -> Option<&'a str> {
        self.string("event_id")
    }

    /// The server-side timestamp, in milliseconds.
    pub fn origin_server_ts(&self) -> Option<i64> {
        self.0.get("origin_server_ts")?.as_i64()
    }

    /// The `content` object of the event.
    pub fn content(&self) -> Option<&'a Map<String, Value>> {
        self.0.get("content")?.as_object()
    }

    /// The client-generated transaction id, reflected by the server under
    /// `unsigned` for events this session sent itself.
    pub fn transaction_id(&self) -> Option<&'a str> {
        self.0.get("unsigned")?.get("transaction_id")?.as_str()
    }

    /// A string member of the `content` object.
    pub fn content_string(&self, key: &str) -> Option<&'a str> {
        self.content()?.get(key)?.as_str()
    }

    fn string(&self, key: &str) -> Option<&'a str> {
        self.0.get(key)?.as_str()
    }
}

/// A plain-text message taken from a room timeline, ready to hand to the
/// application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimelineMessage {
    /// The user id of the sender.
    pub sender: String,
    /// The sender's displayname as currently known to the member table,
    /// falling back to the user id.
    pub sender_display: String,
    /// The `content.body` of the message.
    pub body: String,
    /// `origin_server_ts` converted to seconds.
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RawEvent;

    #[test]
    fn accessors_tolerate_missing_and_mistyped_members() {
        let event = json!({
            "type": "m.room.message",
            "state_key": 5,
            "content": { "body": "hi", "msgtype": "m.text" },
            "origin_server_ts": 1_700_000_000_000u64,
        });
        let event = RawEvent(&event);

        assert_eq!(event.event_type(), Some("m.room.message"));
        assert_eq!(event.state_key(), None);
        assert_eq!(event.sender(), None);
        assert_eq!(event.origin_server_ts(), Some(1_700_000_000_000));
        assert_eq!(event.content_string("body"), Some("hi"));
        assert_eq!(event.content_string("formatted_body"), None);
        assert_eq!(event.transaction_id(), None);
    }

    #[test]
    fn transaction_id_is_read_from_unsigned() {
        let event = json!({
            "type": "m.room.message",
            "content": { "body": "hello" },
            "unsigned": { "transaction_id": "1700000000000123456" },
        });

        assert_eq!(
            RawEvent(&event).transaction_id(),
            Some("1700000000000123456")
        );
    }
}
