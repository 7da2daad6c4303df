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

use vodozemac::megolm::{InboundGroupSession, InboundGroupSessionPickle};
use vodozemac::olm::{OlmMessage, SessionPickle};

use crate::error::Result;

/// A pairwise Olm session with another device.
pub struct Session {
    inner: vodozemac::olm::Session,
    /// The curve25519 key of the device we share this session with.
    pub sender_key: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(inner: vodozemac::olm::Session, sender_key: String) -> Self {
        Session { inner, sender_key }
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Decrypt the given Olm message, advancing the ratchet.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<Vec<u8>> {
        Ok(self.inner.decrypt(message)?)
    }

    /// Store the session as an encrypted base64 pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Restore a session from an encrypted pickle.
    pub fn from_pickle(ciphertext: &str, pickle_key: &[u8; 32], sender_key: String) -> Result<Self> {
        let pickle = SessionPickle::from_encrypted(ciphertext, pickle_key)?;
        Ok(Session { inner: vodozemac::olm::Session::from_pickle(pickle), sender_key })
    }
}

/// The identity of an inbound Megolm session.
///
/// Room keys arrive over pairwise Olm sessions; the tuple of the sending
/// device's curve25519 key, user id, the Megolm session id and the sending
/// device id identifies the session a future timeline event will name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InboundGroupSessionKey {
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The user id of the sender.
    pub sender_id: String,
    /// The Megolm session id.
    pub session_id: String,
    /// The device id of the sending device.
    pub device_id: String,
}

/// Room-local storage for inbound Megolm sessions.
///
/// Future timeline decryption looks sessions up here; this crate only fills
/// the table from incoming `m.room_key` events.
#[derive(Default)]
pub struct GroupSessionIndex {
    rooms: HashMap<String, HashMap<InboundGroupSessionKey, InboundGroupSession>>,
}

impl std::fmt::Debug for GroupSessionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionIndex")
            .field(
                "rooms",
                &self
                    .rooms
                    .iter()
                    .map(|(room_id, sessions)| {
                        (room_id.clone(), sessions.keys().cloned().collect::<Vec<_>>())
                    })
                    .collect::<HashMap<_, _>>(),
            )
            .finish()
    }
}

impl GroupSessionIndex {
    /// Create a new, empty, index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session for the given room and key.
    pub fn get(
        &self,
        room_id: &str,
        key: &InboundGroupSessionKey,
    ) -> Option<&InboundGroupSession> {
        self.rooms.get(room_id)?.get(key)
    }

    /// Install a session for the given room.
    pub fn insert(
        &mut self,
        room_id: &str,
        key: InboundGroupSessionKey,
        session: InboundGroupSession,
    ) {
        self.rooms.entry(room_id.to_owned()).or_default().insert(key, session);
    }

    /// The number of sessions known for the given room.
    pub fn len(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, HashMap::len)
    }
}

/// Pickle an inbound group session with the given key.
pub(crate) fn pickle_group_session(
    session: &InboundGroupSession,
    pickle_key: &[u8; 32],
) -> String {
    session.pickle().encrypt(pickle_key)
}

/// Restore an inbound group session from an encrypted pickle.
pub(crate) fn unpickle_group_session(
    ciphertext: &str,
    pickle_key: &[u8; 32],
) -> Result<InboundGroupSession> {
    let pickle = InboundGroupSessionPickle::from_encrypted(ciphertext, pickle_key)?;
    Ok(InboundGroupSession::from_pickle(pickle))
}
