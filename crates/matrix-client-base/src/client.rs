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
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::emitter::{EventEmitter, NullEmitter};
use crate::room::Room;
use crate::session::Session;
use crate::state::StateTable;
use crate::sync::{InvitedRoom, SyncResponse};

/// A no-IO client implementation.
///
/// The `BaseClient` is a state machine that receives responses and events
/// and accordingly updates its state. It never talks to a homeserver
/// itself; the `matrix-client` crate feeds it and reacts to what it
/// observes.
pub struct BaseClient {
    /// The current session containing our user id, device id and access
    /// token.
    session: RwLock<Option<Session>>,
    /// The sync token to use for the next sync call.
    sync_token: RwLock<Option<String>>,
    /// The rooms our user is joined to.
    joined_rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    /// The application's callbacks.
    emitter: RwLock<Arc<dyn EventEmitter>>,
}

impl std::fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseClient").finish_non_exhaustive()
    }
}

impl Default for BaseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseClient {
    /// Create a new client with no session.
    pub fn new() -> Self {
        BaseClient {
            session: RwLock::new(None),
            sync_token: RwLock::new(None),
            joined_rooms: RwLock::new(HashMap::new()),
            emitter: RwLock::new(Arc::new(NullEmitter)),
        }
    }

    /// Install the application's [`EventEmitter`].
    pub async fn set_event_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.emitter.write().await = emitter;
    }

    /// The currently installed emitter.
    pub async fn emitter(&self) -> Arc<dyn EventEmitter> {
        self.emitter.read().await.clone()
    }

    /// Is the client logged in.
    pub async fn logged_in(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// The current session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Install a session, either restored from storage or fresh from a
    /// login response.
    pub async fn restore_session(&self, session: Session) {
        *self.session.write().await = Some(session);
    }

    /// The sync token of the last applied response.
    pub async fn sync_token(&self) -> Option<String> {
        self.sync_token.read().await.clone()
    }

    /// Seed the sync token from storage before the first sync.
    pub async fn set_sync_token(&self, token: Option<String>) {
        *self.sync_token.write().await = token;
    }

    /// A handle to a joined room.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.joined_rooms.read().await.get(room_id).cloned()
    }

    /// The ids of all rooms currently held in memory.
    pub async fn joined_room_ids(&self) -> Vec<String> {
        self.joined_rooms.read().await.keys().cloned().collect()
    }

    /// True if any joined room is held in memory.
    ///
    /// Used as the "the UI already exhibits active conversations" signal
    /// when deciding whether an initial full-state sync is needed.
    pub async fn has_rooms(&self) -> bool {
        !self.joined_rooms.read().await.is_empty()
    }

    async fn get_or_create_room(&self, room_id: &str) -> Arc<Mutex<Room>> {
        let user_id = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
            .unwrap_or_default();

        let room = {
            let mut rooms = self.joined_rooms.write().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
            info!(room_id, "new room");
            let room = Arc::new(Mutex::new(Room::new(room_id, &user_id)));
            rooms.insert(room_id.to_owned(), room.clone());
            room
        };

        self.emitter().await.on_room_created(room_id).await;
        room
    }

    /// Forget a room, draining its outbound queue. Called when the user
    /// leaves.
    pub async fn forget_room(&self, room_id: &str) {
        let room = self.joined_rooms.write().await.remove(room_id);
        if let Some(room) = room {
            let mut room = room.lock().await;
            if !room.queue.is_empty() {
                debug!(room_id, pending = room.queue.len(), "dropping queued events");
            }
            room.queue.clear();
        }
    }

    /// Apply the state portion of a sync response: the first pass over the
    /// joined rooms, followed by invitations.
    ///
    /// Timeline events are left to [`BaseClient::receive_sync_timelines`],
    /// which the caller runs after routing device-to-device events, so key
    /// material is in place before timelines are dispatched.
    pub async fn receive_sync_state(&self, response: &SyncResponse) {
        *self.sync_token.write().await = response.next_batch.clone();

        for (room_id, joined) in &response.rooms.join {
            debug!(%room_id, "syncing room state");
            let room = self.get_or_create_room(room_id).await;
            let mut room = room.lock().await;

            for event in &joined.state.events {
                room.receive_state_event(event);
            }

            let announce = !room.is_initial_sync();
            room.complete_initial_sync();
            self.complete_state_update(&mut room, announce).await;
        }

        for (room_id, invited) in &response.rooms.invite {
            info!(%room_id, "invited to room");
            self.handle_invite(room_id, invited).await;
        }
    }

    /// Apply the timeline portion of a sync response: the second pass over
    /// the joined rooms.
    pub async fn receive_sync_timelines(&self, response: &SyncResponse) {
        for (room_id, joined) in &response.rooms.join {
            if joined.timeline.events.is_empty() {
                continue;
            }

            let room = self.get_or_create_room(room_id).await;
            let mut room = room.lock().await;

            for event in &joined.timeline.events {
                let is_state = event.get("state_key").is_some();
                if let Some(message) = room.receive_timeline_event(event) {
                    self.emitter().await.on_message(room_id, &message).await;
                } else if is_state {
                    self.complete_state_update(&mut room, true).await;
                }
            }
        }
    }

    /// Emit the accumulated member diff and any room-name change.
    async fn complete_state_update(&self, room: &mut Room, announce: bool) {
        let diff = room.members.take_updates();
        let emitter = self.emitter().await;

        if !diff.is_empty() {
            emitter.on_room_members(&room.room_id, &diff, announce).await;
        }
        if let Some(name) = room.updated_name() {
            emitter.on_room_name(&room.room_id, &name).await;
        }
    }

    /// Surface an invitation to the application.
    ///
    /// A transient state table is built from the stripped invite state; the
    /// inviter is the sender of our own membership event. No persistent
    /// state is kept until the invitation is accepted.
    async fn handle_invite(&self, room_id: &str, invited: &InvitedRoom) {
        if invited.invite_state.events.is_empty() {
            warn!(room_id, "no events in invite state");
            return;
        }

        let mut state = StateTable::new();
        for event in &invited.invite_state.events {
            state.update(event);
        }

        let user_id = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
            .unwrap_or_default();

        let inviter = state
            .get("m.room.member", &user_id)
            .and_then(|event| event.sender.clone())
            .unwrap_or_else(|| "?".to_owned());

        let room_name = state.room_alias().unwrap_or_else(|| inviter.clone());

        self.emitter().await.on_invite(room_id, &inviter, &room_name).await;
    }
}
