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

use crate::event::TimelineMessage;
use crate::members::MemberDiff;

/// The class of an error reported to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport failed: connection refused, DNS, read error, invalid
    /// HTTP.
    Network,
    /// Anything else, including non-2xx responses from the homeserver.
    Other,
}

/// The callbacks through which the client reports to the application.
///
/// All methods default to doing nothing, implementors override the ones
/// they care about. Methods are invoked from the client's task; they should
/// hand off long-running work rather than block the sync loop.
#[async_trait::async_trait]
pub trait EventEmitter: Send + Sync {
    /// A room appeared for the first time, either in a sync response or
    /// because an invitation was accepted.
    async fn on_room_created(&self, _room_id: &str) {}

    /// The derived display name of a room changed.
    async fn on_room_name(&self, _room_id: &str, _name: &str) {}

    /// The member list of a room changed.
    ///
    /// `announce` is false while a room is being populated by its initial
    /// sync, so applications can add members quietly.
    async fn on_room_members(&self, _room_id: &str, _diff: &MemberDiff, _announce: bool) {}

    /// A message arrived in a room's timeline.
    async fn on_message(&self, _room_id: &str, _message: &TimelineMessage) {}

    /// An invitation to a room was received.
    async fn on_invite(&self, _room_id: &str, _inviter: &str, _room_name: &str) {}

    /// Connection progress, mirroring the login/initial-sync/connected
    /// phases.
    async fn on_progress(&self, _phase: &str, _step: u32, _of: u32) {}

    /// The connection entered an error state.
    async fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}

/// An emitter that discards everything. Used when the application does not
/// install one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmitter;

#[async_trait::async_trait]
impl EventEmitter for NullEmitter {}
