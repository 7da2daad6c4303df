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

//! This crate implements the no-IO core of a Matrix client.
//!
//! The [`BaseClient`] is a state machine that receives `/sync` responses and
//! updates an in-memory model of the rooms the user is joined to or invited
//! into. It performs no network or disk IO of its own; the `matrix-client`
//! crate drives it from the sync loop and forwards its observations to the
//! application through the [`EventEmitter`] trait.
#![deny(missing_docs)]

mod client;
mod emitter;
mod event;
mod members;
mod queue;
mod room;
mod session;
mod state;
mod sync;

pub use client::BaseClient;
pub use emitter::{ErrorKind, EventEmitter, NullEmitter};
pub use event::{RawEvent, TimelineMessage};
pub use members::{MemberDiff, Membership, MemberTable, RoomMember};
pub use queue::{EventQueue, PendingEvent, TxnId};
pub use room::Room;
pub use session::Session;
pub use state::{StateEvent, StateTable};
pub use sync::{EventList, InvitedRoom, JoinedRoom, Rooms, SyncResponse, ToDevice};
