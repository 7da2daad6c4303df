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
use tracing::debug;

/// The membership state of a room member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Membership {
    /// No known membership, also used for unrecognized membership strings.
    #[default]
    None,
    /// The user is joined to the room.
    Join,
    /// The user has been invited to the room.
    Invite,
    /// The user has left (or been removed from) the room.
    Leave,
}

impl Membership {
    fn parse(membership: Option<&str>) -> Self {
        match membership {
            Some("join") => Membership::Join,
            Some("invite") => Membership::Invite,
            Some("leave") => Membership::Leave,
            _ => Membership::None,
        }
    }
}

/// A member of a room.
#[derive(Clone, Debug)]
pub struct RoomMember {
    /// The user id of the member.
    pub user_id: String,
    /// The displayname from the state table, the authoritative server value.
    pub state_displayname: Option<String>,
    /// The displayname last reported to the application. Divergence from
    /// `state_displayname` is what drives the rename queue.
    pub current_displayname: Option<String>,
    /// The current membership of this member.
    pub membership: Membership,
}

impl RoomMember {
    fn new(user_id: &str) -> Self {
        RoomMember {
            user_id: user_id.to_owned(),
            state_displayname: None,
            current_displayname: None,
            membership: Membership::None,
        }
    }

    fn displayname(&self) -> String {
        self.state_displayname
            .clone()
            .unwrap_or_else(|| self.user_id.clone())
    }
}

/// The set of changes to a room's member list accumulated since the last
/// [`MemberTable::take_updates`] call.
///
/// The three lists are disjoint: a user appears in at most one of them for
/// any given batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberDiff {
    /// Displaynames of members that joined.
    pub joined: Vec<String>,
    /// `(old, new)` displayname pairs for members that were renamed.
    pub renamed: Vec<(String, String)>,
    /// Displaynames of members that left.
    pub left: Vec<String>,
}

impl MemberDiff {
    /// True if no membership change was recorded.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.renamed.is_empty() && self.left.is_empty()
    }
}

/// Tracks the members of a room, mirroring the `m.room.member` state.
///
/// Membership transitions are queued up as they are applied; once a batch of
/// state updates is complete, [`MemberTable::take_updates`] drains the queues
/// into a [`MemberDiff`] for the application.
#[derive(Clone, Debug, Default)]
pub struct MemberTable {
    members: HashMap<String, RoomMember>,
    new_members: Vec<String>,
    renamed_members: Vec<String>,
    left_members: Vec<String>,
}

impl MemberTable {
    /// Create a new, empty, member table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a room member by user id.
    pub fn get(&self, user_id: &str) -> Option<&RoomMember> {
        self.members.get(user_id)
    }

    /// The displayname to show for the given user.
    ///
    /// Falls back to the user id for members without a displayname and for
    /// users we have never seen a member event for.
    pub fn displayname_for(&self, user_id: &str) -> String {
        match self.members.get(user_id) {
            Some(member) => member
                .current_displayname
                .clone()
                .unwrap_or_else(|| member.displayname()),
            None => user_id.to_owned(),
        }
    }

    /// The user ids of all currently joined members.
    pub fn active_members(&self) -> Vec<&str> {
        self.members
            .values()
            .filter(|m| m.membership == Membership::Join)
            .map(|m| m.user_id.as_str())
            .collect()
    }

    /// Apply the content of an `m.room.member` event for the given user.
    pub fn update_member(&mut self, user_id: &str, content: &Value) {
        let new_displayname = content
            .get("displayname")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let new_membership =
            Membership::parse(content.get("membership").and_then(Value::as_str));

        let member = self
            .members
            .entry(user_id.to_owned())
            .or_insert_with(|| RoomMember::new(user_id));

        let old_membership = member.membership;
        let old_displayname = member.state_displayname.clone();

        member.membership = new_membership;
        member.state_displayname = new_displayname.clone();

        debug!(
            user_id,
            ?old_membership,
            ?new_membership,
            "member update"
        );

        if new_membership == Membership::Join {
            if old_membership != Membership::Join {
                self.new_members.push(user_id.to_owned());
            } else if old_displayname != new_displayname {
                self.renamed_members.push(user_id.to_owned());
            }
        } else if old_membership == Membership::Join {
            self.left_members.push(user_id.to_owned());
        }
    }

    /// Drain the queued membership transitions into a [`MemberDiff`].
    ///
    /// This also moves the reported displaynames forward: joining members get
    /// their `current_displayname` assigned, renamed members have it
    /// replaced, and leaving members have it retired.
    pub fn take_updates(&mut self) -> MemberDiff {
        let mut diff = MemberDiff::default();

        for user_id in std::mem::take(&mut self.new_members) {
            if let Some(member) = self.members.get_mut(&user_id) {
                let displayname = member.displayname();
                member.current_displayname = Some(displayname.clone());
                diff.joined.push(displayname);
            }
        }

        for user_id in std::mem::take(&mut self.renamed_members) {
            if let Some(member) = self.members.get_mut(&user_id) {
                let new_displayname = member.displayname();
                if let Some(old_displayname) =
                    member.current_displayname.replace(new_displayname.clone())
                {
                    diff.renamed.push((old_displayname, new_displayname));
                }
            }
        }

        for user_id in std::mem::take(&mut self.left_members) {
            if let Some(member) = self.members.get_mut(&user_id) {
                if let Some(displayname) = member.current_displayname.take() {
                    diff.left.push(displayname);
                }
            }
        }

        diff
    }
}
