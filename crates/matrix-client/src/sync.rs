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

use std::time::Duration;

/// The server-side long-poll timeout passed to `/sync`.
pub(crate) const SYNC_TIMEOUT_MS: u64 = 30_000;

/// How often the liveness watchdog looks at the clock.
pub(crate) const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// The client-side hard liveness bound: a connection that has not
/// completed a sync for this long is considered stalled.
pub(crate) const SYNC_STALL_THRESHOLD: Duration = Duration::from_secs(60);

/// The high-level state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Validating credentials or performing a password login.
    LoggingIn,
    /// The first, full-state, sync is running.
    InitialSync,
    /// The sync loop is connected and long-polling.
    Connected,
    /// The connection failed and the loop stopped.
    Error,
}

/// Settings for a sync call.
#[derive(Clone, Debug, Default)]
pub struct SyncSettings {
    pub(crate) since: Option<String>,
    pub(crate) full_state: bool,
    pub(crate) timeout_ms: u64,
}

impl SyncSettings {
    /// Settings for an incremental sync from the given token.
    pub fn incremental(since: Option<String>) -> Self {
        SyncSettings { since, full_state: false, timeout_ms: SYNC_TIMEOUT_MS }
    }

    /// Settings for an initial, full-state, sync.
    pub fn full_state() -> Self {
        SyncSettings { since: None, full_state: true, timeout_ms: SYNC_TIMEOUT_MS }
    }
}

/// The watchdog's restart predicate.
///
/// `sync_has_run` is set by the first completed sync and deliberately not
/// reset by cancellation; a connection whose very first sync hangs is
/// bounded by the transport timeout instead.
pub(crate) fn should_restart(sync_has_run: bool, elapsed: Option<Duration>) -> bool {
    sync_has_run && elapsed.is_some_and(|elapsed| elapsed > SYNC_STALL_THRESHOLD)
}
