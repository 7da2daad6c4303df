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

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::debug;
use vodozemac::megolm::InboundGroupSession;

use crate::error::Result;
use crate::sessions::{
    pickle_group_session, unpickle_group_session, InboundGroupSessionKey, Session,
};

/// SQLite-backed storage for session material.
///
/// One database exists per `(user id, host user)` pair so that several
/// accounts on one machine never share ratchet state. The Olm account
/// itself is persisted separately, through the credential store.
pub struct CryptoStore {
    conn: Mutex<Connection>,
    pickle_key: [u8; 32],
}

impl std::fmt::Debug for CryptoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStore").finish_non_exhaustive()
    }
}

impl CryptoStore {
    /// Open (creating if necessary) the database for the given account.
    pub fn open(
        data_dir: &Path,
        user_id: &str,
        host_user: &str,
        pickle_key: [u8; 32],
    ) -> Result<Self> {
        let path = Self::db_path(data_dir, user_id, host_user);
        debug!(path = %path.display(), "opening the session database");

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS olm_sessions (
                session_id TEXT PRIMARY KEY,
                sender_key TEXT NOT NULL,
                pickle TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_olm_sessions_sender
                ON olm_sessions(sender_key);

            CREATE TABLE IF NOT EXISTS inbound_group_sessions (
                room_id TEXT NOT NULL,
                sender_key TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                pickle TEXT NOT NULL,
                PRIMARY KEY (sender_key, sender_id, session_id, device_id)
            );",
        )?;

        Ok(CryptoStore { conn: Mutex::new(conn), pickle_key })
    }

    /// The database file used for the given account.
    pub fn db_path(data_dir: &Path, user_id: &str, host_user: &str) -> PathBuf {
        let filename = escape_filename(&format!("matrix-{user_id}-{host_user}.db"));
        data_dir.join(filename)
    }

    /// Insert or refresh a pairwise Olm session.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO olm_sessions (session_id, sender_key, pickle)
             VALUES (?1, ?2, ?3)",
            params![
                session.session_id(),
                session.sender_key,
                session.pickle(&self.pickle_key)
            ],
        )?;
        Ok(())
    }

    /// Load all stored sessions shared with the given device key.
    pub fn sessions_for(&self, sender_key: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT pickle FROM olm_sessions WHERE sender_key = ?1")?;
        let pickles: Vec<String> = stmt
            .query_map(params![sender_key], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        pickles
            .iter()
            .map(|pickle| Session::from_pickle(pickle, &self.pickle_key, sender_key.to_owned()))
            .collect()
    }

    /// Persist an inbound Megolm session under its identity tuple.
    pub fn save_group_session(
        &self,
        room_id: &str,
        key: &InboundGroupSessionKey,
        session: &InboundGroupSession,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO inbound_group_sessions
                 (room_id, sender_key, sender_id, session_id, device_id, pickle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                room_id,
                key.sender_key,
                key.sender_id,
                key.session_id,
                key.device_id,
                pickle_group_session(session, &self.pickle_key)
            ],
        )?;
        Ok(())
    }

    /// Load every stored inbound Megolm session.
    pub fn load_group_sessions(
        &self,
    ) -> Result<Vec<(String, InboundGroupSessionKey, InboundGroupSession)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT room_id, sender_key, sender_id, session_id, device_id, pickle
             FROM inbound_group_sessions",
        )?;
        let rows: Vec<(String, InboundGroupSessionKey, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    InboundGroupSessionKey {
                        sender_key: row.get(1)?,
                        sender_id: row.get(2)?,
                        session_id: row.get(3)?,
                        device_id: row.get(4)?,
                    },
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(room_id, key, pickle)| {
                let session = unpickle_group_session(&pickle, &self.pickle_key)?;
                Ok((room_id, key, session))
            })
            .collect()
    }
}

fn escape_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
