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

use tokio::sync::RwLock;

/// Key of the homeserver base URL.
pub const KEY_HOME_SERVER: &str = "home_server";
/// Key of the stored access token.
pub const KEY_ACCESS_TOKEN: &str = "access_token";
/// Key of the stored device id.
pub const KEY_DEVICE_ID: &str = "device_id";
/// Key of the persisted sync cursor.
pub const KEY_NEXT_BATCH: &str = "next_batch";
/// Key of the persisted Olm account record.
pub const KEY_OLM_ACCOUNT: &str = "olm_account_keys";
/// Key of the skip-old-messages preference.
pub const KEY_SKIP_OLD_MESSAGES: &str = "skip_old_messages";

/// The homeserver used when the store has none configured.
pub const DEFAULT_HOME_SERVER: &str = "https://matrix.org";

/// Per-account persistent key/value storage provided by the application.
///
/// The client writes one value per key and assumes each write is atomic.
/// Everything stored here is a string; booleans are stored as
/// `"true"`/`"false"`.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Read a stored value.
    async fn get_string(&self, key: &str) -> Option<String>;

    /// Store a value.
    async fn set_string(&self, key: &str, value: &str);

    /// Remove a stored value.
    async fn remove(&self, key: &str);

    /// Read a boolean, defaulting to false.
    async fn get_bool(&self, key: &str) -> bool {
        self.get_string(key).await.as_deref() == Some("true")
    }

    /// The configured homeserver, falling back to [`DEFAULT_HOME_SERVER`].
    async fn home_server(&self) -> String {
        self.get_string(KEY_HOME_SERVER)
            .await
            .unwrap_or_else(|| DEFAULT_HOME_SERVER.to_owned())
    }
}

/// An in-memory [`CredentialStore`].
///
/// Keeps everything for the lifetime of the process; real applications
/// plug in their own persistent store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create a new, empty, store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    async fn get_string(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    async fn set_string(&self, key: &str, value: &str) {
        self.values.write().await.insert(key.to_owned(), value.to_owned());
    }

    async fn remove(&self, key: &str) {
        self.values.write().await.remove(key);
    }
}
