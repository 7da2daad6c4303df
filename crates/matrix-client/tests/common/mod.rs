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

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use matrix_client::{
    Client, ClientConfig, CredentialStore, ErrorKind, EventEmitter, MemberDiff, MemoryStore,
    TimelineMessage, KEY_ACCESS_TOKEN, KEY_HOME_SERVER,
};
use tokio::sync::Mutex;
use wiremock::MockServer;

/// An emitter recording everything the client reports.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    pub events: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<(String, TimelineMessage)>>,
    pub invites: Mutex<Vec<(String, String, String)>>,
    pub errors: Mutex<Vec<(ErrorKind, String)>>,
}

#[async_trait::async_trait]
impl EventEmitter for RecordingEmitter {
    async fn on_room_created(&self, room_id: &str) {
        self.events.lock().await.push(format!("created {room_id}"));
    }

    async fn on_room_name(&self, _room_id: &str, name: &str) {
        self.events.lock().await.push(format!("name {name}"));
    }

    async fn on_room_members(&self, _room_id: &str, diff: &MemberDiff, announce: bool) {
        self.events.lock().await.push(format!(
            "members joined={:?} renamed={:?} left={:?} announce={announce}",
            diff.joined, diff.renamed, diff.left
        ));
    }

    async fn on_message(&self, room_id: &str, message: &TimelineMessage) {
        self.events
            .lock()
            .await
            .push(format!("message {}: {}", message.sender_display, message.body));
        self.messages.lock().await.push((room_id.to_owned(), message.clone()));
    }

    async fn on_invite(&self, room_id: &str, inviter: &str, room_name: &str) {
        self.events
            .lock()
            .await
            .push(format!("invite {room_id} from {inviter} ({room_name})"));
        self.invites
            .lock()
            .await
            .push((room_id.to_owned(), inviter.to_owned(), room_name.to_owned()));
    }

    async fn on_progress(&self, phase: &str, step: u32, of: u32) {
        self.events.lock().await.push(format!("progress {phase} {step}/{of}"));
    }

    async fn on_error(&self, kind: ErrorKind, message: &str) {
        self.errors.lock().await.push((kind, message.to_owned()));
    }
}

/// A client wired to a mock homeserver, with its store and emitter.
pub struct TestClient {
    pub client: Client,
    pub store: Arc<MemoryStore>,
    pub emitter: Arc<RecordingEmitter>,
}

/// Build a client talking to the given mock server.
///
/// The store is seeded with the server's URL and, when `access_token` is
/// given, a stored token so the login path goes through `whoami`.
pub async fn test_client(
    server: &MockServer,
    access_token: Option<&str>,
    config: ClientConfig,
) -> TestClient {
    let store = Arc::new(MemoryStore::new());
    store.set_string(KEY_HOME_SERVER, &server.uri()).await;
    if let Some(token) = access_token {
        store.set_string(KEY_ACCESS_TOKEN, token).await;
    }

    let client = Client::new("me@host", config, store.clone()).await.unwrap();
    let emitter = Arc::new(RecordingEmitter::default());
    client.set_event_emitter(emitter.clone()).await;

    TestClient { client, store, emitter }
}

/// Poll `condition` until it holds, panicking after a generous timeout.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// The number of requests received for the given method and path prefix.
pub async fn requests_to(server: &MockServer, method: &str, path_prefix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.to_string() == method && r.url.path().starts_with(path_prefix))
        .count()
}
