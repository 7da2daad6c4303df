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

mod common;

use std::time::Duration;

use common::{requests_to, test_client, wait_until};
use matrix_client::{
    ClientConfig, ConnectionState, CredentialStore, RequestConfig, Session, SyncSettings,
    KEY_ACCESS_TOKEN, KEY_NEXT_BATCH,
};
use serde_json::json;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn whoami_ok() -> Mock {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/account/whoami"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user_id": "@me:h" })))
}

/// A sync mock parking the loop: responds after a long delay so the test
/// can inspect state and shut down.
fn parked_sync(since: &str, next_batch: &str) -> Mock {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("since", since))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(30))
                .set_body_json(json!({ "next_batch": next_batch })),
        )
}

fn member_event(user_id: &str, membership: &str, displayname: &str) -> serde_json::Value {
    json!({
        "type": "m.room.member",
        "state_key": user_id,
        "sender": user_id,
        "content": { "membership": membership, "displayname": displayname },
    })
}

#[tokio::test]
async fn stored_token_initial_sync_populates_the_room() {
    let server = MockServer::start().await;
    whoami_ok().mount(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [
                    { "type": "m.room.name", "state_key": "", "content": { "name": "General" } },
                    member_event("@a:h", "join", "Alice"),
                ]},
                "timeline": { "events": [{
                    "type": "m.room.message",
                    "sender": "@a:h",
                    "origin_server_ts": 1_700_000_000_000u64,
                    "content": { "msgtype": "m.text", "body": "hi" },
                }]},
            }}},
        })))
        .mount(&server)
        .await;
    parked_sync("s1", "s2").mount(&server).await;

    let test = test_client(&server, Some("tok"), ClientConfig::new()).await;
    test.client.login(None).await.unwrap();

    wait_until("the first sync is applied", || async {
        test.store.get_string(KEY_NEXT_BATCH).await.as_deref() == Some("s1")
    })
    .await;

    // The stored token was reused: no password login happened.
    assert_eq!(requests_to(&server, "POST", "/_matrix/client/api/v1/login").await, 0);

    assert_eq!(
        test.client.room_display_name("!r:h").await.as_deref(),
        Some("General")
    );
    assert_eq!(test.client.state().await, ConnectionState::Connected);

    let messages = test.emitter.messages.lock().await;
    assert_eq!(messages.len(), 1);
    let (room_id, message) = &messages[0];
    assert_eq!(room_id, "!r:h");
    assert_eq!(message.sender_display, "Alice");
    assert_eq!(message.body, "hi");
    assert_eq!(message.ts, 1_700_000_000);

    test.client.shutdown().await;
}

#[tokio::test]
async fn whoami_rejection_falls_back_to_password_login() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/account/whoami"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errcode": "M_UNKNOWN_TOKEN",
            "error": "Invalid token",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/api/v1/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "user_id": "@me:h",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "next_batch": "s1" })),
        )
        .mount(&server)
        .await;
    parked_sync("s1", "s2").mount(&server).await;

    let test = test_client(&server, Some("stale-token"), ClientConfig::new()).await;
    test.client.login(Some("hunter2")).await.unwrap();

    wait_until("the fresh token is persisted", || async {
        test.store.get_string(KEY_ACCESS_TOKEN).await.as_deref() == Some("fresh-token")
    })
    .await;

    assert_eq!(requests_to(&server, "POST", "/_matrix/client/api/v1/login").await, 1);
    let requests = server.received_requests().await.unwrap();
    let login = &requests[1];
    let body: serde_json::Value = login.body_json().unwrap();
    assert_eq!(body["type"], "m.login.password");
    assert_eq!(body["user"], "me@host");
    assert_eq!(body["password"], "hunter2");

    assert!(test.emitter.errors.lock().await.is_empty());
    test.client.shutdown().await;
}

#[tokio::test]
async fn remote_echoes_of_our_sends_stay_silent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [member_event("@me:h", "join", "Me")] },
            }}},
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/_matrix/client/r0/rooms/.*/send/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "event_id": "$e1" })))
        .mount(&server)
        .await;

    let test = test_client(&server, None, ClientConfig::new()).await;
    test.client
        .restore_login(Session {
            access_token: "tok".to_owned(),
            user_id: "@me:h".to_owned(),
            device_id: None,
        })
        .await;

    test.client.sync_once(SyncSettings::full_state()).await.unwrap();

    let txn_id = test.client.send_message("!r:h", "hello").await.unwrap();
    wait_until("the send goes out", || async {
        requests_to(&server, "PUT", "/_matrix/client/r0/rooms/!r:h/send/").await == 1
    })
    .await;

    // The event comes back to us with our transaction id reflected.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("since", "s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s2",
            "rooms": { "join": { "!r:h": {
                "timeline": { "events": [{
                    "type": "m.room.message",
                    "sender": "@me:h",
                    "origin_server_ts": 1_700_000_100_000u64,
                    "content": { "msgtype": "m.text", "body": "hello" },
                    "unsigned": { "transaction_id": txn_id.as_str() },
                }]},
            }}},
        })))
        .mount(&server)
        .await;

    test.client
        .sync_once(SyncSettings::incremental(Some("s1".to_owned())))
        .await
        .unwrap();

    // The echo was suppressed: nothing was surfaced to the application.
    assert!(test.emitter.messages.lock().await.is_empty());

    // The send request carried the same transaction id in its path.
    let requests = server.received_requests().await.unwrap();
    let send = requests
        .iter()
        .find(|r| r.method.to_string() == "PUT")
        .expect("one send request");
    assert!(send.url.path().ends_with(&format!("/{}", txn_id.as_str())));
}

#[tokio::test]
async fn member_diffs_drive_the_room_name() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "t1",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [
                    member_event("@me:h", "join", "Me"),
                    member_event("@a:h", "join", "Alice"),
                    member_event("@b:h", "join", "Bob"),
                ]},
            }}},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("since", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "t2",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [member_event("@b:h", "leave", "Bob")] },
            }}},
        })))
        .mount(&server)
        .await;

    let test = test_client(&server, None, ClientConfig::new()).await;
    test.client
        .restore_login(Session {
            access_token: "tok".to_owned(),
            user_id: "@me:h".to_owned(),
            device_id: None,
        })
        .await;

    test.client.sync_once(SyncSettings::full_state()).await.unwrap();
    assert_eq!(
        test.client.room_display_name("!r:h").await.as_deref(),
        Some("Alice and Bob")
    );

    test.client
        .sync_once(SyncSettings::incremental(Some("t1".to_owned())))
        .await
        .unwrap();
    assert_eq!(
        test.client.room_display_name("!r:h").await.as_deref(),
        Some("Alice")
    );

    let events = test.emitter.events.lock().await;
    assert!(events
        .iter()
        .any(|e| e.contains("left=[\"Bob\"]") && e.contains("announce=true")));
}

#[tokio::test]
async fn invites_surface_and_can_be_accepted() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s1",
            "rooms": { "invite": { "!inv:h": { "invite_state": { "events": [
                {
                    "type": "m.room.name",
                    "state_key": "",
                    "sender": "@a:h",
                    "content": { "name": "Secret plans" },
                },
                {
                    "type": "m.room.member",
                    "state_key": "@me:h",
                    "sender": "@a:h",
                    "content": { "membership": "invite" },
                },
            ]}}}},
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/join/!inv:h"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "room_id": "!inv:h" })))
        .mount(&server)
        .await;

    let test = test_client(&server, None, ClientConfig::new()).await;
    test.client
        .restore_login(Session {
            access_token: "tok".to_owned(),
            user_id: "@me:h".to_owned(),
            device_id: None,
        })
        .await;

    test.client.sync_once(SyncSettings::full_state()).await.unwrap();

    {
        let invites = test.emitter.invites.lock().await;
        assert_eq!(
            invites.as_slice(),
            [(
                "!inv:h".to_owned(),
                "@a:h".to_owned(),
                "Secret plans".to_owned()
            )]
        );
    }
    // No room state is created for a pending invitation.
    assert!(test.client.joined_rooms().await.is_empty());

    test.client.join_room("!inv:h").await.unwrap();
    assert_eq!(requests_to(&server, "POST", "/_matrix/client/r0/join/").await, 1);
}

#[tokio::test]
async fn failed_sends_keep_the_event_queued() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:h": {
                "state": { "events": [member_event("@me:h", "join", "Me")] },
            }}},
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/_matrix/client/r0/rooms/.*/send/"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let test = test_client(&server, None, ClientConfig::new()).await;
    test.client
        .restore_login(Session {
            access_token: "tok".to_owned(),
            user_id: "@me:h".to_owned(),
            device_id: None,
        })
        .await;
    test.client.sync_once(SyncSettings::full_state()).await.unwrap();

    test.client.send_message("!r:h", "doomed").await.unwrap();
    wait_until("the failed send is reported", || async {
        !test.emitter.errors.lock().await.is_empty()
    })
    .await;

    let errors = test.emitter.errors.lock().await;
    assert!(errors[0].1.contains("Error from home server: 502"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn watchdog_restarts_a_stalled_sync() {
    let server = MockServer::start().await;
    whoami_ok().mount(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("full_state", "true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "next_batch": "tok1" })),
        )
        .mount(&server)
        .await;
    // The follow-up sync stops delivering: it would only answer long after
    // the 60 second liveness bound.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(query_param("since", "tok1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(600))
                .set_body_json(json!({ "next_batch": "tok2" })),
        )
        .mount(&server)
        .await;

    // Keep the transport timeout out of the picture: the watchdog is what
    // must recover this connection.
    let config = ClientConfig::new()
        .request_config(RequestConfig::new().timeout(Duration::from_secs(3600)));
    let test = test_client(&server, Some("tok"), config).await;
    test.client.login(None).await.unwrap();

    wait_until("the stalled sync is cancelled and re-issued", || async {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| {
                r.url.path() == "/_matrix/client/r0/sync"
                    && r.url.query_pairs().any(|(k, v)| k == "since" && v == "tok1")
            })
            .count()
            >= 2
    })
    .await;

    // Cancellation is silent: the connection never went into the error
    // state and no error reached the application.
    assert_eq!(test.client.state().await, ConnectionState::Connected);
    assert!(test.emitter.errors.lock().await.is_empty());

    test.client.shutdown().await;
}
