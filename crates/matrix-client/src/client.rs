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

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use matrix_client_base::{BaseClient, EventEmitter, Session, SyncResponse, TxnId};
use matrix_client_crypto::{OlmMachine, StoredAccount};
use serde_json::{json, Value};
use tokio::sync::Mutex;
// tokio's Instant honours paused test clocks, which the liveness logic is
// tested with.
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{Api, MediaResponse, ThumbnailMethod};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::http_client::{HttpClient, RequestHandle};
use crate::store::{
    CredentialStore, KEY_ACCESS_TOKEN, KEY_DEVICE_ID, KEY_NEXT_BATCH, KEY_OLM_ACCOUNT,
    KEY_SKIP_OLD_MESSAGES,
};
use crate::sync::{
    should_restart, ConnectionState, SyncSettings, SYNC_TIMEOUT_MS, WATCHDOG_INTERVAL,
};

/// The long-lived client: owns the connection to one homeserver and the
/// in-memory model of its rooms.
///
/// Cloning is cheap, all clones drive the same connection.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    api: Api,
    base: BaseClient,
    store: Arc<dyn CredentialStore>,
    username: String,
    data_dir: PathBuf,
    olm: Mutex<Option<OlmMachine>>,
    state: Mutex<ConnectionState>,
    /// Monotonic instant of the last fully applied sync.
    last_sync: Mutex<Option<Instant>>,
    /// Set once the first sync has completed; never reset by cancellation.
    sync_run: AtomicBool,
    shutdown: AtomicBool,
    active_sync: Mutex<Option<RequestHandle>>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("homeserver", self.api.homeserver())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for the given account.
    ///
    /// The homeserver is read from the credential store (falling back to
    /// matrix.org) and normalized to end in a slash. `username` identifies
    /// the account on this machine and scopes the session database.
    pub async fn new(
        username: &str,
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let mut homeserver = store.home_server().await;
        if !homeserver.ends_with('/') {
            homeserver.push('/');
        }
        let homeserver = Url::parse(&homeserver).map_err(crate::error::HttpError::from)?;

        let data_dir = config.data_dir.clone().unwrap_or_else(std::env::temp_dir);
        let http = HttpClient::new(&config)?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                api: Api::new(homeserver, http),
                base: BaseClient::new(),
                store,
                username: username.to_owned(),
                data_dir,
                olm: Mutex::new(None),
                state: Mutex::new(ConnectionState::LoggingIn),
                last_sync: Mutex::new(None),
                sync_run: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                active_sync: Mutex::new(None),
            }),
        })
    }

    /// The homeserver this client talks to.
    pub fn homeserver(&self) -> &Url {
        self.inner.api.homeserver()
    }

    /// Install the application's [`EventEmitter`].
    pub async fn set_event_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        self.inner.base.set_event_emitter(emitter).await;
    }

    /// The current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    /// The current session, if logged in.
    pub async fn session(&self) -> Option<Session> {
        self.inner.base.session().await
    }

    /// The ids of the rooms currently held in memory.
    pub async fn joined_rooms(&self) -> Vec<String> {
        self.inner.base.joined_room_ids().await
    }

    /// The derived display name of a room.
    pub async fn room_display_name(&self, room_id: &str) -> Option<String> {
        let room = self.inner.base.get_room(room_id).await?;
        let name = room.lock().await.display_name();
        Some(name)
    }

    /// Restore a previously created session without hitting the network.
    ///
    /// Useful when the application already knows the session is valid; no
    /// sync loop is started.
    pub async fn restore_login(&self, session: Session) {
        self.inner.base.restore_session(session).await;
    }

    /// Run a single sync round: request, apply, persist the cursor.
    ///
    /// The sync loop does this continuously; exposing one round makes the
    /// client drivable from applications that own their own scheduling.
    pub async fn sync_once(&self, settings: SyncSettings) -> Result<String> {
        self.inner
            .sync_round(settings.since.as_deref(), settings.full_state, settings.timeout_ms)
            .await
    }

    /// Log in and start the sync loop.
    ///
    /// A stored access token is validated with `whoami` first; any failure
    /// there falls back to a password login, for which `password` must be
    /// supplied. On success the loop runs until [`Client::shutdown`] or a
    /// connection error.
    pub async fn login(&self, password: Option<&str>) -> Result<()> {
        let result = self.login_inner(password).await;
        if let Err(e) = &result {
            self.inner.connection_error(e).await;
        }
        result
    }

    async fn login_inner(&self, password: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        *inner.state.lock().await = ConnectionState::LoggingIn;
        inner.base.emitter().await.on_progress("Logging in", 0, 3).await;

        let stored_device = inner.store.get_string(KEY_DEVICE_ID).await;

        if let Some(access_token) = inner.store.get_string(KEY_ACCESS_TOKEN).await {
            match inner.api.whoami(&access_token).await {
                Ok(response) => {
                    if let Some(user_id) = response.user_id {
                        debug!(%user_id, "whoami confirmed the stored token");
                        inner
                            .base
                            .restore_session(Session {
                                access_token,
                                user_id,
                                device_id: stored_device,
                            })
                            .await;
                        return self.start_sync().await;
                    }
                    debug!("whoami response carried no user_id, logging in again");
                }
                Err(e) => {
                    debug!(error = %e, "whoami failed, falling back to password login");
                }
            }
        }

        let password = password.ok_or(Error::AuthenticationRequired)?;
        let response = inner
            .api
            .password_login(&inner.username, password, stored_device.as_deref())
            .await?;

        let access_token = response.access_token.ok_or(Error::MissingAccessToken)?;
        let user_id = response.user_id.unwrap_or_else(|| inner.username.clone());

        inner.store.set_string(KEY_ACCESS_TOKEN, &access_token).await;
        if let Some(device_id) = &response.device_id {
            inner.store.set_string(KEY_DEVICE_ID, device_id).await;
        }

        inner
            .base
            .restore_session(Session {
                access_token,
                user_id,
                device_id: response.device_id,
            })
            .await;

        self.start_sync().await
    }

    /// Decide between initial and incremental sync, bootstrap encryption,
    /// and spawn the loop and its watchdog.
    async fn start_sync(&self) -> Result<()> {
        let inner = &self.inner;

        if let Some(device_id) = inner.store.get_string(KEY_DEVICE_ID).await {
            // Bootstrap failures free the E2E subsystem but do not kill the
            // connection.
            Arc::clone(inner).bootstrap_e2e(&device_id).await;
        }

        let stored_batch = inner.store.get_string(KEY_NEXT_BATCH).await;
        let settings = match &stored_batch {
            Some(batch)
                if inner.base.has_rooms().await
                    || inner.store.get_bool(KEY_SKIP_OLD_MESSAGES).await =>
            {
                SyncSettings::incremental(Some(batch.clone()))
            }
            _ => SyncSettings::full_state(),
        };

        let emitter = inner.base.emitter().await;
        if settings.full_state {
            *inner.state.lock().await = ConnectionState::InitialSync;
            emitter.on_progress("Initial Sync", 1, 3).await;
        } else {
            *inner.state.lock().await = ConnectionState::Connected;
            emitter.on_progress("Connected", 2, 3).await;
        }

        inner.base.set_sync_token(settings.since.clone()).await;
        inner.sync_run.store(false, Ordering::SeqCst);

        let watchdog = Arc::clone(inner);
        tokio::spawn(async move { watchdog.watchdog().await });

        let looper = Arc::clone(inner);
        tokio::spawn(async move { looper.sync_loop(settings).await });

        Ok(())
    }

    /// Stop the sync loop and suppress any further requests.
    ///
    /// Cancellation is silent: it never transitions the connection into an
    /// error state.
    pub async fn shutdown(&self) {
        info!("shutting down the connection");
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.active_sync.lock().await.as_ref() {
            handle.cancel();
        }
    }

    /// Queue a text message for the given room.
    pub async fn send_message(&self, room_id: &str, body: &str) -> Result<TxnId> {
        self.queue_event(
            room_id,
            "m.room.message",
            json!({ "msgtype": "m.text", "body": body }),
        )
        .await
    }

    /// Append an event to a room's outbound queue and kick the sender.
    ///
    /// The returned transaction id is minted once and reused for every
    /// retry of this event.
    pub async fn queue_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<TxnId> {
        let room = self
            .inner
            .base
            .get_room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        let txn_id = room.lock().await.queue.enqueue(event_type, content);

        let inner = Arc::clone(&self.inner);
        let room_id = room_id.to_owned();
        tokio::spawn(async move { inner.drive_send_queue(room_id).await });

        Ok(txn_id)
    }

    /// Join a room by id or alias. Also used to accept invitations.
    pub async fn join_room(&self, room: &str) -> Result<()> {
        let token = self.inner.access_token().await?;
        let response = self.inner.api.join_room(&token, room).await?;
        debug!(room_id = ?response.room_id, "join completed");
        Ok(())
    }

    /// Reject an invitation. No local state exists for it yet, so this is
    /// a bare `/leave`.
    pub async fn reject_invite(&self, room_id: &str) -> Result<()> {
        let token = self.inner.access_token().await?;
        self.inner.api.leave_room(&token, room_id).await?;
        Ok(())
    }

    /// Leave a joined room and forget its local state, draining the
    /// outbound queue.
    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        let token = self.inner.access_token().await?;
        self.inner.api.leave_room(&token, room_id).await?;
        self.inner.base.forget_room(room_id).await;
        Ok(())
    }

    /// Invite a user to a room.
    pub async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<()> {
        let token = self.inner.access_token().await?;
        self.inner.api.invite_user(&token, room_id, user_id).await?;
        Ok(())
    }

    /// Send a typing notification for our own user.
    pub async fn typing(&self, room_id: &str, typing: bool, timeout_ms: u64) -> Result<()> {
        let session = self.inner.base.session().await.ok_or(Error::NotLoggedIn)?;
        self.inner
            .api
            .typing(&session.access_token, room_id, &session.user_id, typing, timeout_ms)
            .await?;
        Ok(())
    }

    /// Upload a media file, returning its `mxc://` URI.
    pub async fn upload_file(&self, content_type: &str, data: Vec<u8>) -> Result<String> {
        let token = self.inner.access_token().await?;
        let response = self.inner.api.upload_file(&token, content_type, data).await?;
        response
            .content_uri
            .ok_or(crate::error::HttpError::InvalidResponse.into())
    }

    /// Download a media file addressed by an `mxc://` URI.
    pub async fn download_file(&self, uri: &str, max_size: usize) -> Result<MediaResponse> {
        Ok(self.inner.api.download_file(uri, max_size).await?)
    }

    /// Download a thumbnail for a media file.
    pub async fn download_thumb(
        &self,
        uri: &str,
        max_size: usize,
        width: u32,
        height: u32,
        method: ThumbnailMethod,
    ) -> Result<MediaResponse> {
        Ok(self
            .inner
            .api
            .download_thumb(uri, max_size, width, height, method)
            .await?)
    }
}

impl ClientInner {
    async fn access_token(&self) -> Result<String> {
        Ok(self.base.session().await.ok_or(Error::NotLoggedIn)?.access_token)
    }

    /// Move the connection into the error state and tell the application,
    /// unless the error is the silent cancellation sentinel.
    async fn connection_error(&self, error: &Error) {
        if error.is_cancelled() {
            return;
        }

        warn!(error = %error, "connection error");
        *self.state.lock().await = ConnectionState::Error;
        self.base.emitter().await.on_error(error.kind(), &error.to_string()).await;
    }

    /// Mark the connection connected, idempotently.
    async fn mark_connected(&self) {
        let mut state = self.state.lock().await;
        if *state != ConnectionState::Connected {
            *state = ConnectionState::Connected;
            drop(state);
            self.base.emitter().await.on_progress("Connected", 2, 3).await;
        }
    }

    /// One sync round: request, apply, persist the cursor.
    ///
    /// The cursor is only persisted after the response body has been fully
    /// applied to the in-memory state.
    async fn sync_round(
        &self,
        since: Option<&str>,
        full_state: bool,
        timeout_ms: u64,
    ) -> Result<String> {
        let token = self.access_token().await?;

        let handle = RequestHandle::new();
        *self.active_sync.lock().await = Some(handle.clone());
        let result = self.api.sync(&token, since, timeout_ms, full_state, &handle).await;
        *self.active_sync.lock().await = None;

        let response = result?;
        self.sync_run.store(true, Ordering::SeqCst);
        *self.last_sync.lock().await = Some(Instant::now());
        self.mark_connected().await;

        let next_batch = self.apply_sync(response).await?;
        self.store.set_string(KEY_NEXT_BATCH, &next_batch).await;
        Ok(next_batch)
    }

    /// The sync loop: long-poll, apply, persist the cursor, repeat.
    async fn sync_loop(self: Arc<Self>, settings: SyncSettings) {
        let mut since = settings.since;
        let mut full_state = settings.full_state;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match self.sync_round(since.as_deref(), full_state, SYNC_TIMEOUT_MS).await {
                Ok(next_batch) => {
                    since = Some(next_batch);
                    full_state = false;
                }
                Err(e) if e.is_cancelled() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        debug!("sync cancelled for shutdown");
                        return;
                    }
                    // The watchdog fired: restart from the persisted cursor.
                    info!("sync cancelled, restarting from the stored next_batch");
                    since = self.store.get_string(KEY_NEXT_BATCH).await;
                    full_state = false;
                }
                Err(e) => {
                    self.connection_error(&e).await;
                    return;
                }
            }
        }
    }

    /// The liveness watchdog: cancel a sync that stopped delivering.
    async fn watchdog(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst)
                || *self.state.lock().await == ConnectionState::Error
            {
                return;
            }

            let elapsed = self.last_sync.lock().await.map(|at| at.elapsed());
            if should_restart(self.sync_run.load(Ordering::SeqCst), elapsed) {
                info!(?elapsed, "sync liveness bound exceeded, cancelling");
                if let Some(handle) = self.active_sync.lock().await.as_ref() {
                    handle.cancel();
                }
            }
        }
    }

    /// Apply a sync response in order: state and invites first, then
    /// device-to-device traffic and key counts, then timelines, so key
    /// material is available before messages are dispatched.
    async fn apply_sync(&self, response: SyncResponse) -> Result<String> {
        let next_batch = response.next_batch.clone().ok_or(Error::MissingNextBatch)?;

        self.base.receive_sync_state(&response).await;

        let upload = {
            let mut olm = self.olm.lock().await;
            match olm.as_mut() {
                Some(olm) => {
                    for event in &response.to_device.events {
                        let event_type = event.get("type").and_then(Value::as_str);
                        debug!(?event_type, "to-device event");
                        if event_type == Some("m.room.encrypted") {
                            olm.receive_to_device(event);
                        }
                    }
                    olm.update_key_counts(&response.device_one_time_keys_count)
                }
                None => None,
            }
        };
        if let Some(one_time_keys) = upload {
            self.upload_one_time_keys(one_time_keys).await;
        }

        self.base.receive_sync_timelines(&response).await;

        Ok(next_batch)
    }

    /// Restore or create the Olm account, upload our device keys and top
    /// up the one-time-key pool.
    ///
    /// Any failure here tears the E2E subsystem down again and reports it;
    /// the connection itself keeps running.
    async fn bootstrap_e2e(self: Arc<Self>, device_id: &str) {
        let result = self.bootstrap_e2e_inner(device_id).await;
        if let Err(e) = result {
            warn!(error = %e, "end-to-end encryption setup failed");
            *self.olm.lock().await = None;
            self.base.emitter().await.on_error(e.kind(), &e.to_string()).await;
        }
    }

    async fn bootstrap_e2e_inner(&self, device_id: &str) -> Result<()> {
        let session = self.base.session().await.ok_or(Error::NotLoggedIn)?;
        let server = self.api.homeserver().as_str().to_owned();

        let stored: Option<StoredAccount> = match self.store.get_string(KEY_OLM_ACCOUNT).await {
            Some(record) => Some(serde_json::from_str(&record)?),
            None => None,
        };

        std::fs::create_dir_all(&self.data_dir)?;
        let (machine, fresh) = OlmMachine::open(
            &session.user_id,
            device_id,
            &server,
            stored.as_ref(),
            &self.data_dir,
            &self.username,
        )?;

        if let Some(record) = fresh {
            self.store
                .set_string(KEY_OLM_ACCOUNT, &serde_json::to_string(&record)?)
                .await;
        }

        let device_keys = machine.device_keys()?;
        *self.olm.lock().await = Some(machine);

        let response = self
            .api
            .upload_keys(&session.access_token, Some(&device_keys), None)
            .await?;
        info!("uploaded device keys");

        let upload = self
            .olm
            .lock()
            .await
            .as_mut()
            .map(|olm| olm.update_key_counts(&response.one_time_key_counts))
            .unwrap_or_default();
        if let Some(one_time_keys) = upload {
            self.upload_one_time_keys(one_time_keys).await;
        }

        Ok(())
    }

    /// Upload signed one-time keys until the server-side pool is healthy.
    ///
    /// Failures are logged but never error the connection; the next sync's
    /// key counts will retrigger the upload.
    async fn upload_one_time_keys(&self, mut one_time_keys: Value) {
        let Ok(token) = self.access_token().await else { return };

        loop {
            let count = one_time_keys.as_object().map_or(0, |keys| keys.len());
            match self.api.upload_keys(&token, None, Some(&one_time_keys)).await {
                Ok(response) => {
                    info!(count, "uploaded one-time keys");
                    let mut olm = self.olm.lock().await;
                    let Some(olm) = olm.as_mut() else { return };

                    let record = olm.mark_keys_published();
                    let record = match serde_json::to_string(&record) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize the account record");
                            return;
                        }
                    };
                    self.store.set_string(KEY_OLM_ACCOUNT, &record).await;

                    match olm.update_key_counts(&response.one_time_key_counts) {
                        Some(more) => one_time_keys = more,
                        None => return,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "one-time key upload failed");
                    return;
                }
            }
        }
    }

    /// Send queued events for a room, head first, one in flight at a time.
    ///
    /// A failed send keeps its entry (and transaction id) at the head of
    /// the queue and reports through the connection error path.
    async fn drive_send_queue(self: Arc<Self>, room_id: String) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("not sending new events on a dying connection");
                return;
            }

            let Some(room) = self.base.get_room(&room_id).await else { return };
            let Some(event) = room.lock().await.queue.begin_send() else { return };
            let Ok(token) = self.access_token().await else { return };

            debug!(%room_id, event_type = %event.event_type, txn_id = %event.txn_id, "sending");

            let result = self
                .api
                .send(
                    &token,
                    &room_id,
                    &event.event_type,
                    event.txn_id.as_str(),
                    &event.content,
                )
                .await;

            match result {
                Ok(response) => {
                    debug!(event_id = ?response.event_id, "successfully sent event");
                    room.lock().await.queue.mark_sent();
                }
                Err(e) => {
                    room.lock().await.queue.mark_failed();
                    self.connection_error(&e.into()).await;
                    return;
                }
            }
        }
    }
}
