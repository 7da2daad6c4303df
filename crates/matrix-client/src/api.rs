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

//! Typed wrappers for the client-server API endpoints the sync core needs.

use std::collections::HashMap;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::Method;
use matrix_client_base::SyncResponse;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::RequestConfig;
use crate::error::HttpError;
use crate::http_client::{HttpClient, RequestHandle};

/// The device display name sent along with password logins.
const INITIAL_DEVICE_DISPLAY_NAME: &str = "matrix-client";

/// The response to a password login.
#[derive(Clone, Debug, Deserialize)]
pub struct LoginResponse {
    /// The access token for the new session.
    pub access_token: Option<String>,
    /// The fully qualified user id.
    pub user_id: Option<String>,
    /// The device id the server assigned or confirmed.
    pub device_id: Option<String>,
}

/// The response to a `whoami` query.
#[derive(Clone, Debug, Deserialize)]
pub struct WhoamiResponse {
    /// The user id the access token belongs to.
    pub user_id: Option<String>,
}

/// The response to sending an event.
#[derive(Clone, Debug, Deserialize)]
pub struct SendEventResponse {
    /// The event id the server assigned.
    pub event_id: Option<String>,
}

/// The response to joining a room.
#[derive(Clone, Debug, Deserialize)]
pub struct JoinRoomResponse {
    /// The id of the joined room.
    pub room_id: Option<String>,
}

/// The response to a media upload.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadResponse {
    /// The `mxc://` URI of the uploaded content.
    pub content_uri: Option<String>,
}

/// The response to a key upload.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KeysUploadResponse {
    /// The number of unclaimed one-time keys currently held on the server.
    #[serde(default)]
    pub one_time_key_counts: HashMap<String, u64>,
}

/// A downloaded piece of media.
#[derive(Clone, Debug)]
pub struct MediaResponse {
    /// The raw body.
    pub data: Vec<u8>,
    /// The `Content-Type` of the body, if the server sent one.
    pub content_type: Option<String>,
}

/// The thumbnailing method for media thumbnails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThumbnailMethod {
    /// Scale the image preserving the aspect ratio.
    Scale,
    /// Crop the image to the requested size.
    Crop,
}

impl ThumbnailMethod {
    fn as_str(self) -> &'static str {
        match self {
            ThumbnailMethod::Scale => "scale",
            ThumbnailMethod::Crop => "crop",
        }
    }
}

/// The API client: endpoint construction on top of the [`HttpClient`].
#[derive(Clone, Debug)]
pub(crate) struct Api {
    homeserver: Url,
    http: HttpClient,
}

impl Api {
    /// Create an API client for the given, trailing-slash normalized,
    /// homeserver.
    pub fn new(homeserver: Url, http: HttpClient) -> Self {
        Api { homeserver, http }
    }

    /// The homeserver this client talks to.
    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    /// `POST /_matrix/client/api/v1/login` with a password.
    pub async fn password_login(
        &self,
        user: &str,
        password: &str,
        device_id: Option<&str>,
    ) -> Result<LoginResponse, HttpError> {
        let url = self.homeserver.join("_matrix/client/api/v1/login")?;

        let mut body = serde_json::json!({
            "type": "m.login.password",
            "user": user,
            "password": password,
            "initial_device_display_name": INITIAL_DEVICE_DISPLAY_NAME,
        });
        if let Some(device_id) = device_id {
            body["device_id"] = device_id.into();
        }

        self.request_json(Method::POST, url, Some(&body), None, None).await
    }

    /// `GET /_matrix/client/r0/account/whoami`, used to validate a stored
    /// access token.
    pub async fn whoami(&self, access_token: &str) -> Result<WhoamiResponse, HttpError> {
        let mut url = self.homeserver.join("_matrix/client/r0/account/whoami")?;
        url.query_pairs_mut().append_pair("access_token", access_token);

        self.request_json(Method::GET, url, None, None, None).await
    }

    /// `GET /_matrix/client/r0/sync`.
    ///
    /// The long-poll timeout is added on top of the transport timeout and
    /// the response cap stays at its generous default to accommodate
    /// initial syncs.
    pub async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
        full_state: bool,
        cancel: &RequestHandle,
    ) -> Result<SyncResponse, HttpError> {
        let url = self.sync_url(access_token, since, timeout_ms, full_state)?;

        let config = self
            .http
            .request_config()
            .timeout(self.http.request_config().timeout + Duration::from_millis(timeout_ms));

        self.request_json(Method::GET, url, None, Some(config), Some(cancel)).await
    }

    fn sync_url(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
        full_state: bool,
    ) -> Result<Url, HttpError> {
        let mut url = self.homeserver.join("_matrix/client/r0/sync")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("access_token", access_token);
            query.append_pair("timeout", &timeout_ms.to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
            if full_state {
                query.append_pair("full_state", "true");
            }
        }
        Ok(url)
    }

    /// `PUT /_matrix/client/r0/rooms/{id}/send/{type}/{txn_id}`, idempotent
    /// by transaction id.
    pub async fn send(
        &self,
        access_token: &str,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<SendEventResponse, HttpError> {
        let mut url = self.room_url(room_id, &["send", event_type, txn_id]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        self.request_json(Method::PUT, url, Some(content), None, None).await
    }

    /// `POST /_matrix/client/r0/join/{room-or-alias}`.
    pub async fn join_room(
        &self,
        access_token: &str,
        room: &str,
    ) -> Result<JoinRoomResponse, HttpError> {
        let mut url = self.client_url(&["join", room]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        self.request_json(Method::POST, url, Some(&serde_json::json!({})), None, None).await
    }

    /// `POST /_matrix/client/r0/rooms/{id}/leave`.
    pub async fn leave_room(&self, access_token: &str, room_id: &str) -> Result<(), HttpError> {
        let mut url = self.room_url(room_id, &["leave"]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        self.request_json::<Value>(Method::POST, url, Some(&serde_json::json!({})), None, None)
            .await?;
        Ok(())
    }

    /// `POST /_matrix/client/r0/rooms/{id}/invite`.
    pub async fn invite_user(
        &self,
        access_token: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), HttpError> {
        let mut url = self.room_url(room_id, &["invite"]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        let body = serde_json::json!({ "user_id": user_id });
        self.request_json::<Value>(Method::POST, url, Some(&body), None, None).await?;
        Ok(())
    }

    /// `PUT /_matrix/client/r0/rooms/{id}/typing/{user_id}`.
    pub async fn typing(
        &self,
        access_token: &str,
        room_id: &str,
        user_id: &str,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<(), HttpError> {
        let mut url = self.room_url(room_id, &["typing", user_id]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        let mut body = serde_json::json!({ "typing": typing });
        if typing {
            body["timeout"] = timeout_ms.into();
        }
        self.request_json::<Value>(Method::PUT, url, Some(&body), None, None).await?;
        Ok(())
    }

    /// `POST /_matrix/client/r0/keys/upload`.
    pub async fn upload_keys(
        &self,
        access_token: &str,
        device_keys: Option<&Value>,
        one_time_keys: Option<&Value>,
    ) -> Result<KeysUploadResponse, HttpError> {
        let mut url = self.client_url(&["keys", "upload"]);
        url.query_pairs_mut().append_pair("access_token", access_token);

        let mut body = serde_json::json!({});
        if let Some(device_keys) = device_keys {
            body["device_keys"] = device_keys.clone();
        }
        if let Some(one_time_keys) = one_time_keys {
            body["one_time_keys"] = one_time_keys.clone();
        }

        self.request_json(Method::POST, url, Some(&body), None, None).await
    }

    /// `POST /_matrix/media/r0/upload`, returning the `mxc://` URI.
    pub async fn upload_file(
        &self,
        access_token: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadResponse, HttpError> {
        let mut url = self.homeserver.join("_matrix/media/r0/upload")?;
        url.query_pairs_mut().append_pair("access_token", access_token);

        let request = http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, content_type)
            .body(data)?;

        let response = self.http.send_request(request, None, None).await?;
        Self::decode_json(response)
    }

    /// `GET /_matrix/media/r0/download/{server}/{id}`.
    pub async fn download_file(
        &self,
        uri: &str,
        max_size: usize,
    ) -> Result<MediaResponse, HttpError> {
        let url = self.mxc_to_url("_matrix/media/r0/download/", uri)?;
        self.download(url, max_size).await
    }

    /// `GET /_matrix/media/r0/thumbnail/{server}/{id}`.
    pub async fn download_thumb(
        &self,
        uri: &str,
        max_size: usize,
        width: u32,
        height: u32,
        method: ThumbnailMethod,
    ) -> Result<MediaResponse, HttpError> {
        let mut url = self.mxc_to_url("_matrix/media/r0/thumbnail/", uri)?;
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("method", method.as_str());
        self.download(url, max_size).await
    }

    async fn download(&self, url: Url, max_size: usize) -> Result<MediaResponse, HttpError> {
        let config = self.http.request_config().max_response_size(max_size);
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Vec::new())?;

        let response = self.http.send_request(request, Some(config), None).await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(&response));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        Ok(MediaResponse { data: response.into_body(), content_type })
    }

    /// Map an `mxc://server/id` URI onto a media endpoint of our
    /// homeserver.
    fn mxc_to_url(&self, endpoint: &str, uri: &str) -> Result<Url, HttpError> {
        let suffix = uri.strip_prefix("mxc://").ok_or(HttpError::InvalidMxcUri)?;
        Ok(self.homeserver.join(&format!("{endpoint}{suffix}"))?)
    }

    fn client_url(&self, segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .expect("the homeserver URL is a valid base")
            .extend(["_matrix", "client", "r0"])
            .extend(segments);
        url
    }

    fn room_url(&self, room_id: &str, segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .expect("the homeserver URL is a valid base")
            .extend(["_matrix", "client", "r0", "rooms", room_id])
            .extend(segments);
        url
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        config: Option<RequestConfig>,
        cancel: Option<&RequestHandle>,
    ) -> Result<T, HttpError> {
        debug!(%method, path = url.path(), "sending request");

        let mut builder = http::Request::builder().method(method).uri(url.as_str());
        let body = match body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                serde_json::to_vec(body).map_err(|_| HttpError::InvalidResponse)?
            }
            None => Vec::new(),
        };
        let request = builder.body(body)?;

        let response = self.http.send_request(request, config, cancel).await?;
        Self::decode_json(response)
    }

    fn decode_json<T: DeserializeOwned>(
        response: http::Response<Vec<u8>>,
    ) -> Result<T, HttpError> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(&response));
        }
        serde_json::from_slice(response.body()).map_err(|_| HttpError::InvalidResponse)
    }

    /// Build the user-visible error for a non-2xx response, preferring the
    /// `errcode`/`error` members of a JSON body over the bare status code.
    fn error_from_response(response: &http::Response<Vec<u8>>) -> HttpError {
        let status = response.status().as_u16();
        let message = serde_json::from_slice::<Value>(response.body())
            .ok()
            .and_then(|body| {
                let errcode = body.get("errcode")?.as_str()?.to_owned();
                let error = body.get("error")?.as_str()?.to_owned();
                Some(format!("{errcode}: {error}"))
            })
            .unwrap_or_else(|| status.to_string());

        HttpError::Server { status, message }
    }
}
