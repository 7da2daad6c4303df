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

//! This crate implements the IO half of the Matrix client: the HTTP API
//! client, the long-polling sync engine with its liveness watchdog, and
//! the outbound event queue worker.
//!
//! The in-memory room model lives in `matrix-client-base` and the Olm
//! device lifecycle in `matrix-client-crypto`; both are re-exported here.
#![deny(missing_docs)]

mod api;
mod client;
mod config;
mod error;
mod http_client;
mod store;
mod sync;

pub use api::{
    JoinRoomResponse, KeysUploadResponse, LoginResponse, MediaResponse, SendEventResponse,
    ThumbnailMethod, UploadResponse, WhoamiResponse,
};
pub use client::Client;
pub use config::{ClientConfig, RequestConfig};
pub use error::{Error, HttpError, Result};
pub use http_client::{HttpSend, RequestHandle};
pub use store::{
    CredentialStore, MemoryStore, DEFAULT_HOME_SERVER, KEY_ACCESS_TOKEN, KEY_DEVICE_ID,
    KEY_HOME_SERVER, KEY_NEXT_BATCH, KEY_OLM_ACCOUNT, KEY_SKIP_OLD_MESSAGES,
};
pub use sync::{ConnectionState, SyncSettings};

pub use matrix_client_base as base;
pub use matrix_client_base::{
    ErrorKind, EventEmitter, MemberDiff, Session, SyncResponse, TimelineMessage, TxnId,
};
pub use matrix_client_crypto as crypto;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");
