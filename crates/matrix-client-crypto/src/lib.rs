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

//! End-to-end encryption support for the Matrix client.
//!
//! The [`OlmMachine`] owns the device's Olm account and its session
//! material: it produces the signed device keys and one-time keys that the
//! client uploads, and it decrypts the device-to-device Olm messages that
//! carry Megolm room keys towards us. Key material is persisted through an
//! encrypted account pickle and a per-account SQLite database.
#![deny(missing_docs)]

mod account;
mod canonical_json;
mod error;
mod machine;
mod sessions;
mod store;

pub use account::{Account, StoredAccount};
pub use canonical_json::{canonical_json, jws_to_base64};
pub use error::{CryptoError, Result};
pub use machine::{DecryptedOlmEvent, OlmMachine};
pub use sessions::{GroupSessionIndex, InboundGroupSessionKey, Session};
pub use store::CryptoStore;
