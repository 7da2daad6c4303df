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

use thiserror::Error;

/// Result type of the crypto crate.
pub type Result<T, E = CryptoError> = std::result::Result<T, E>;

/// Error type of the crypto crate.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The stored account record names a different device or homeserver
    /// than the current connection.
    #[error("device id or homeserver doesn't match for the stored account")]
    AccountMismatch,

    /// An account or session pickle could not be decrypted or decoded.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// A message or key could not be decoded from its base64 transport
    /// form.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// A public key was malformed.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// A signature was malformed or did not verify.
    #[error(transparent)]
    Signature(#[from] vodozemac::SignatureError),

    /// Creating an inbound Olm session from a pre-key message failed.
    #[error(transparent)]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// Decrypting an Olm message failed.
    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// A Megolm session key could not be decoded.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// The session database failed.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    /// (De)serializing persisted crypto state failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The object given to the signing routines was not a JSON object.
    #[error("only JSON objects can be signed")]
    NotAnObject,

    /// No stored session was able to decrypt a normal Olm message.
    #[error("no established session matched the message")]
    MissingSession,
}
