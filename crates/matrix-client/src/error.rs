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

use matrix_client_base::ErrorKind;
use thiserror::Error;

/// Result type of the client crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for the HTTP layer and API client.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The transport failed before a response arrived.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// Building the request failed.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// A URL could not be constructed.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The request was cancelled by the caller.
    ///
    /// Cancellation is not a network failure and never errors the
    /// connection.
    #[error("cancelled")]
    Cancelled,

    /// The response could not be decoded where a JSON body is required.
    #[error("Invalid response from homeserver")]
    InvalidResponse,

    /// The response body exceeded the configured size cap.
    #[error("response from homeserver exceeded the size limit")]
    ResponseTooLarge,

    /// The homeserver answered with a non-2xx status.
    #[error("Error from home server: {message}")]
    Server {
        /// The HTTP status code.
        status: u16,
        /// `<errcode>: <error>` when the body was JSON, otherwise the
        /// status code.
        message: String,
    },

    /// A media URI did not start with `mxc://`.
    #[error("invalid mxc URI")]
    InvalidMxcUri,
}

impl HttpError {
    /// True for the distinguished cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HttpError::Cancelled)
    }

    /// The error class to report to the application.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Reqwest(_)
            | HttpError::Http(_)
            | HttpError::InvalidResponse
            | HttpError::ResponseTooLarge => ErrorKind::Network,
            _ => ErrorKind::Other,
        }
    }
}

/// Error type of the client crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An HTTP request failed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The end-to-end encryption subsystem failed.
    #[error(transparent)]
    Crypto(#[from] matrix_client_crypto::CryptoError),

    /// Serializing or deserializing persisted state failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Creating the data directory failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The login response did not contain an access token.
    #[error("No access_token in /login response")]
    MissingAccessToken,

    /// The sync response did not contain a `next_batch` token.
    #[error("No next_batch field")]
    MissingNextBatch,

    /// No stored token and no password to log in with.
    #[error("a password is required to log in")]
    AuthenticationRequired,

    /// An operation referenced a room we are not joined to.
    #[error("unknown room {0}")]
    UnknownRoom(String),

    /// An operation that needs a session was attempted before login.
    #[error("the client is not logged in")]
    NotLoggedIn,
}

impl Error {
    /// True for the distinguished cancellation error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Http(e) if e.is_cancelled())
    }

    /// The error class to report to the application.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Http(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }
}
