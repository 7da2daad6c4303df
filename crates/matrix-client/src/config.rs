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

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::time::Duration;

use http::HeaderValue;

use crate::error::HttpError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The default cap on response bodies. Initial syncs can be large, so this
/// is generous.
pub(crate) const DEFAULT_RESPONSE_LIMIT: usize = 40 * 1024 * 1024;

/// Configuration for requests the client makes.
#[derive(Copy, Clone)]
pub struct RequestConfig {
    pub(crate) timeout: Duration,
    pub(crate) max_response_size: usize,
}

impl Debug for RequestConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RequestConfig")
            .field("timeout", &self.timeout)
            .field("max_response_size", &self.max_response_size)
            .finish()
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_size: DEFAULT_RESPONSE_LIMIT,
        }
    }
}

impl RequestConfig {
    /// Create a new default `RequestConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the timeout for the whole request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum accepted response body size.
    #[must_use]
    pub fn max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }
}

/// Configuration for the client.
#[derive(Default)]
pub struct ClientConfig {
    pub(crate) proxy: Option<reqwest::Proxy>,
    pub(crate) user_agent: Option<HeaderValue>,
    pub(crate) disable_ssl_verification: bool,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) request_config: RequestConfig,
}

impl Debug for ClientConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ClientConfig")
            .field("proxy", &self.proxy)
            .field("user_agent", &self.user_agent)
            .field("disable_ssl_verification", &self.disable_ssl_verification)
            .field("data_dir", &self.data_dir)
            .field("request_config", &self.request_config)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new default `ClientConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Route all requests through an HTTP proxy.
    ///
    /// The request target becomes the absolute URL and the proxy receives
    /// any configured authorization, matching how a direct connection would
    /// use path-only targets.
    pub fn proxy(mut self, proxy_url: &str) -> Result<Self, HttpError> {
        self.proxy = Some(reqwest::Proxy::all(proxy_url)?);
        Ok(self)
    }

    /// Disable TLS certificate verification. For debugging setups only.
    #[must_use]
    pub fn disable_ssl_verification(mut self) -> Self {
        self.disable_ssl_verification = true;
        self
    }

    /// Set the `User-Agent` header sent with every request.
    pub fn user_agent(mut self, user_agent: &str) -> Result<Self, HttpError> {
        self.user_agent = Some(
            HeaderValue::from_str(user_agent)
                .map_err(|e| HttpError::Http(e.into()))?,
        );
        Ok(self)
    }

    /// The directory holding the per-account session database.
    ///
    /// Defaults to the system temporary directory.
    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Override the default request configuration.
    #[must_use]
    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }
}
