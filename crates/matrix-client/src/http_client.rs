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

use std::fmt::Debug;
use std::sync::Arc;

use http::{HeaderValue, Response as HttpResponse};
use reqwest::{Client, Response};
use tokio::sync::watch;
use tracing::trace;

use crate::config::{ClientConfig, RequestConfig};
use crate::error::HttpError;

/// Abstraction around the http layer. This allows implementors to use
/// different http libraries.
#[async_trait::async_trait]
pub trait HttpSend: Send + Sync + Debug {
    /// The method abstracting sending request types and receiving response
    /// types.
    ///
    /// This is called by the client every time it wants to send anything to
    /// a homeserver.
    ///
    /// # Arguments
    ///
    /// * `request` - The http request that the client prepared.
    ///
    /// * `config` - The config used for this request.
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        config: RequestConfig,
    ) -> Result<http::Response<Vec<u8>>, HttpError>;
}

/// A handle that can cancel an in-flight request.
///
/// Cancelling resolves the request with the distinguished
/// [`HttpError::Cancelled`] error, which callers treat as silence rather
/// than as a network failure.
#[derive(Clone, Debug)]
pub struct RequestHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RequestHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandle {
    /// Create a fresh, uncancelled, handle.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        RequestHandle { tx: Arc::new(tx) }
    }

    /// Cancel the request this handle belongs to.
    pub fn cancel(&self) {
        // send_replace updates the value even while nobody is waiting yet.
        self.tx.send_replace(true);
    }

    /// Has this handle been cancelled already?
    pub fn is_cancelled(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The HTTP client all API calls go through.
#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    inner: Arc<dyn HttpSend>,
    request_config: RequestConfig,
}

impl HttpClient {
    /// Build a client backed by reqwest from the given configuration.
    pub fn new(config: &ClientConfig) -> Result<Self, HttpError> {
        Ok(HttpClient {
            inner: Arc::new(client_with_config(config)?),
            request_config: config.request_config,
        })
    }

    /// Build a client on top of a custom transport.
    #[allow(dead_code)]
    pub fn with_sender(sender: Arc<dyn HttpSend>, request_config: RequestConfig) -> Self {
        HttpClient { inner: sender, request_config }
    }

    /// The default request configuration of this client.
    pub fn request_config(&self) -> RequestConfig {
        self.request_config
    }

    /// Send a request, optionally racing it against a cancellation handle.
    pub async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        config: Option<RequestConfig>,
        cancel: Option<&RequestHandle>,
    ) -> Result<http::Response<Vec<u8>>, HttpError> {
        let config = config.unwrap_or(self.request_config);
        let send = self.inner.send_request(request, config);

        match cancel {
            None => send.await,
            Some(handle) => {
                tokio::select! {
                    response = send => response,
                    _ = handle.cancelled() => Err(HttpError::Cancelled),
                }
            }
        }
    }
}

/// Build a reqwest client with the specified configuration.
fn client_with_config(config: &ClientConfig) -> Result<Client, HttpError> {
    let http_client = reqwest::Client::builder();

    let http_client = if config.disable_ssl_verification {
        http_client.danger_accept_invalid_certs(true)
    } else {
        http_client
    };

    let http_client = match &config.proxy {
        Some(p) => http_client.proxy(p.clone()),
        None => http_client,
    };

    let mut headers = reqwest::header::HeaderMap::new();

    let user_agent = match &config.user_agent {
        Some(a) => a.clone(),
        None => HeaderValue::from_str(&format!("matrix-client {}", crate::VERSION))
            .expect("the version header is a valid header value"),
    };

    headers.insert(reqwest::header::USER_AGENT, user_agent);

    Ok(http_client
        .default_headers(headers)
        .timeout(config.request_config.timeout)
        .build()?)
}

async fn response_to_http_response(
    mut response: Response,
    limit: usize,
) -> Result<http::Response<Vec<u8>>, HttpError> {
    let status = response.status();

    if response.content_length().is_some_and(|len| len as usize > limit) {
        return Err(HttpError::ResponseTooLarge);
    }

    let mut http_builder = HttpResponse::builder().status(status);
    let headers = http_builder
        .headers_mut()
        .expect("a fresh response builder has headers");

    for (k, v) in response.headers_mut().drain() {
        if let Some(key) = k {
            headers.insert(key, v);
        }
    }

    let body = response.bytes().await?.as_ref().to_owned();
    if body.len() > limit {
        return Err(HttpError::ResponseTooLarge);
    }

    trace!(status = %status, len = body.len(), "got response");

    Ok(http_builder
        .body(body)
        .expect("the response body is always constructible"))
}

#[async_trait::async_trait]
impl HttpSend for Client {
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        config: RequestConfig,
    ) -> Result<http::Response<Vec<u8>>, HttpError> {
        let mut request = reqwest::Request::try_from(request)?;
        *request.timeout_mut() = Some(config.timeout);

        let response = self.execute(request).await?;
        response_to_http_response(response, config.max_response_size).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RequestHandle;

    #[tokio::test]
    async fn cancelled_resolves_once_cancel_is_called() {
        let handle = RequestHandle::new();
        assert!(!handle.is_cancelled());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() resolves after cancel()")
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let handle = RequestHandle::new();
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .expect("an already cancelled handle resolves immediately");
    }
}
