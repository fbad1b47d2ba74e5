//! HTTP transport implementation.
//!
//! [`HttpTransport`] maps the request channel onto the relay's REST surface
//! with JSON bodies. The actual HTTP client is abstracted via [`HttpClient`]
//! so any library (reqwest, hyper, ureq) or an in-process loopback can carry
//! the requests.

use crate::error::{ChannelError, TransportResult};
use crate::transport::RequestChannel;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::debug;
use vaultsync_protocol::{
    decode_body, status, AuthRequest, AuthResponse, CreateItemRequest, CreateItemResponse,
    DeleteItemRequest, Endpoint, HttpRequest, HttpResponse, ItemId, ManifestEntry,
    ManifestResponse, Method, RemoteItem, UpdateItemRequest, UpdateItemResponse, VaultId,
};

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request to `url` and returns the response.
    ///
    /// `Err` means no response was received (connection refused, reset, DNS).
    async fn send(&self, url: &str, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// HTTP-based request channel.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the relay (e.g., "https://relay.example.com/api/v1").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn exchange(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = ?request.method, %url, "relay request");

        let response = self.client.send(&url, request).await.map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            ChannelError::transport_retryable(e)
        })?;

        if response.is_success() {
            *self.last_error.write() = None;
            Ok(response)
        } else {
            let err = status_error(&response);
            *self.last_error.write() = Some(err.to_string());
            Err(err)
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest) -> TransportResult<T> {
        let response = self.exchange(request).await?;
        Ok(decode_body(&response.body)?)
    }
}

/// Maps a non-2xx response onto the channel error taxonomy.
fn status_error(response: &HttpResponse) -> ChannelError {
    let body = response.error_body();
    match response.status {
        status::UNAUTHORIZED => ChannelError::Unauthorized(body.error),
        status::NOT_FOUND => ChannelError::NotFound(body.error),
        status::CONFLICT => match body.current_version {
            Some(current_version) => ChannelError::VersionConflict { current_version },
            None => ChannelError::Protocol(format!("409 without currentVersion: {}", body.error)),
        },
        code if code >= 500 => ChannelError::transport_retryable(format!("{code}: {}", body.error)),
        code => ChannelError::Protocol(format!("{code}: {}", body.error)),
    }
}

#[async_trait]
impl<C: HttpClient> RequestChannel for HttpTransport<C> {
    async fn authenticate(&self, request: &AuthRequest) -> TransportResult<AuthResponse> {
        let request = HttpRequest::new(Method::Post, &Endpoint::Authenticate).with_json(request)?;
        self.call(request).await
    }

    async fn fetch_manifest(
        &self,
        token: &str,
        vault_id: &VaultId,
    ) -> TransportResult<Vec<ManifestEntry>> {
        vault_id.validate()?;
        let request =
            HttpRequest::new(Method::Get, &Endpoint::Manifest(vault_id.clone())).with_bearer(token);
        let manifest: ManifestResponse = self.call(request).await?;
        Ok(manifest.entries)
    }

    async fn create_item(
        &self,
        token: &str,
        request: &CreateItemRequest,
    ) -> TransportResult<CreateItemResponse> {
        let request = HttpRequest::new(Method::Post, &Endpoint::Items)
            .with_bearer(token)
            .with_json(request)?;
        self.call(request).await
    }

    async fn update_item(
        &self,
        token: &str,
        item_id: &ItemId,
        request: &UpdateItemRequest,
    ) -> TransportResult<UpdateItemResponse> {
        item_id.validate()?;
        let request = HttpRequest::new(Method::Put, &Endpoint::Item(item_id.clone()))
            .with_bearer(token)
            .with_json(request)?;
        self.call(request).await
    }

    async fn fetch_item(&self, token: &str, item_id: &ItemId) -> TransportResult<RemoteItem> {
        item_id.validate()?;
        let request =
            HttpRequest::new(Method::Get, &Endpoint::Item(item_id.clone())).with_bearer(token);
        self.call(request).await
    }

    async fn delete_item(
        &self,
        token: &str,
        item_id: &ItemId,
        request: &DeleteItemRequest,
    ) -> TransportResult<()> {
        item_id.validate()?;
        let request = HttpRequest::new(Method::Delete, &Endpoint::Item(item_id.clone()))
            .with_bearer(token)
            .with_json(request)?;
        self.exchange(request).await.map(|_| ())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// A loopback HTTP client that routes requests directly to an in-process relay.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, _url: &str, request: HttpRequest) -> Result<HttpResponse, String> {
        Ok(self.server.handle(&request))
    }
}
