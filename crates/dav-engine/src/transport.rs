//! HTTP transport for cross-server MOVE/COPY.
//!
//! The remote server is expected to implement the same protocol: documents
//! are uploaded with `PUT`, collections created with `MKCOL` and replaced
//! resources removed with `DELETE`. A non-overwriting upload carries
//! `If-None-Match: *` so an existing remote document answers
//! `412 Precondition Failed` instead of being replaced.

use crate::config::RemoteConfig;
use crate::error::TransportError;
use crate::store::ByteStream;
use async_trait::async_trait;
use reqwest::{Body, Client, Method, StatusCode};
use tracing::{debug, instrument};
use url::Url;

/// What a successful upload did at the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// A new document was created (`201`).
    Created,
    /// An existing document was replaced (`200`/`204`).
    Replaced,
}

/// Client side of a remote transfer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream `body` to `url`.
    async fn upload(
        &self,
        url: &Url,
        body: ByteStream,
        overwrite: bool,
    ) -> Result<UploadOutcome, TransportError>;

    /// Delete the resource at `url`.
    async fn delete(&self, url: &Url) -> Result<(), TransportError>;

    /// Create a collection at `url`.
    async fn make_collection(&self, url: &Url) -> Result<(), TransportError>;
}

/// URL of the member `name` below the collection at `base`.
pub fn child_url(base: &Url, name: &str) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| TransportError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    mkcol: Method,
}

impl HttpTransport {
    /// Build a transport from the remote settings.
    pub fn new(config: &RemoteConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Self::with_client(client)
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Result<Self, TransportError> {
        let mkcol = Method::from_bytes(b"MKCOL").map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client, mkcol })
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<StatusCode, TransportError> {
        let response = request.send().await.map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(status)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(level = "debug", skip(self, body), fields(url = %url))]
    async fn upload(
        &self,
        url: &Url,
        body: ByteStream,
        overwrite: bool,
    ) -> Result<UploadOutcome, TransportError> {
        let mut request = self
            .client
            .put(url.clone())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .body(Body::wrap_stream(body));
        if !overwrite {
            request = request.header(reqwest::header::IF_NONE_MATCH, "*");
        }

        let status = self.send(request, url).await?;
        debug!(%status, "Upload accepted");
        Ok(if status == StatusCode::CREATED {
            UploadOutcome::Created
        } else {
            UploadOutcome::Replaced
        })
    }

    #[instrument(level = "debug", skip(self), fields(url = %url))]
    async fn delete(&self, url: &Url) -> Result<(), TransportError> {
        self.send(self.client.delete(url.clone()), url).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(url = %url))]
    async fn make_collection(&self, url: &Url) -> Result<(), TransportError> {
        self.send(self.client.request(self.mkcol.clone(), url.clone()), url)
            .await?;
        Ok(())
    }
}
