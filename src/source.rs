//! External collaborator seams: content source, bundled assets, installer
//!
//! The engine never talks to the network or the archive format directly; it
//! goes through the traits here so tests can substitute in-memory fakes. The
//! production [`HttpSource`] implements the content seam over HTTP with
//! byte-range resume support.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// Stream of content chunks from a source
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response to a (possibly ranged) content fetch
pub struct FetchResponse {
    /// Whether the source honored the requested offset
    ///
    /// `false` with a non-zero requested offset means the source degraded to
    /// a full transfer: the stream starts at byte 0 and the caller must
    /// restart the file instead of appending.
    pub resumed: bool,
    /// Content bytes, starting at the honored offset
    pub stream: ByteStream,
}

/// Remote manifest/content source
///
/// `fetch_range` supports resuming from a byte offset; a source without
/// range support reports `resumed: false` and the download degrades to a
/// full re-download.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch and verify the remote manifest
    async fn fetch_manifest(&self) -> Result<Manifest>;

    /// Fetch content for a manifest path, starting at `offset`
    async fn fetch_range(&self, path: &str, offset: u64) -> Result<FetchResponse>;

    /// Declared size of a content path, if the source can report it cheaply
    async fn content_length(&self, path: &str) -> Result<Option<u64>>;
}

/// Read-only bundled-asset source, used when the local manifest is missing
/// or unreadable
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Extract the bundled assets into `dest`, returning bytes written
    async fn extract(&self, dest: &Path) -> Result<u64>;
}

/// External install step invoked by the installer flow's Postprocess
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the extracted package rooted at `package_dir`
    async fn install(&self, package_dir: &Path) -> Result<()>;
}

/// HTTP implementation of [`ContentSource`]
///
/// Issues `Range: bytes=offset-` requests for resumption. A `200 OK` answer
/// to a ranged request means the server ignored the range; the response is
/// surfaced with `resumed: false` so the scheduler restarts the file.
pub struct HttpSource {
    client: reqwest::Client,
    manifest_url: Url,
    content_base: Url,
}

impl HttpSource {
    /// Create a source fetching the manifest from `manifest_url` and content
    /// files relative to `content_base`
    pub fn new(manifest_url: Url, content_base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            manifest_url,
            content_base,
        }
    }

    /// Same as [`HttpSource::new`] with a caller-configured client
    /// (custom timeouts, proxies)
    pub fn with_client(client: reqwest::Client, manifest_url: Url, content_base: Url) -> Self {
        Self {
            client,
            manifest_url,
            content_base,
        }
    }

    fn content_url(&self, path: &str) -> Result<Url> {
        Ok(self.content_base.join(path)?)
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        debug!(url = %self.manifest_url, "fetching remote manifest");
        let response = self
            .client
            .get(self.manifest_url.clone())
            .send()
            .await
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::ManifestFetch(format!(
                "{} returned {}",
                self.manifest_url,
                response.status()
            )));
        }
        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| Error::ManifestFetch(format!("invalid manifest body: {e}")))?;
        if !manifest.verify_signature() {
            return Err(Error::ManifestFetch(format!(
                "remote manifest signature mismatch (version {})",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    async fn fetch_range(&self, path: &str, offset: u64) -> Result<FetchResponse> {
        let url = self.content_url(path)?;
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;

        let resumed = match response.status() {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK => {
                if offset > 0 {
                    warn!(%url, offset, "server ignored range request, restarting file");
                }
                offset == 0
            }
            status => {
                return Err(Error::Other(format!("{url} returned {status}")));
            }
        };

        let stream = response
            .bytes_stream()
            .map_err(Error::Network)
            .boxed();
        Ok(FetchResponse { resumed, stream })
    }

    async fn content_length(&self, path: &str) -> Result<Option<u64>> {
        let url = self.content_url(path)?;
        let response = self.client.head(url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }
}
