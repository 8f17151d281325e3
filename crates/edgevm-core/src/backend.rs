//! Shipped [`Backend`] implementations.
//!
//! - [`FileBackend`]: `file://` locators, read with `tokio::fs`
//! - [`HttpBackend`]: `http(s)://` locators, fetched with `reqwest`
//! - [`MemoryBackend`]: `mem://` locators, an in-process registry

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use crate::source::Backend;
use edgevm_common::RuntimeError;

/// Largest module body the HTTP backend accepts.
const MAX_HTTP_MODULE_SIZE: usize = 64 * 1024 * 1024;

/// Reads modules from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackend;

#[async_trait]
impl Backend for FileBackend {
    fn schemes(&self) -> &[&'static str] {
        &["file"]
    }

    async fn get(&self, uri: &Url) -> Result<Bytes, RuntimeError> {
        let path = uri
            .to_file_path()
            .map_err(|()| RuntimeError::backend(uri.as_str(), "not a local file path"))?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RuntimeError::backend(uri.as_str(), e))?;
        debug!(path = %path.display(), size = bytes.len(), "Module read from file");

        Ok(Bytes::from(bytes))
    }
}

/// Fetches modules over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    max_module_size: usize,
}

impl HttpBackend {
    /// Create a backend with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("edgevm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client))
    }

    /// Use a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_module_size: MAX_HTTP_MODULE_SIZE,
        }
    }

    /// Refuse bodies larger than `bytes`.
    #[must_use]
    pub fn with_max_module_size(mut self, bytes: usize) -> Self {
        self.max_module_size = bytes;
        self
    }
}

/// Response body accumulator with a size cap.
#[derive(Debug)]
struct CappedBody {
    buf: BytesMut,
    limit: usize,
}

impl CappedBody {
    fn new(limit: usize, hint: Option<u64>) -> Self {
        let hint = hint.and_then(|len| usize::try_from(len).ok()).unwrap_or(0);
        Self {
            buf: BytesMut::with_capacity(hint.min(limit)),
            limit,
        }
    }

    /// Append `chunk`. Returns `false`, leaving the body unchanged, if it
    /// would grow past the limit.
    fn push(&mut self, chunk: &[u8]) -> bool {
        if self.buf.len() + chunk.len() > self.limit {
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    #[instrument(skip(self), fields(uri = %uri))]
    async fn get(&self, uri: &Url) -> Result<Bytes, RuntimeError> {
        let fail = |e: reqwest::Error| RuntimeError::backend(uri.as_str(), e);

        let mut response = self
            .client
            .get(uri.clone())
            .send()
            .await
            .map_err(fail)?
            .error_for_status()
            .map_err(fail)?;

        let too_large = || RuntimeError::backend(uri.as_str(), "module too large");
        let declared = response.content_length();
        if declared.is_some_and(|len| len > self.max_module_size as u64) {
            return Err(too_large());
        }

        // Chunked responses carry no length, so the cap is enforced while reading
        let mut body = CappedBody::new(self.max_module_size, declared);
        while let Some(chunk) = response.chunk().await.map_err(fail)? {
            if !body.push(&chunk) {
                return Err(too_large());
            }
        }
        let body = body.finish();
        debug!(size = body.len(), "Module fetched");

        Ok(body)
    }
}

/// In-process module registry under `mem://` locators.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    modules: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `key` and return its locator, `mem://<key>`.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` does not form a valid locator.
    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) -> Result<Url, RuntimeError> {
        let uri = Url::parse(&format!("mem://{key}"))
            .map_err(|e| RuntimeError::backend(format!("mem://{key}"), e))?;
        self.modules.insert(uri.as_str().to_string(), bytes.into());
        Ok(uri)
    }

    pub fn remove(&self, uri: &Url) -> Option<Bytes> {
        self.modules.remove(uri.as_str()).map(|(_, bytes)| bytes)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn schemes(&self) -> &[&'static str] {
        &["mem"]
    }

    async fn get(&self, uri: &Url) -> Result<Bytes, RuntimeError> {
        self.modules
            .get(uri.as_str())
            .map(|bytes| bytes.clone())
            .ok_or_else(|| RuntimeError::backend(uri.as_str(), "no such module"))
    }

    async fn close(&self) {
        self.modules.clear();
    }
}
