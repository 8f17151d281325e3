//! Module source chain.
//!
//! A runtime asks its service's [`Source`] for module bytes by name. The
//! shipped source is a two-step chain:
//!
//! ```text
//! name ──Resolver::lookup──▶ Url ──Loader::load──▶ bytes
//!                                  │
//!                                  └─ BackendLoader: dispatch on scheme
//!                                       file  → FileBackend
//!                                       http* → HttpBackend
//!                                       mem   → MemoryBackend
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, instrument};
use url::Url;

use crate::ExecutionContext;
use edgevm_common::{ModuleEntry, RuntimeError};

/// Bytes of one module plus where they came from.
#[derive(Debug, Clone)]
pub struct SourceModule {
    name: String,
    uri: Option<Url>,
    bytes: Bytes,
}

impl SourceModule {
    pub fn new(name: impl Into<String>, uri: Option<Url>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            uri,
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locator the bytes were loaded from, if any.
    pub fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }

    /// Binary or text module content.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Resolves a module name to its bytes.
#[async_trait]
pub trait Source: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if the name is unknown.
    async fn module(&self, ctx: &ExecutionContext, name: &str)
    -> Result<SourceModule, RuntimeError>;
}

/// Maps a module name to a locator.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, ctx: &ExecutionContext, name: &str) -> Result<Url, RuntimeError>;
}

/// Fetches the bytes behind a locator.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, ctx: &ExecutionContext, uri: &Url) -> Result<Bytes, RuntimeError>;

    /// Release held resources.
    async fn close(&self) {}
}

/// Fetches bytes for the URL schemes it serves.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Schemes served, lowercase.
    fn schemes(&self) -> &[&'static str];

    async fn get(&self, uri: &Url) -> Result<Bytes, RuntimeError>;

    async fn close(&self) {}
}

/// [`Source`] built from a [`Resolver`] and a [`Loader`].
#[derive(Clone)]
pub struct ResolvingSource {
    resolver: Arc<dyn Resolver>,
    loader: Arc<dyn Loader>,
}

impl ResolvingSource {
    pub fn new(resolver: Arc<dyn Resolver>, loader: Arc<dyn Loader>) -> Self {
        Self { resolver, loader }
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.loader
    }
}

#[async_trait]
impl Source for ResolvingSource {
    #[instrument(skip(self, ctx), fields(context = %ctx.id()))]
    async fn module(
        &self,
        ctx: &ExecutionContext,
        name: &str,
    ) -> Result<SourceModule, RuntimeError> {
        let uri = self.resolver.lookup(ctx, name).await?;
        debug!(uri = %uri, "Module resolved");

        let bytes = self.loader.load(ctx, &uri).await?;
        Ok(SourceModule::new(name, Some(uri), bytes))
    }
}

impl std::fmt::Debug for ResolvingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvingSource").finish_non_exhaustive()
    }
}

/// [`Loader`] dispatching on the locator's scheme.
#[derive(Default, Clone)]
pub struct BackendLoader {
    backends: HashMap<&'static str, Arc<dyn Backend>>,
}

impl BackendLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for each of its schemes, replacing earlier ones.
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        for scheme in backend.schemes() {
            self.backends.insert(*scheme, Arc::clone(&backend));
        }
        self
    }

    /// Returns `true` if a backend serves `scheme`.
    pub fn supports(&self, scheme: &str) -> bool {
        self.backends.contains_key(scheme)
    }
}

#[async_trait]
impl Loader for BackendLoader {
    async fn load(&self, ctx: &ExecutionContext, uri: &Url) -> Result<Bytes, RuntimeError> {
        if ctx.is_cancelled() {
            return Err(RuntimeError::backend(uri.as_str(), "context cancelled"));
        }
        let backend = self.backends.get(uri.scheme()).ok_or_else(|| {
            RuntimeError::backend(uri.as_str(), format!("no backend for scheme `{}`", uri.scheme()))
        })?;

        tokio::select! {
            bytes = backend.get(uri) => bytes,
            () = ctx.cancelled() => Err(RuntimeError::backend(uri.as_str(), "context cancelled")),
        }
    }

    async fn close(&self) {
        for backend in self.backends.values() {
            backend.close().await;
        }
    }
}

impl std::fmt::Debug for BackendLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.backends.keys().collect();
        schemes.sort();
        f.debug_struct("BackendLoader")
            .field("schemes", &schemes)
            .finish()
    }
}

/// [`Resolver`] over a fixed name table.
///
/// Names missing from the table that already parse as an absolute URL
/// resolve to themselves.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: RwLock<HashMap<String, Url>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration file entries. Later entries win.
    pub fn from_entries<'e>(entries: impl IntoIterator<Item = &'e ModuleEntry>) -> Self {
        let resolver = Self::new();
        for entry in entries {
            resolver.insert(entry.name.clone(), entry.uri.clone());
        }
        resolver
    }

    /// Map `name` to `uri`, returning the previous locator.
    pub fn insert(&self, name: impl Into<String>, uri: Url) -> Option<Url> {
        self.entries.write().insert(name.into(), uri)
    }

    pub fn remove(&self, name: &str) -> Option<Url> {
        self.entries.write().remove(name)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, _ctx: &ExecutionContext, name: &str) -> Result<Url, RuntimeError> {
        if let Some(uri) = self.entries.read().get(name) {
            return Ok(uri.clone());
        }
        Url::parse(name).map_err(|_| RuntimeError::module_not_found(name))
    }
}
