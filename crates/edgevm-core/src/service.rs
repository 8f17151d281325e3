//! Process-wide service: engine, module source and compilation cache.
//!
//! A [`Service`] hands out at most one [`Instance`] per execution context
//! and caches compiled modules by content hash, so every runtime of every
//! instance shares one compilation of the same bytes. The cache holds at
//! most `EngineConfig::module_cache_capacity` modules and evicts the oldest
//! compilation first.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use uuid::Uuid;

use crate::module::compute_hash;
use crate::source::Source;
use crate::{CompiledModule, ExecutionContext, Instance, WasmEngine};
use edgevm_common::{ExecutionConfig, RuntimeConfig, RuntimeError};

/// Shared engine, source and caches. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    engine: WasmEngine,
    source: Arc<dyn Source>,
    /// Contexts with a live instance.
    instances: DashMap<Uuid, ()>,
    /// Compiled modules by content hash.
    modules: DashMap<String, CompiledModule>,
    cache_capacity: usize,
}

impl Service {
    pub fn new(engine: WasmEngine, source: Arc<dyn Source>) -> Self {
        let cache_capacity = engine.config().module_cache_capacity;
        Self {
            inner: Arc::new(ServiceInner {
                engine,
                source,
                instances: DashMap::new(),
                modules: DashMap::new(),
                cache_capacity,
            }),
        }
    }

    /// Build the engine from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine configuration is invalid.
    pub fn from_config(config: &RuntimeConfig, source: Arc<dyn Source>) -> Result<Self, RuntimeError> {
        Ok(Self::new(WasmEngine::new(&config.engine)?, source))
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.inner.engine
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.inner.source
    }

    /// Create the instance for `ctx`.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstanceExists`] if `ctx` already has a live
    /// instance, or an error if the filesystem or output captures cannot
    /// be created.
    pub fn instance(
        &self,
        ctx: ExecutionContext,
        config: ExecutionConfig,
    ) -> Result<Instance, RuntimeError> {
        let id = ctx.id();
        match self.inner.instances.entry(id) {
            Entry::Occupied(_) => {
                return Err(RuntimeError::InstanceExists {
                    context: id.to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        // Instance::new releases the id on failure
        let instance = Instance::new(self.clone(), ctx, config)?;
        info!(context = %id, "Instance created");
        Ok(instance)
    }

    /// Number of contexts with a live instance.
    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    pub(crate) fn release(&self, id: Uuid) {
        if self.inner.instances.remove(&id).is_some() {
            debug!(context = %id, "Instance released");
        }
    }

    /// Compile `bytes`, reusing an earlier compilation of the same content.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the engine rejects the
    /// module.
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        let hash = compute_hash(bytes);
        if let Some(module) = self.inner.modules.get(&hash) {
            debug!(content_hash = %hash, "Compilation cache hit");
            return Ok(module.clone());
        }

        let module = CompiledModule::compile(self.inner.engine.inner(), bytes)?;
        if self.inner.cache_capacity > 0 {
            self.evict_to(self.inner.cache_capacity - 1);
            self.inner.modules.insert(hash, module.clone());
        }
        Ok(module)
    }

    /// Drop the oldest compilations until at most `len` remain.
    fn evict_to(&self, len: usize) {
        while self.inner.modules.len() > len {
            let oldest = self
                .inner
                .modules
                .iter()
                .min_by_key(|entry| entry.value().compiled_at())
                .map(|entry| entry.key().clone());
            let Some(hash) = oldest else {
                break;
            };
            self.inner.modules.remove(&hash);
            debug!(content_hash = %hash, "Compiled module evicted");
        }
    }

    /// Returns `true` if a compilation with `content_hash` is cached.
    pub fn is_cached(&self, content_hash: &str) -> bool {
        self.inner.modules.contains_key(content_hash)
    }

    /// Number of cached compilations.
    pub fn cached_modules(&self) -> usize {
        self.inner.modules.len()
    }

    /// Drop every cached compilation.
    pub fn clear_cache(&self) {
        self.inner.modules.clear();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("instances", &self.inner.instances.len())
            .field("modules", &self.inner.modules.len())
            .finish_non_exhaustive()
    }
}
