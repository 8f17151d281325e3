//! WebAssembly module compilation and import scanning.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that records a content hash (the service-wide compilation cache key) and
//! answers the questions dependency resolution asks about a module's imports.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use edgevm_common::RuntimeError;

/// Name of the builtin host module every runtime defines.
pub const ENV_MODULE: &str = "env";

/// Import that opts a module into the ready handshake.
pub const READY_IMPORT: &str = "_ready";

/// Export run after instantiation when present.
pub const START_EXPORT: &str = "_start";

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across runtimes
/// created from the same engine.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// Hash of the original module bytes.
    content_hash: String,

    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from either binary or text bytes.
    ///
    /// Bytes starting with the WebAssembly magic number are compiled as a
    /// binary module; anything else must be UTF-8 WAT.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        if bytes.starts_with(b"\0asm") {
            return Self::from_bytes(engine, bytes);
        }

        let wat = std::str::from_utf8(bytes).map_err(|_| {
            RuntimeError::compilation_failed("Invalid Wasm: neither binary nor UTF-8 text")
        })?;
        Self::from_wat(engine, wat)
    }

    /// Compile a module from WebAssembly binary bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Get the content hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Distinct import module names in first-seen order.
    pub fn import_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for import in self.inner.imports() {
            if !names.iter().any(|n| n == import.module()) {
                names.push(import.module().to_string());
            }
        }
        names
    }

    /// Returns `true` if the module imports `module.name`.
    pub fn imports(&self, module: &str, name: &str) -> bool {
        self.inner
            .imports()
            .any(|i| i.module() == module && i.name() == name)
    }

    /// Returns `true` if the module imports the ready signal from `env`.
    pub fn imports_ready(&self) -> bool {
        self.imports(ENV_MODULE, READY_IMPORT)
    }

    /// Returns `true` if the module exports a `_start` function.
    pub fn exports_start(&self) -> bool {
        matches!(
            self.inner.get_export(START_EXPORT),
            Some(ExternType::Func(_))
        )
    }

    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
pub(crate) fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
