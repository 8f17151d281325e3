//! Configuration structures for edgevm.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, yielding)
//! - [`ExecutionConfig`]: Per-instance execution tuning (memory limit, output mode, fuel)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly page in bytes.
pub const PAGE_SIZE: u64 = 65_536;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for edgevm.
/// It can be loaded from files (TOML, JSON) or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default per-instance execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the process-wide engine shared by every
/// instance created from one service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Fuel consumed between two cooperative yields of running guest code.
    ///
    /// Guest code only observes cancellation at yield points, so smaller
    /// values make cancellation more responsive.
    #[serde(default = "defaults::fuel_yield_interval")]
    pub fuel_yield_interval: u64,

    /// Enable epoch-based interruption.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Compiled modules kept in the content-hash cache. The oldest
    /// compilation is evicted first; `0` disables caching.
    #[serde(default = "defaults::module_cache_capacity")]
    pub module_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            fuel_yield_interval: defaults::fuel_yield_interval(),
            epoch_interruption: defaults::epoch_interruption(),
            module_cache_capacity: defaults::module_cache_capacity(),
        }
    }
}

/// Where an instance's captured stdout/stderr live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// OS-level temporary files opened for simultaneous read and write.
    Pipe,
    /// Fixed-capacity in-memory ring buffer.
    #[default]
    Buffer,
}

/// Per-instance execution configuration.
///
/// Supplied when an instance is created and immutable afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum linear memory per guest memory, in 64 KiB pages.
    #[serde(default = "defaults::memory_limit_pages")]
    pub memory_limit_pages: u32,

    /// Backing store for captured stdout/stderr.
    #[serde(default)]
    pub output: OutputMode,

    /// Capacity in bytes of each in-memory output ring.
    ///
    /// Only effective in [`OutputMode::Buffer`].
    #[serde(default = "defaults::buffer_capacity")]
    pub buffer_capacity: usize,

    /// Fuel granted to each runtime store. `None` means unlimited.
    #[serde(default)]
    pub max_fuel: Option<u64>,

    /// Milliseconds a store user queues behind a start routine that kept
    /// running after signalling ready, before failing as busy.
    #[serde(default = "defaults::store_wait_ms")]
    pub store_wait_ms: u64,

    /// Seed for the guests' random source. `None` binds the OS generator.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: defaults::memory_limit_pages(),
            output: OutputMode::default(),
            buffer_capacity: defaults::buffer_capacity(),
            max_fuel: None,
            store_wait_ms: defaults::store_wait_ms(),
            random_seed: None,
        }
    }
}

impl ExecutionConfig {
    /// Memory limit in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        u64::from(self.memory_limit_pages) * PAGE_SIZE
    }

    /// Fuel to seed a store with.
    pub fn fuel(&self) -> u64 {
        self.max_fuel.unwrap_or(u64::MAX)
    }

    /// How long a store user waits behind a serving start routine.
    pub fn store_wait(&self) -> Duration {
        Duration::from_millis(self.store_wait_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_yield_interval() -> u64 {
        10_000
    }

    pub const fn epoch_interruption() -> bool {
        false
    }

    pub const fn module_cache_capacity() -> usize {
        256
    }

    pub const fn memory_limit_pages() -> u32 {
        // 64 MiB
        1024
    }

    pub const fn buffer_capacity() -> usize {
        1024 * 1024
    }

    pub const fn store_wait_ms() -> u64 {
        250
    }
}
