//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared by every instance a service creates
//! - Configured for async execution so host imports can suspend
//! - Set up with fuel metering so running guests yield cooperatively

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use edgevm_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: `_sleep`, the ready handshake and async host
///   handlers suspend the calling task instead of blocking a thread
/// - **Fuel Metering**: guest code yields back to the executor every
///   `fuel_yield_interval` units, which is where cancellation is observed
/// - **Pooling Allocator** (optional): pre-allocated instance slots
/// - **Epoch Interruption** (optional): time-based interruption as a backup
///
/// # Example
///
/// ```ignore
/// use edgevm_common::EngineConfig;
/// use edgevm_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        if config.fuel_yield_interval == 0 {
            return Err(RuntimeError::invalid_config(
                "fuel_yield_interval must be greater than zero",
            ));
        }

        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            fuel_yield_interval = config.fuel_yield_interval,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        // Guest modules and host modules with memories both draw from the pool
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fuel consumed between two cooperative yields.
    pub fn fuel_yield_interval(&self) -> u64 {
        self.config.fuel_yield_interval
    }

    /// Increment the epoch counter.
    ///
    /// Only meaningful when epoch interruption is enabled.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("fuel_yield_interval", &self.config.fuel_yield_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        assert!(!engine.is_pooling_enabled());
        assert_eq!(engine.fuel_yield_interval(), 10_000);
    }

    #[test]
    fn test_engine_creation_pooling() {
        let config = EngineConfig {
            pooling_allocator: true,
            max_instances: 16,
            instance_memory_mb: 16,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();

        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_rejects_zero_yield_interval() {
        let config = EngineConfig {
            fuel_yield_interval: 0,
            ..Default::default()
        };

        let err = WasmEngine::new(&config).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("fuel_yield_interval"));
    }
}
