//! Per-runtime store state.
//!
//! This module provides:
//! - [`HostState`]: the data every Wasmtime store carries, reachable from
//!   host functions through [`wasmtime::Caller`]
//! - [`ReadySignal`]: the one-shot handshake guest start routines fire
//! - [`create_store`]: store construction with limits and fuel yielding

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::{ExecutionContext, WasmEngine};
use edgevm_common::{ExecutionConfig, RuntimeError};

/// State held by a runtime's store.
///
/// # Contents
///
/// - `ctx`: the execution context the runtime was created under
/// - `wasi`: WASI preview-1 context of the module being instantiated
/// - `limits`: memory limits from the execution configuration
pub struct HostState {
    ctx: ExecutionContext,
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

impl HostState {
    /// Create store state with an empty WASI context.
    pub fn new(ctx: ExecutionContext, config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(config.memory_limit_bytes()).unwrap_or(usize::MAX))
            .build();

        Self {
            ctx,
            wasi: WasiCtxBuilder::new().build_p1(),
            limits,
        }
    }

    /// The execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// WASI context, as required by the preview-1 linker bindings.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Replace the WASI context before instantiating a module.
    pub fn set_wasi(&mut self, wasi: WasiP1Ctx) {
        self.wasi = wasi;
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("ctx", &self.ctx.id())
            .finish_non_exhaustive()
    }
}

/// One-shot ready handshake between a start routine and its waiter.
///
/// The runtime arms the signal before running a start routine that
/// imports `env._ready`; the guest fires it; closing drops the pending
/// sender so the waiter wakes with an error instead of hanging.
///
/// Firing also marks the armed module as serving: its start routine keeps
/// the store until it returns, and [`ReadySignal::subscribe`] lets store
/// users see that instead of queueing behind it.
#[derive(Debug)]
pub struct ReadySignal {
    sender: Mutex<Option<(String, oneshot::Sender<()>)>>,
    serving: watch::Sender<Option<String>>,
    closed: AtomicBool,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self {
            sender: Mutex::new(None),
            serving: watch::channel(None).0,
            closed: AtomicBool::new(false),
        }
    }
}

impl ReadySignal {
    /// Arm the signal for `module` and return the receiving end.
    ///
    /// Returns `None` once closed.
    pub fn arm(&self, module: &str) -> Option<oneshot::Receiver<()>> {
        if self.is_closed() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *self.sender.lock() = Some((module.to_string(), tx));
        Some(rx)
    }

    /// Fire the signal. Returns `false` when nothing was waiting.
    pub fn fire(&self) -> bool {
        match self.sender.lock().take() {
            Some((module, tx)) => {
                self.serving.send_replace(Some(module));
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    /// End the handshake: drop a pending sender without closing, waking its
    /// waiter with an error, and clear the serving module.
    pub fn disarm(&self) {
        self.sender.lock().take();
        self.serving.send_replace(None);
    }

    /// Release any waiter and refuse to arm again.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Module whose start routine signalled ready and is still running.
    pub fn serving(&self) -> Option<String> {
        self.serving.borrow().clone()
    }

    /// Watch the serving module.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.serving.subscribe()
    }
}

/// Create a new Wasmtime store for a runtime.
///
/// # Arguments
///
/// * `engine` - The shared Wasmtime engine
/// * `state` - Initial host state
/// * `config` - Execution configuration (fuel limit)
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    state: HostState,
    config: &ExecutionConfig,
) -> Result<Store<HostState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), state);

    store.limiter(|state| &mut state.limits);

    store
        .set_fuel(config.fuel())
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    store
        .fuel_async_yield_interval(Some(engine.fuel_yield_interval()))
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set yield interval: {e}")))?;

    if engine.config().epoch_interruption {
        // Epoch ticks become extra yield points instead of traps
        store.epoch_deadline_async_yield_and_update(1);
    }

    debug!(fuel = config.fuel(), "Store created");

    Ok(store)
}
