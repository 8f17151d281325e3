//! One loaded module graph.
//!
//! A [`Runtime`] owns a Wasmtime store and linker. It always starts with the
//! builtin `env` host module (plus WASI preview-1) defined, and loads guest
//! modules by name, resolving their imports recursively:
//!
//! ```text
//! module(name)
//!   ├─ memoized / host module?  → return it
//!   ├─ Source::module(ctx, name) → bytes
//!   ├─ Service compile cache    → CompiledModule
//!   ├─ for each import module != env: module(dep)
//!   ├─ instantiate (WASI ctx: fs at "/", captured stdio, argv = [name],
//!   │               random source seeded from config or the OS)
//!   └─ _start?
//!        ├─ imports env._ready → spawn start, wait for ready or cancellation
//!        └─ otherwise          → run start inline
//! ```
//!
//! A start routine that keeps running after `_ready` holds the store until
//! it returns. Module and function lookups are answered from tables kept
//! outside the store; anything that needs the store itself queues for a
//! bounded time and then fails with [`RuntimeError::Busy`] (or
//! [`InvocationError::Busy`] for calls) until the routine ends or the
//! runtime is closed.
//!
//! [`InvocationError::Busy`]: edgevm_common::InvocationError::Busy

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::{OsRng, StdRng};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use wasmtime::{Extern, Func, Linker, Store};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::bridge::{HostFunctionDefinition, HostFuture, HostResult, ParamKind};
use crate::function::{ModuleInstance, ModuleKind, ModuleSlot};
use crate::host_module::{HostModule, HostModuleDefinitions};
use crate::module::{CompiledModule, ENV_MODULE, START_EXPORT};
use crate::output::OutputReader;
use crate::plugin::{Plugin, PluginInstance};
use crate::store::{HostState, ReadySignal, create_store};
use crate::value::ValueType;
use crate::{ExecutionContext, Instance};
use edgevm_common::{HostFunctionError, RuntimeError, WasiError};

/// Import module name of WASI preview-1.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Store and linker of a runtime.
pub(crate) struct RuntimeState {
    pub(crate) store: Store<HostState>,
    pub(crate) linker: Linker<HostState>,
}

/// Loaded modules by name.
///
/// Inserts happen with the store held, so registration stays serialized;
/// reads never wait on the store.
#[derive(Debug, Default)]
pub(crate) struct ModuleTables {
    /// Host modules (`env`, WASI, exposed and attached modules).
    hosts: HashMap<String, Arc<ModuleSlot>>,
    /// Instantiated guest modules.
    guests: HashMap<String, Arc<ModuleSlot>>,
}

impl ModuleTables {
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<ModuleSlot>> {
        self.hosts
            .get(name)
            .or_else(|| self.guests.get(name))
            .cloned()
    }

    pub(crate) fn insert(&mut self, slot: Arc<ModuleSlot>) {
        let table = if slot.is_host() {
            &mut self.hosts
        } else {
            &mut self.guests
        };
        table.insert(slot.name().to_string(), slot);
    }

    /// Remove `slot` if it is still the one registered under its name.
    pub(crate) fn remove(&mut self, slot: &Arc<ModuleSlot>) {
        let table = if slot.is_host() {
            &mut self.hosts
        } else {
            &mut self.guests
        };
        if table
            .get(slot.name())
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            table.remove(slot.name());
        }
    }
}

/// A loaded module graph bound to one [`Instance`].
///
/// Cheap to clone; clones share the same graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    instance: Instance,
    ctx: ExecutionContext,
    state: Arc<Mutex<RuntimeState>>,
    modules: RwLock<ModuleTables>,
    /// Serializes module resolution so memoization holds across awaits.
    resolving: Mutex<()>,
    ready: Arc<ReadySignal>,
    closed: AtomicBool,
}

impl Runtime {
    /// Create a runtime and compile its `env` module.
    ///
    /// # Errors
    ///
    /// Returns an error if the extra definitions collide with the builtins
    /// or with each other, or if the engine rejects them.
    #[instrument(skip(instance, definitions), fields(context = %instance.context().id()))]
    pub(crate) async fn new(
        instance: Instance,
        definitions: Option<HostModuleDefinitions>,
    ) -> Result<Self, RuntimeError> {
        let ctx = instance.context().child();
        let ready = Arc::new(ReadySignal::default());
        let engine = instance.service().engine().clone();

        let state = HostState::new(ctx.clone(), instance.config());
        let mut store = create_store(&engine, state, instance.config())?;

        let mut linker = Linker::new(engine.inner());
        // Closed guest modules are re-registered under the same name
        linker.allow_shadowing(true);
        preview1::add_to_linker_async(&mut linker, |state: &mut HostState| state.wasi_mut())
            .map_err(|e| WasiError::InitializationFailed {
                reason: e.to_string(),
            })?;

        let wasi_functions: Vec<(String, Func)> = linker
            .iter(&mut store)
            .filter(|(module, _, _)| *module == WASI_MODULE)
            .filter_map(|(_, name, item)| match item {
                Extern::Func(func) => Some((name.to_string(), func)),
                _ => None,
            })
            .collect();
        let mut modules = ModuleTables::default();
        modules.insert(Arc::new(ModuleSlot::new(
            WASI_MODULE,
            ModuleKind::Host,
            &store,
            wasi_functions,
        )));

        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                instance,
                ctx,
                state: Arc::new(Mutex::new(RuntimeState { store, linker })),
                modules: RwLock::new(modules),
                resolving: Mutex::new(()),
                ready,
                closed: AtomicBool::new(false),
            }),
        };

        let mut env = runtime.expose(ENV_MODULE)?;
        env.functions(runtime.builtins())?;
        if let Some(definitions) = definitions {
            env.functions(definitions.functions)?;
            env.memories(definitions.memories)?;
            env.globals(definitions.globals)?;
        }
        env.compile().await?;

        info!("Runtime created");

        Ok(runtime)
    }

    /// The instance this runtime belongs to.
    pub fn instance(&self) -> &Instance {
        &self.inner.instance
    }

    /// The runtime's execution context.
    ///
    /// A child of the instance context; closing the runtime cancels it.
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    pub(crate) fn modules(&self) -> &RwLock<ModuleTables> {
        &self.inner.modules
    }

    /// Take the store.
    ///
    /// While a start routine that signalled ready is still running on it,
    /// waits at most [`ExecutionConfig::store_wait`] and then fails with
    /// [`RuntimeError::Busy`].
    ///
    /// [`ExecutionConfig::store_wait`]: edgevm_common::ExecutionConfig::store_wait
    pub(crate) async fn store(&self) -> Result<MutexGuard<'_, RuntimeState>, RuntimeError> {
        self.acquire(self.inner.state.lock()).await
    }

    async fn store_owned(&self) -> Result<OwnedMutexGuard<RuntimeState>, RuntimeError> {
        self.acquire(Arc::clone(&self.inner.state).lock_owned()).await
    }

    async fn acquire<G>(&self, lock: impl Future<Output = G>) -> Result<G, RuntimeError> {
        let mut serving = self.inner.ready.subscribe();
        tokio::pin!(lock);

        loop {
            let holder = serving.borrow_and_update().clone();
            if let Some(module) = holder {
                let wait = self.instance().config().store_wait();
                return match tokio::time::timeout(wait, &mut lock).await {
                    Ok(guard) => Ok(guard),
                    Err(_) => {
                        debug!(module = %module, "Store held by a running start routine");
                        Err(RuntimeError::Busy { module })
                    }
                };
            }

            tokio::select! {
                biased;
                guard = &mut lock => return Ok(guard),
                changed = serving.changed() => {
                    if changed.is_err() {
                        return Err(RuntimeError::Closed { what: "runtime" });
                    }
                }
            }
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed { what: "runtime" });
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Start a new host module under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime is closed.
    pub fn expose(&self, name: impl Into<String>) -> Result<HostModule, RuntimeError> {
        self.ensure_open()?;
        Ok(HostModule::new(name.into(), self.clone()))
    }

    /// Attach a plugin as a host module named after it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Plugin`] if the plugin instance cannot be
    /// created or fails to populate its module, or the compile error. A
    /// plugin instance that was created is closed before an error returns.
    #[instrument(skip(self, plugin), fields(plugin = %plugin.name()))]
    pub async fn attach(
        &self,
        plugin: &dyn Plugin,
    ) -> Result<(Box<dyn PluginInstance>, ModuleInstance), RuntimeError> {
        self.ensure_open()?;

        let mut plugin_instance = plugin
            .new_instance(self.instance())
            .map_err(|e| RuntimeError::plugin(plugin.name(), e))?;

        match self.load_plugin(plugin.name(), plugin_instance.as_mut()).await {
            Ok(module) => {
                info!(plugin = %plugin.name(), "Plugin attached");
                Ok((plugin_instance, module))
            }
            Err(e) => {
                plugin_instance.close();
                Err(e)
            }
        }
    }

    async fn load_plugin(
        &self,
        name: &str,
        plugin_instance: &mut dyn PluginInstance,
    ) -> Result<ModuleInstance, RuntimeError> {
        let mut module = self.expose(name)?;
        plugin_instance
            .load(&mut module)
            .map_err(|e| RuntimeError::plugin(name, e))?;
        module.compile().await
    }

    /// Load a module by name, resolving its imports first.
    ///
    /// Idempotent per name: a loaded module is returned as is.
    ///
    /// # Errors
    ///
    /// Returns a resolution error naming the failing module or dependency.
    /// The runtime stays usable for other names.
    pub async fn module(&self, name: &str) -> Result<ModuleInstance, RuntimeError> {
        self.ensure_open()?;
        let loaded = self.inner.modules.read().lookup(name);
        if let Some(slot) = loaded {
            return Ok(ModuleInstance::new(slot, self.clone()));
        }

        let _resolving = self.inner.resolving.lock().await;
        let mut visiting = Vec::new();
        self.resolve(name, &mut visiting).await
    }

    fn resolve<'a>(
        &'a self,
        name: &'a str,
        visiting: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ModuleInstance, RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;

            let loaded = self.inner.modules.read().lookup(name);
            if let Some(slot) = loaded {
                return Ok(ModuleInstance::new(slot, self.clone()));
            }

            if visiting.iter().any(|v| v == name) {
                return Err(RuntimeError::DependencyCycle {
                    module: name.to_string(),
                });
            }

            debug!(module = %name, "Resolving module");

            let source = self
                .instance()
                .service()
                .source()
                .module(&self.inner.ctx, name)
                .await
                .map_err(|e| match e {
                    e @ RuntimeError::ModuleNotFound { .. } => e,
                    other => RuntimeError::resolution(name, other),
                })?;
            let compiled = self.instance().service().compile(source.bytes())?;

            visiting.push(name.to_string());
            for dependency in compiled.import_modules() {
                if dependency == ENV_MODULE {
                    continue;
                }
                self.resolve(&dependency, visiting)
                    .await
                    .map_err(|e| RuntimeError::Dependency {
                        module: name.to_string(),
                        dependency: dependency.clone(),
                        source: Box::new(e),
                    })?;
            }
            visiting.pop();

            self.instantiate(name, &compiled).await
        })
    }

    fn wasi_for(&self, name: &str) -> Result<WasiP1Ctx, RuntimeError> {
        let instance = self.instance();
        let mut builder = WasiCtxBuilder::new();
        builder
            .arg(name)
            .stdout(instance.stdout_capture().clone())
            .stderr(instance.stderr_capture().clone())
            .preopened_dir(instance.filesystem(), "/", DirPerms::all(), FilePerms::all())
            .map_err(|e| WasiError::InitializationFailed {
                reason: e.to_string(),
            })?;
        match instance.config().random_seed {
            Some(seed) => builder.secure_random(StdRng::seed_from_u64(seed)),
            None => builder.secure_random(OsRng),
        };
        Ok(builder.build_p1())
    }

    #[instrument(skip(self, compiled), fields(content_hash = %compiled.content_hash()))]
    async fn instantiate(
        &self,
        name: &str,
        compiled: &CompiledModule,
    ) -> Result<ModuleInstance, RuntimeError> {
        let wasi = self.wasi_for(name)?;
        let mut state = self.store_owned().await?;
        state.store.data_mut().set_wasi(wasi);

        let (guest, functions) = {
            let RuntimeState { store, linker } = &mut *state;
            let guest = linker
                .instantiate_async(&mut *store, compiled.inner())
                .await
                .map_err(|e| RuntimeError::instantiation(name, e))?;
            linker
                .instance(&mut *store, name, guest)
                .map_err(|e| RuntimeError::instantiation(name, e))?;
            let functions: Vec<(String, Func)> = guest
                .exports(&mut *store)
                .filter_map(|export| {
                    let export_name = export.name().to_string();
                    export.into_func().map(|func| (export_name, func))
                })
                .collect();
            (guest, functions)
        };

        let slot = Arc::new(ModuleSlot::new(
            name,
            ModuleKind::Guest(guest),
            &state.store,
            functions,
        ));
        self.inner.modules.write().insert(Arc::clone(&slot));
        let module = ModuleInstance::new(slot, self.clone());

        info!(module = %name, "Module instantiated");

        let Some(start) = guest.get_func(&mut state.store, START_EXPORT) else {
            return Ok(module);
        };

        if !compiled.imports_ready() {
            if let Err(e) = start.call_async(&mut state.store, &[], &mut []).await {
                // Commands end with proc_exit, which surfaces as an error
                debug!(module = %name, error = %e, "Start routine returned an error");
            }
            return Ok(module);
        }

        let receiver = self
            .inner
            .ready
            .arm(name)
            .ok_or(RuntimeError::Closed { what: "runtime" })?;

        let ready = Arc::clone(&self.inner.ready);
        let ctx = self.inner.ctx.clone();
        let task_module = name.to_string();
        tokio::spawn(async move {
            let mut state = state;
            tokio::select! {
                outcome = start.call_async(&mut state.store, &[], &mut []) => {
                    if let Err(e) = outcome {
                        warn!(module = %task_module, error = %e, "Start routine failed");
                    }
                }
                () = ctx.cancelled() => {
                    debug!(module = %task_module, "Start routine cancelled");
                }
            }
            // Clear the serving mark before the store is released
            ready.disarm();
            drop(state);
        });

        tokio::select! {
            received = receiver => match received {
                Ok(()) => {
                    debug!(module = %name, "Module signalled ready");
                    Ok(module)
                }
                Err(_) if self.inner.ready.is_closed() => {
                    Err(RuntimeError::Closed { what: "runtime" })
                }
                Err(_) if self.inner.ctx.is_cancelled() => Err(RuntimeError::instantiation(
                    name,
                    "context cancelled before the module signalled ready",
                )),
                Err(_) => {
                    debug!(module = %name, "Start routine finished without signalling ready");
                    Ok(module)
                }
            },
            () = self.inner.ctx.cancelled() => Err(RuntimeError::instantiation(
                name,
                "context cancelled before the module signalled ready",
            )),
        }
    }

    /// Reader over the instance's captured stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture cannot be reopened.
    pub fn stdout(&self) -> Result<OutputReader, RuntimeError> {
        self.instance().stdout()
    }

    /// Reader over the instance's captured stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture cannot be reopened.
    pub fn stderr(&self) -> Result<OutputReader, RuntimeError> {
        self.instance().stderr()
    }

    /// Close the runtime. Terminal.
    ///
    /// Releases anyone waiting on the ready signal and cancels the
    /// runtime context, which interrupts sleeps and in-flight calls.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.ready.close();
        self.inner.ctx.cancel();
        info!(context = %self.inner.ctx.id(), "Runtime closed");
    }

    fn builtins(&self) -> Vec<HostFunctionDefinition> {
        let ready = Arc::clone(&self.inner.ready);

        vec![
            HostFunctionDefinition::new("_ready", [], [], move |_| {
                if !ready.fire() {
                    debug!("Ready signalled with nobody waiting");
                }
                Ok(vec![])
            }),
            HostFunctionDefinition::new_async(
                "_sleep",
                [ParamKind::Context, ValueType::I64.into()],
                [],
                |call| {
                    let ctx = call.context().cloned().ok_or(HostFunctionError::InvalidArgument {
                        reason: "missing context".to_string(),
                    })?;
                    let nanos = u64::try_from(call.arg_i64(0)?).unwrap_or(0);
                    let sleep: HostFuture = Box::pin(async move {
                        tokio::select! {
                            () = ctx.cancelled() => {}
                            () = tokio::time::sleep(Duration::from_nanos(nanos)) => {}
                        }
                        HostResult::Ok(vec![])
                    });
                    Ok(sleep)
                },
            ),
            HostFunctionDefinition::new(
                "_log",
                [
                    ParamKind::Context,
                    ParamKind::Module,
                    ValueType::I32.into(),
                    ValueType::I32.into(),
                ],
                [],
                guest_log,
            ),
        ]
    }
}

fn guest_log(call: &mut crate::bridge::HostCall<'_, '_>) -> HostResult {
    let offset = call.arg_u32(0)?;
    let len = call.arg_u32(1)?;
    let (project, resource) = call
        .context()
        .map(|ctx| (ctx.project().to_string(), ctx.resource().to_string()))
        .unwrap_or_default();

    let message = call.module().and_then(|mut module| {
        let memory = module.memory()?;
        memory
            .read(offset, len)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    });

    match message {
        Some(message) => info!(
            guest_log = true,
            project = %project,
            resource = %resource,
            "{message}"
        ),
        None => warn!(offset, len, "Guest log range out of bounds"),
    }

    Ok(vec![])
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.inner.ctx.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
