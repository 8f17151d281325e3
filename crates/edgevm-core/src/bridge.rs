//! Function reflection bridge.
//!
//! Host functions are declared as a [`HostFunctionDefinition`]: a parameter
//! list drawn from [`ParamKind`], result types and a [`Handler`]. The
//! leading parameters may ask for the execution context and/or a handle on
//! the calling module; the guest only ever sees the value parameters.
//!
//! # Parameter shape
//!
//! ```text
//! [Context]? [Module]? Value(..)*
//! ```
//!
//! `Context` may only appear at position 0 and `Module` only directly after
//! an optional `Context`. Anything else is rejected at registration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;
use wasmtime::{AsContextMut, Caller, Engine, Extern, FuncType, Linker, Val};

use crate::memory::Memory;
use crate::value::{Value, ValueType};
use crate::{ExecutionContext, HostState};
use edgevm_common::{HostFunctionError, RuntimeError};

/// Name of the memory export host functions read from.
pub const MEMORY_EXPORT: &str = "memory";

/// Kind of a declared host function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// The execution context of the runtime.
    Context,
    /// A handle on the calling module.
    Module,
    /// A WebAssembly value.
    Value(ValueType),
}

impl From<ValueType> for ParamKind {
    fn from(ty: ValueType) -> Self {
        ParamKind::Value(ty)
    }
}

/// Result of a host function handler.
pub type HostResult = Result<Vec<Value>, HostFunctionError>;

/// Deferred part of an async handler.
pub type HostFuture = Pin<Box<dyn Future<Output = HostResult> + Send + 'static>>;

type SyncFn = dyn Fn(&mut HostCall<'_, '_>) -> HostResult + Send + Sync;
type AsyncFn = dyn Fn(&mut HostCall<'_, '_>) -> Result<HostFuture, HostFunctionError> + Send + Sync;

/// Host function implementation.
///
/// An async handler runs in two phases: a synchronous phase with access to
/// the call (arguments, context, caller memory) that returns a future, and
/// the future itself, which may suspend the guest.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

/// Declaration of one host function.
#[derive(Clone)]
pub struct HostFunctionDefinition {
    name: String,
    params: Vec<ParamKind>,
    results: Vec<ValueType>,
    handler: Handler,
}

impl HostFunctionDefinition {
    /// Declare a synchronous host function.
    pub fn new<F>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamKind>,
        results: impl IntoIterator<Item = ValueType>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_, '_>) -> HostResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
            handler: Handler::Sync(Arc::new(handler)),
        }
    }

    /// Declare a host function that may suspend the calling guest.
    pub fn new_async<F>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ParamKind>,
        results: impl IntoIterator<Item = ValueType>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_, '_>) -> Result<HostFuture, HostFunctionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
            handler: Handler::Async(Arc::new(handler)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same declaration and handler under another name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    /// Check the declared shape.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidSignature`] when a context or module
    /// parameter is misplaced or repeated, or when an `externref` is used.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.signature().map(|_| ())
    }

    pub(crate) fn signature(&self) -> Result<Signature, RuntimeError> {
        let invalid = |reason: String| RuntimeError::invalid_signature(&self.name, reason);
        let mut signature = Signature::default();

        for (position, kind) in self.params.iter().enumerate() {
            match kind {
                ParamKind::Context => {
                    if position != 0 {
                        return Err(invalid(format!(
                            "context parameter at position {position}, expected 0"
                        )));
                    }
                    signature.context = true;
                }
                ParamKind::Module => {
                    let expected = usize::from(signature.context);
                    if signature.module || position != expected {
                        return Err(invalid(format!(
                            "module parameter at position {position}, expected {expected}"
                        )));
                    }
                    signature.module = true;
                }
                ParamKind::Value(ValueType::ExternRef) => {
                    return Err(invalid(format!("externref parameter at position {position}")));
                }
                ParamKind::Value(ty) => signature.params.push(*ty),
            }
        }

        for (position, ty) in self.results.iter().enumerate() {
            if *ty == ValueType::ExternRef {
                return Err(invalid(format!("externref result at position {position}")));
            }
        }
        signature.results = self.results.clone();

        Ok(signature)
    }
}

impl std::fmt::Debug for HostFunctionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunctionDefinition")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .field("async", &matches!(self.handler, Handler::Async(_)))
            .finish()
    }
}

/// Validated wasm-facing shape of a host function.
#[derive(Debug, Clone, Default)]
pub(crate) struct Signature {
    context: bool,
    module: bool,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
}

impl Signature {
    fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(
            engine,
            self.params.iter().map(|ty| ty.to_val_type()),
            self.results.iter().map(|ty| ty.to_val_type()),
        )
    }

    fn decode(&self, params: &[Val]) -> Result<Vec<Value>, HostFunctionError> {
        params
            .iter()
            .enumerate()
            .map(|(index, val)| {
                Value::from_val(val).map_err(|_| HostFunctionError::ArgumentKind {
                    index,
                    expected: "a numeric value",
                })
            })
            .collect()
    }

    fn encode(&self, values: &[Value], results: &mut [Val]) -> Result<(), HostFunctionError> {
        if values.len() != self.results.len() {
            return Err(HostFunctionError::ResultMismatch {
                expected: self.results.len(),
                got: values.len(),
            });
        }
        for (index, ((value, declared), slot)) in values
            .iter()
            .zip(&self.results)
            .zip(results.iter_mut())
            .enumerate()
        {
            if value.ty() != *declared {
                return Err(HostFunctionError::ResultType {
                    index,
                    declared: declared.to_string(),
                    returned: value.ty().to_string(),
                });
            }
            *slot = value
                .to_val()
                .map_err(|reason| HostFunctionError::InvalidArgument { reason })?;
        }
        Ok(())
    }
}

/// One invocation of a host function, as seen by its handler.
pub struct HostCall<'a, 'c> {
    caller: &'a mut Caller<'c, HostState>,
    args: &'a [Value],
    signature: &'a Signature,
}

impl<'a, 'c> HostCall<'a, 'c> {
    /// The execution context, when the definition declared a context parameter.
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.signature
            .context
            .then(|| self.caller.data().context())
    }

    /// The calling module, when the definition declared a module parameter.
    pub fn module(&mut self) -> Option<CallerModule<'_, 'c>> {
        if !self.signature.module {
            return None;
        }
        Some(CallerModule {
            caller: &mut *self.caller,
        })
    }

    /// Decoded value arguments.
    pub fn args(&self) -> &[Value] {
        self.args
    }

    fn arg(&self, index: usize, expected: &'static str) -> Result<Value, HostFunctionError> {
        self.args
            .get(index)
            .copied()
            .ok_or(HostFunctionError::ArgumentKind { index, expected })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `i32`.
    pub fn arg_i32(&self, index: usize) -> Result<i32, HostFunctionError> {
        self.arg(index, "i32")?
            .as_i32()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "i32" })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `i32`.
    pub fn arg_u32(&self, index: usize) -> Result<u32, HostFunctionError> {
        self.arg(index, "i32")?
            .as_u32()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "i32" })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `i64`.
    pub fn arg_i64(&self, index: usize) -> Result<i64, HostFunctionError> {
        self.arg(index, "i64")?
            .as_i64()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "i64" })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `i64`.
    pub fn arg_u64(&self, index: usize) -> Result<u64, HostFunctionError> {
        self.arg(index, "i64")?
            .as_u64()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "i64" })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `f32`.
    pub fn arg_f32(&self, index: usize) -> Result<f32, HostFunctionError> {
        self.arg(index, "f32")?
            .as_f32()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "f32" })
    }

    /// # Errors
    ///
    /// Returns [`HostFunctionError::ArgumentKind`] when the argument is missing or not an `f64`.
    pub fn arg_f64(&self, index: usize) -> Result<f64, HostFunctionError> {
        self.arg(index, "f64")?
            .as_f64()
            .ok_or(HostFunctionError::ArgumentKind { index, expected: "f64" })
    }
}

/// The calling module, adapted from the engine's per-call caller.
pub struct CallerModule<'a, 'c> {
    caller: &'a mut Caller<'c, HostState>,
}

impl<'a, 'c> CallerModule<'a, 'c> {
    /// The module's default memory export.
    pub fn memory(&mut self) -> Option<Memory<'_>> {
        self.exported_memory(MEMORY_EXPORT)
    }

    /// The module's default memory, or [`HostFunctionError::MissingMemory`].
    ///
    /// # Errors
    ///
    /// Returns an error if the caller exports no memory.
    pub fn require_memory(&mut self) -> Result<Memory<'_>, HostFunctionError> {
        self.memory().ok_or(HostFunctionError::MissingMemory)
    }

    /// A memory export by name.
    pub fn exported_memory(&mut self, name: &str) -> Option<Memory<'_>> {
        let memory = self.caller.get_export(name).and_then(Extern::into_memory)?;
        Some(Memory::new(memory, self.caller.as_context_mut()))
    }

    /// The current value of a global export.
    pub fn exported_global(&mut self, name: &str) -> Option<Value> {
        let global = self.caller.get_export(name).and_then(Extern::into_global)?;
        let val = global.get(&mut *self.caller);
        Value::from_val(&val).ok()
    }

    /// The execution context of the runtime the module lives in.
    pub fn context(&self) -> &ExecutionContext {
        self.caller.data().context()
    }
}

/// Define `def` in `linker` under `module`.
pub(crate) fn define(
    linker: &mut Linker<HostState>,
    engine: &Engine,
    module: &str,
    def: &HostFunctionDefinition,
) -> Result<(), RuntimeError> {
    let signature = Arc::new(def.signature()?);
    let ty = signature.func_type(engine);
    let function = def.name.clone();

    let defined = match &def.handler {
        Handler::Sync(handler) => {
            let handler = Arc::clone(handler);
            linker.func_new(
                module,
                &def.name,
                ty,
                move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                    let args = signature.decode(params)?;
                    let values = {
                        let mut call = HostCall {
                            caller: &mut caller,
                            args: &args,
                            signature: &signature,
                        };
                        handler(&mut call)?
                    };
                    signature.encode(&values, results)?;
                    Ok(())
                },
            )
        }
        Handler::Async(handler) => {
            let handler = Arc::clone(handler);
            linker.func_new_async(
                module,
                &def.name,
                ty,
                move |mut caller, params, results| {
                    let handler = Arc::clone(&handler);
                    let signature = Arc::clone(&signature);
                    Box::new(async move {
                        let args = signature.decode(params)?;
                        let pending = {
                            let mut call = HostCall {
                                caller: &mut caller,
                                args: &args,
                                signature: &signature,
                            };
                            handler(&mut call)?
                        };
                        let values = pending.await?;
                        signature.encode(&values, results)?;
                        Ok::<(), anyhow::Error>(())
                    })
                },
            )
        }
    };

    defined.map_err(|e| RuntimeError::instantiation(module, e))?;
    debug!(module = %module, function = %function, "Host function defined");

    Ok(())
}
