//! Module and function handles, calls and their returns.
//!
//! - [`ModuleInstance`]: a host or guest module loaded in a runtime
//! - [`FunctionInstance`]: one exported function with fixed param/result types
//! - [`Return`]: raw result slots plus a deferred invocation error
//! - [`ReflectTarget`]: host outputs a [`Return`] can be reflected into

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use wasmtime::{AsContext, AsContextMut, Extern, Func, FuncType, Trap, Val};

use crate::Runtime;
use crate::runtime::RuntimeState;
use crate::memory::Memory;
use crate::value::{self, Value, ValueType};
use edgevm_common::{DefinitionKind, InvocationError, RuntimeError};

/// What backs a module slot.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ModuleKind {
    /// Defined by the host through the linker.
    Host,
    /// An instantiated guest module.
    Guest(wasmtime::Instance),
}

/// Runtime-side record of a loaded module.
///
/// Exported functions and their types are captured at registration, so
/// looking one up never touches the store.
#[derive(Debug)]
pub(crate) struct ModuleSlot {
    name: String,
    kind: ModuleKind,
    functions: HashMap<String, (Func, FuncType)>,
    closed: AtomicBool,
}

impl ModuleSlot {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: ModuleKind,
        store: impl AsContext,
        functions: impl IntoIterator<Item = (String, Func)>,
    ) -> Self {
        let store = store.as_context();
        let functions = functions
            .into_iter()
            .map(|(name, func)| {
                let ty = func.ty(&store);
                (name, (func, ty))
            })
            .collect();

        Self {
            name: name.into(),
            kind,
            functions,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_host(&self) -> bool {
        matches!(self.kind, ModuleKind::Host)
    }
}

/// A module loaded in a [`Runtime`].
#[derive(Clone)]
pub struct ModuleInstance {
    slot: Arc<ModuleSlot>,
    runtime: Runtime,
}

impl ModuleInstance {
    pub(crate) fn new(slot: Arc<ModuleSlot>, runtime: Runtime) -> Self {
        Self { slot, runtime }
    }

    /// The name the module is registered under.
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Returns `true` for host modules.
    pub fn is_host(&self) -> bool {
        self.slot.is_host()
    }

    /// Returns `true` if both handles refer to the same loaded module.
    pub fn same(&self, other: &ModuleInstance) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// The runtime the module lives in.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        self.runtime.ensure_open()?;
        if self.slot.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed { what: "module" });
        }
        Ok(())
    }

    fn export(&self, state: &mut RuntimeState, name: &str) -> Option<Extern> {
        match self.slot.kind {
            ModuleKind::Guest(instance) => instance.get_export(&mut state.store, name),
            ModuleKind::Host => state.linker.get(&mut state.store, self.name(), name),
        }
    }

    /// Look up an exported function.
    ///
    /// Does not wait on the store, so it answers even while a start routine
    /// is running.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::FunctionNotFound`] if no function is exported
    /// under `name`, or [`RuntimeError::InvalidSignature`] if its type uses
    /// values the runtime cannot carry.
    pub async fn function(&self, name: &str) -> Result<FunctionInstance, RuntimeError> {
        self.ensure_open()?;

        let (func, ty) = self.slot.functions.get(name).cloned().ok_or_else(|| {
            RuntimeError::FunctionNotFound {
                module: self.name().to_string(),
                function: name.to_string(),
            }
        })?;

        let convert = |types: &mut dyn Iterator<Item = wasmtime::ValType>| {
            types
                .map(|ty| {
                    ValueType::from_val_type(&ty).ok_or_else(|| {
                        RuntimeError::invalid_signature(name, format!("unsupported type {ty:?}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let params = convert(&mut ty.params())?;
        let results = convert(&mut ty.results())?;

        Ok(FunctionInstance {
            module: self.clone(),
            name: name.to_string(),
            func,
            params,
            results,
            token: self.runtime.context().token().child_token(),
        })
    }

    /// The current value of an exported global.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExportNotFound`] if no such global exists,
    /// or [`RuntimeError::Busy`] while a start routine holds the store.
    pub async fn exported_global(&self, name: &str) -> Result<Value, RuntimeError> {
        self.ensure_open()?;
        let mut state = self.runtime.store().await?;
        let state = &mut *state;

        let not_found = || RuntimeError::ExportNotFound {
            kind: DefinitionKind::Global,
            name: name.to_string(),
            module: self.name().to_string(),
        };
        let global = self
            .export(state, name)
            .and_then(Extern::into_global)
            .ok_or_else(not_found)?;

        let val = global.get(&mut state.store);
        Value::from_val(&val).map_err(|reason| RuntimeError::invalid_signature(name, reason))
    }

    /// Run `f` against an exported memory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExportNotFound`] if no such memory exists,
    /// or [`RuntimeError::Busy`] while a start routine holds the store.
    pub async fn with_memory<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Memory<'_>) -> R,
    ) -> Result<R, RuntimeError> {
        self.ensure_open()?;
        let mut state = self.runtime.store().await?;
        let state = &mut *state;

        let memory = self
            .export(state, name)
            .and_then(Extern::into_memory)
            .ok_or_else(|| RuntimeError::ExportNotFound {
                kind: DefinitionKind::Memory,
                name: name.to_string(),
                module: self.name().to_string(),
            })?;

        let mut memory = Memory::new(memory, state.store.as_context_mut());
        Ok(f(&mut memory))
    }

    /// Close the module with exit code 0.
    pub async fn close(&self) {
        self.close_with_exit_code(0).await;
    }

    /// Drop the module from the runtime. Later lookups through any handle
    /// fail; loading the name again instantiates a fresh copy.
    pub async fn close_with_exit_code(&self, exit_code: u32) {
        if self.slot.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runtime.modules().write().remove(&self.slot);
        info!(module = %self.name(), exit_code, "Module closed");
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.slot.name)
            .field("host", &self.is_host())
            .finish_non_exhaustive()
    }
}

/// One exported function.
#[derive(Clone)]
pub struct FunctionInstance {
    module: ModuleInstance,
    name: String,
    func: Func,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    token: CancellationToken,
}

impl FunctionInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &ModuleInstance {
        &self.module
    }

    /// Declared parameter types.
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Declared result types.
    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    /// Call with typed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ArgumentCount`] if the argument count does not
    /// match the declared parameters. Failures of the call itself are carried
    /// by the [`Return`].
    pub async fn call(&self, args: &[Value]) -> Result<Return, RuntimeError> {
        self.check_arity(args.len())?;
        for (index, (arg, declared)) in args.iter().zip(&self.params).enumerate() {
            if arg.ty() != *declared {
                return Err(RuntimeError::invalid_signature(
                    &self.name,
                    format!("argument {index} is {}, declared {declared}", arg.ty()),
                ));
            }
        }
        let raw: Vec<u64> = args.iter().map(|arg| arg.to_raw()).collect();
        Ok(self.invoke(&raw).await)
    }

    /// Call with raw value slots, skipping encoding.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ArgumentCount`] on an arity mismatch.
    pub async fn raw_call(&self, raw: &[u64]) -> Result<Return, RuntimeError> {
        self.check_arity(raw.len())?;
        Ok(self.invoke(raw).await)
    }

    /// Cancel in-flight and future calls of this function.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn check_arity(&self, got: usize) -> Result<(), RuntimeError> {
        if got != self.params.len() {
            return Err(RuntimeError::ArgumentCount {
                function: self.name.clone(),
                expected: self.params.len(),
                got,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, raw), fields(module = %self.module.name(), function = %self.name))]
    async fn invoke(&self, raw: &[u64]) -> Return {
        let failed = |err: InvocationError| Return::failed(self.results.clone(), err);

        if let Err(e) = self.module.ensure_open() {
            return failed(InvocationError::Failed {
                function: self.name.clone(),
                message: e.to_string(),
            });
        }

        let params = match raw
            .iter()
            .zip(&self.params)
            .map(|(raw, ty)| Value::from_raw(*ty, *raw).to_val())
            .collect::<Result<Vec<Val>, _>>()
        {
            Ok(params) => params,
            Err(reason) => {
                return failed(InvocationError::UnsupportedValue {
                    function: self.name.clone(),
                    reason,
                });
            }
        };
        let mut results = vec![Val::I32(0); self.results.len()];

        let cancelled = || InvocationError::Cancelled {
            function: self.name.clone(),
        };
        if self.token.is_cancelled() {
            return failed(cancelled());
        }

        let mut state = tokio::select! {
            state = self.module.runtime().store() => match state {
                Ok(state) => state,
                Err(RuntimeError::Busy { module }) => {
                    return failed(InvocationError::Busy {
                        function: self.name.clone(),
                        module,
                    });
                }
                Err(e) => {
                    return failed(InvocationError::Failed {
                        function: self.name.clone(),
                        message: e.to_string(),
                    });
                }
            },
            () = self.token.cancelled() => return failed(cancelled()),
        };

        let outcome = tokio::select! {
            outcome = self.func.call_async(&mut state.store, &params, &mut results) => outcome,
            () = self.token.cancelled() => return failed(cancelled()),
        };
        drop(state);

        if let Err(e) = outcome {
            let err = match e.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => InvocationError::FuelExhausted {
                    function: self.name.clone(),
                },
                _ => InvocationError::Failed {
                    function: self.name.clone(),
                    message: format!("{e:#}"),
                },
            };
            debug!(error = %err, "Call failed");
            return failed(err);
        }

        let rets = match results
            .iter()
            .map(|val| Value::from_val(val).map(Value::to_raw))
            .collect::<Result<Vec<u64>, _>>()
        {
            Ok(rets) => rets,
            Err(reason) => {
                return failed(InvocationError::UnsupportedValue {
                    function: self.name.clone(),
                    reason,
                });
            }
        };

        Return {
            rets,
            result_types: self.results.clone(),
            err: None,
        }
    }
}

impl std::fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionInstance")
            .field("module", &self.module.name())
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// Outcome of a call.
///
/// Invocation errors are deferred: they surface from [`Return::error`] and
/// short-circuit [`Return::reflect`].
#[derive(Debug, Clone)]
pub struct Return {
    rets: Vec<u64>,
    result_types: Vec<ValueType>,
    err: Option<InvocationError>,
}

impl Return {
    fn failed(result_types: Vec<ValueType>, err: InvocationError) -> Self {
        Self {
            rets: Vec::new(),
            result_types,
            err: Some(err),
        }
    }

    /// The invocation failure, if any.
    pub fn error(&self) -> Option<&InvocationError> {
        self.err.as_ref()
    }

    /// Raw result slots, untouched.
    pub fn rets(&self) -> &[u64] {
        &self.rets
    }

    /// Declared result types.
    pub fn result_types(&self) -> &[ValueType] {
        &self.result_types
    }

    /// Decode the results as typed values.
    ///
    /// # Errors
    ///
    /// Returns the invocation error, if any.
    pub fn values(&self) -> Result<Vec<Value>, RuntimeError> {
        if let Some(err) = &self.err {
            return Err(err.clone().into());
        }
        Ok(self
            .rets
            .iter()
            .zip(&self.result_types)
            .map(|(raw, ty)| Value::from_raw(*ty, *raw))
            .collect())
    }

    /// Assign each result into the matching output.
    ///
    /// # Errors
    ///
    /// Returns the invocation error if the call failed,
    /// [`RuntimeError::ResultCount`] if `outs` does not match the declared
    /// results, or [`RuntimeError::ResultKind`] if an output cannot hold its
    /// result, by kind or by range. Nothing is assigned on error.
    pub fn reflect(&self, outs: &mut [&mut dyn ReflectTarget]) -> Result<(), RuntimeError> {
        if let Some(err) = &self.err {
            return Err(err.clone().into());
        }

        if outs.len() != self.result_types.len() {
            return Err(RuntimeError::ResultCount {
                expected: self.result_types.len(),
                got: outs.len(),
            });
        }

        for (index, ((out, declared), raw)) in outs
            .iter()
            .zip(&self.result_types)
            .zip(&self.rets)
            .enumerate()
        {
            if !out.kind().accepts(*declared) || !out.fits(*declared, *raw) {
                return Err(RuntimeError::ResultKind {
                    index,
                    declared: declared.to_string(),
                    target: out.type_name(),
                });
            }
        }

        for ((out, declared), raw) in outs.iter_mut().zip(&self.result_types).zip(&self.rets) {
            out.assign(*declared, *raw);
        }

        Ok(())
    }
}

/// Kind of host value a [`ReflectTarget`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Integer,
    Float,
}

impl TargetKind {
    fn accepts(self, declared: ValueType) -> bool {
        match self {
            TargetKind::Integer => declared.is_integer(),
            TargetKind::Float => declared.is_float(),
        }
    }
}

/// A host output a result can be reflected into.
///
/// Integer targets take a result only if its value fits. A result of a
/// target's own width reinterprets into the unsigned type (an `i32` bit
/// pattern into `u32`, an `i64` into `u64`); every other pairing must hold
/// the signed value, so `-1` reflects into `i32` but not into `usize`.
/// Float targets always accept; `f64` results narrow into `f32` with
/// rounding.
pub trait ReflectTarget {
    fn kind(&self) -> TargetKind;

    fn type_name(&self) -> &'static str;

    /// Returns `false` if `raw`, decoded as `declared`, has no value in
    /// this target.
    fn fits(&self, _declared: ValueType, _raw: u64) -> bool {
        true
    }

    /// Store `raw`, decoded as `declared`. Only called when the kind
    /// accepts it and it fits.
    fn assign(&mut self, declared: ValueType, raw: u64);
}

fn integer(declared: ValueType, raw: u64) -> i64 {
    match declared {
        ValueType::I32 => i64::from(value::decode_i32(raw)),
        _ => value::decode_i64(raw),
    }
}

fn float(declared: ValueType, raw: u64) -> f64 {
    match declared {
        ValueType::F32 => f64::from(value::decode_f32(raw)),
        _ => value::decode_f64(raw),
    }
}

/// Decode an integer result for `T`. `reinterpret` yields the bits of a
/// same-width result; otherwise the signed value must convert.
fn decode_integer<T: TryFrom<i64>>(
    declared: ValueType,
    raw: u64,
    reinterpret: impl Fn(ValueType, u64) -> Option<T>,
) -> Option<T> {
    reinterpret(declared, raw).or_else(|| T::try_from(integer(declared, raw)).ok())
}

macro_rules! reflect_integer {
    ($($ty:ty => $reinterpret:expr),* $(,)?) => {$(
        impl ReflectTarget for $ty {
            fn kind(&self) -> TargetKind {
                TargetKind::Integer
            }

            fn type_name(&self) -> &'static str {
                stringify!($ty)
            }

            fn fits(&self, declared: ValueType, raw: u64) -> bool {
                decode_integer::<$ty>(declared, raw, $reinterpret).is_some()
            }

            fn assign(&mut self, declared: ValueType, raw: u64) {
                if let Some(value) = decode_integer::<$ty>(declared, raw, $reinterpret) {
                    *self = value;
                }
            }
        }
    )*};
}

reflect_integer! {
    i32 => |_, _| None,
    u32 => |declared, raw| (declared == ValueType::I32).then(|| value::decode_u32(raw)),
    i64 => |_, _| None,
    u64 => |declared, raw| (declared == ValueType::I64).then_some(raw),
    usize => |_, _| None,
}

impl ReflectTarget for f32 {
    fn kind(&self) -> TargetKind {
        TargetKind::Float
    }

    fn type_name(&self) -> &'static str {
        "f32"
    }

    fn assign(&mut self, declared: ValueType, raw: u64) {
        *self = float(declared, raw) as f32;
    }
}

impl ReflectTarget for f64 {
    fn kind(&self) -> TargetKind {
        TargetKind::Float
    }

    fn type_name(&self) -> &'static str {
        "f64"
    }

    fn assign(&mut self, declared: ValueType, raw: u64) {
        *self = float(declared, raw);
    }
}
