//! Error types for edgevm.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime
//! - [`InvocationError`]: Failures of a guest function call, carried inside a return value
//! - [`HostFunctionError`]: Errors from host function implementations
//! - [`WasiError`]: WASI-related errors

use std::fmt;
use std::io;

use thiserror::Error;

/// The kind of item a host module definition declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    /// A host function.
    Function,
    /// A host linear memory.
    Memory,
    /// A host global.
    Global,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionKind::Function => write!(f, "function"),
            DefinitionKind::Memory => write!(f, "memory"),
            DefinitionKind::Global => write!(f, "global"),
        }
    }
}

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// a runtime, from host module definition to module resolution and calls.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A host module already holds an item under this name.
    #[error("{kind} `{name}` already defined in module `{module}`")]
    AlreadyDefined {
        /// What kind of item collided.
        kind: DefinitionKind,
        /// The duplicated name.
        name: String,
        /// The owning host module.
        module: String,
    },

    /// A host function definition has a shape the bridge cannot wrap.
    #[error("invalid signature for host function `{function}`: {reason}")]
    InvalidSignature {
        /// The host function name.
        function: String,
        /// Why the shape was rejected.
        reason: String,
    },

    /// The requested module was not found.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The identifier of the module that was not found.
        module_id: String,
    },

    /// Loading module bytes failed.
    #[error("loading module `{module}` failed with: {reason}")]
    Resolution {
        /// The module being loaded.
        module: String,
        /// What went wrong.
        reason: String,
    },

    /// A dependency of a module failed to load.
    #[error("loading module `{module}` dependency `{dependency}` failed with: {source}")]
    Dependency {
        /// The module that imports the dependency.
        module: String,
        /// The dependency that failed.
        dependency: String,
        /// The underlying failure.
        #[source]
        source: Box<RuntimeError>,
    },

    /// Module imports form a cycle.
    #[error("module `{module}` is part of an import cycle")]
    DependencyCycle {
        /// The module reached twice.
        module: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating a compiled module failed.
    #[error("creating an instance of module `{module}` failed with: {reason}")]
    Instantiation {
        /// The module being instantiated.
        module: String,
        /// Description of the failure.
        reason: String,
    },

    /// A module has no export under the requested function name.
    #[error("function `{function}` not found in module `{module}`")]
    FunctionNotFound {
        /// The module searched.
        module: String,
        /// The missing function.
        function: String,
    },

    /// A module has no export of the requested kind under this name.
    #[error("{kind} `{name}` not exported by module `{module}`")]
    ExportNotFound {
        /// The kind of export requested.
        kind: DefinitionKind,
        /// The missing name.
        name: String,
        /// The module searched.
        module: String,
    },

    /// Number of call arguments does not match the declared parameters.
    #[error("function `{function}` expects {expected} arguments, got {got}")]
    ArgumentCount {
        /// The function being called.
        function: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// Number of reflect targets does not match the declared results.
    #[error("expected {expected} return values, got {got} targets")]
    ResultCount {
        /// Declared result count.
        expected: usize,
        /// Supplied target count.
        got: usize,
    },

    /// A reflect target cannot hold the declared result type.
    #[error("cannot reflect result {index} of type {declared} into {target}")]
    ResultKind {
        /// Position of the result.
        index: usize,
        /// Declared WebAssembly value type.
        declared: String,
        /// Host type of the target.
        target: &'static str,
    },

    /// A guest function call failed.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// A plugin could not be created or loaded.
    #[error("plugin `{plugin}` failed with: {reason}")]
    Plugin {
        /// Name of the plugin.
        plugin: String,
        /// Description of the failure.
        reason: String,
    },

    /// A module backend failed to fetch content.
    #[error("fetching `{uri}` failed with: {reason}")]
    Backend {
        /// The locator being fetched.
        uri: String,
        /// Description of the failure.
        reason: String,
    },

    /// An instance already exists for this execution context.
    #[error("an instance already exists for context `{context}`")]
    InstanceExists {
        /// Identifier of the execution context.
        context: String,
    },

    /// A module's start routine kept running after signalling ready and
    /// holds the runtime's store.
    #[error("runtime store is held by the start routine of module `{module}`")]
    Busy {
        /// The module whose start routine is running.
        module: String,
    },

    /// The runtime or instance has been closed.
    #[error("{what} is closed")]
    Closed {
        /// What was closed.
        what: &'static str,
    },

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// WASI operation failed.
    #[error("WASI error: {0}")]
    Wasi(#[from] WasiError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Failure of a single guest function call.
///
/// Cloneable so a deferred return can hand the same error out repeatedly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The engine reported a trap or host failure.
    #[error("calling `{function}` failed with: {message}")]
    Failed {
        /// The function being called.
        function: String,
        /// Engine message.
        message: String,
    },

    /// The call observed cancellation.
    #[error("call to `{function}` was cancelled")]
    Cancelled {
        /// The function being called.
        function: String,
    },

    /// The call exhausted the store's fuel.
    #[error("call to `{function}` exhausted its fuel")]
    FuelExhausted {
        /// The function being called.
        function: String,
    },

    /// The store is held by a module's running start routine.
    #[error("cannot call `{function}` while the start routine of `{module}` is running")]
    Busy {
        /// The function being called.
        function: String,
        /// The module whose start routine holds the store.
        module: String,
    },

    /// A value could not cross the engine boundary.
    #[error("unsupported value for `{function}`: {reason}")]
    UnsupportedValue {
        /// The function being called.
        function: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Errors from host function implementations.
///
/// These errors occur when host functions (provided by the runtime to
/// WebAssembly modules) fail to complete their operations. They are
/// surfaced to the guest as traps.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// An argument had an unexpected value type.
    #[error("argument {index} is not {expected}")]
    ArgumentKind {
        /// Position among the value arguments.
        index: usize,
        /// Expected value type.
        expected: &'static str,
    },

    /// Guest memory access was out of range.
    #[error("memory access out of bounds at {offset} (+{len})")]
    OutOfBounds {
        /// Start offset.
        offset: u32,
        /// Requested length.
        len: u32,
    },

    /// The calling module has no exported memory.
    #[error("module has no exported memory")]
    MissingMemory,

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The handler returned values that do not match its declaration.
    #[error("handler returned {got} values, declared {expected}")]
    ResultMismatch {
        /// Declared result count.
        expected: usize,
        /// Returned value count.
        got: usize,
    },

    /// The handler returned a value of the wrong type.
    #[error("handler result {index} is {returned}, declared {declared}")]
    ResultType {
        /// Position of the result.
        index: usize,
        /// Declared value type.
        declared: String,
        /// Type of the returned value.
        returned: String,
    },
}

/// WASI-related errors.
#[derive(Error, Debug)]
pub enum WasiError {
    /// Failed to initialize WASI context.
    #[error("WASI initialization failed: {reason}")]
    InitializationFailed {
        /// Description of the initialization failure.
        reason: String,
    },

    /// A WASI filesystem operation failed.
    #[error("WASI filesystem error: {operation}")]
    FilesystemError {
        /// The filesystem operation that failed.
        operation: String,
    },
}

impl RuntimeError {
    /// Create a new `AlreadyDefined` error.
    pub fn already_defined(
        kind: DefinitionKind,
        name: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self::AlreadyDefined {
            kind,
            name: name.into(),
            module: module.into(),
        }
    }

    /// Create a new `InvalidSignature` error.
    pub fn invalid_signature(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSignature {
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `Resolution` error.
    pub fn resolution(module: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Resolution {
            module: module.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(module: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Instantiation {
            module: module.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `Plugin` error.
    pub fn plugin(plugin: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `Backend` error.
    pub fn backend(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Backend {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a name collision at definition time.
    pub fn is_definition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyDefined { .. } | Self::InvalidSignature { .. }
        )
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ModuleNotFound { .. } => true,
            Self::Dependency { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns `true` if a running start routine held the store.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy { .. } | Self::Invocation(InvocationError::Busy { .. }) => true,
            Self::Dependency { source, .. } => source.is_busy(),
            _ => false,
        }
    }
}
