//! Core WebAssembly execution runtime for edgevm.
//!
//! This crate provides the execution model capability SDKs plug into:
//! - [`Service`]: Shared engine, module source and compilation cache
//! - [`Instance`]: Sandbox bound to one [`ExecutionContext`]
//! - [`Runtime`]: One module graph with the builtin `env` host module
//! - [`HostModule`]: Host functions, memories and globals guests import
//! - [`ModuleInstance`] / [`FunctionInstance`]: Loaded modules and their exports
//! - [`Memory`]: Bounds-checked view of guest linear memory
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Service                           │
//! │  (Shared across instances, thread-safe)                 │
//! │  - WasmEngine                                           │
//! │  - Source: name → bytes                                 │
//! │  - Compilation cache by content hash                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │  one per ExecutionContext
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Instance                          │
//! │  - Virtual filesystem (preopened at "/")                │
//! │  - Captured stdout / stderr                             │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Runtime: Store<HostState> + Linker           │
//! │  - env (_ready, _sleep, _log) + WASI preview-1          │
//! │  - Attached plugins                                     │
//! │  - Guest modules, resolved by import                    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod bridge;
pub mod context;
pub mod engine;
pub mod function;
pub mod host_module;
pub mod instance;
pub mod memory;
pub mod module;
pub mod output;
pub mod plugin;
pub mod runtime;
pub mod service;
pub mod source;
pub mod store;
pub mod value;

pub use backend::{FileBackend, HttpBackend, MemoryBackend};
pub use bridge::{
    CallerModule, Handler, HostCall, HostFunctionDefinition, HostFuture, HostResult, ParamKind,
};
pub use context::{ExecutionContext, ExecutionContextBuilder};
pub use engine::WasmEngine;
pub use function::{FunctionInstance, ModuleInstance, ReflectTarget, Return, TargetKind};
pub use host_module::{GlobalDefinition, HostModule, HostModuleDefinitions, MemoryDefinition};
pub use instance::Instance;
pub use memory::Memory;
pub use module::CompiledModule;
pub use output::{OutputCapture, OutputReader};
pub use plugin::{Plugin, PluginInstance};
pub use runtime::Runtime;
pub use service::Service;
pub use source::{
    Backend, BackendLoader, Loader, Resolver, ResolvingSource, Source, SourceModule,
    StaticResolver,
};
pub use store::{HostState, ReadySignal};
pub use value::{Value, ValueType};
