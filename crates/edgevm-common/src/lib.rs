//! Common types, errors, and configuration for edgevm.
//!
//! This crate provides shared functionality used across the edgevm workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engines and instances
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, OutputMode, PAGE_SIZE, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry};
pub use error::{DefinitionKind, HostFunctionError, InvocationError, RuntimeError, WasiError};
