//! Host module builder.
//!
//! A [`HostModule`] collects function, memory and global definitions under
//! one import module name and defines them in the runtime's linker on
//! [`HostModule::compile`].
//!
//! Each insertion call is a batch: every definition in it is checked
//! against the module and against the rest of the batch before anything
//! is inserted, so a rejected batch leaves the module unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, instrument};
use wasmtime::{Global, GlobalType, MemoryType, Mutability};

use crate::bridge::{self, HostFunctionDefinition};
use crate::function::{ModuleInstance, ModuleKind, ModuleSlot};
use crate::value::Value;
use crate::Runtime;
use edgevm_common::{DefinitionKind, RuntimeError};

/// A host linear memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDefinition {
    pub name: String,
    /// Initial size in 64 KiB pages.
    pub pages: u32,
    /// Maximum size in pages, unbounded when `None`.
    pub max_pages: Option<u32>,
}

impl MemoryDefinition {
    pub fn new(name: impl Into<String>, pages: u32, max_pages: Option<u32>) -> Self {
        Self {
            name: name.into(),
            pages,
            max_pages,
        }
    }
}

/// An immutable host global.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDefinition {
    pub name: String,
    pub value: Value,
}

impl GlobalDefinition {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Extra definitions merged into a runtime's `env` module.
#[derive(Debug, Clone, Default)]
pub struct HostModuleDefinitions {
    pub functions: Vec<HostFunctionDefinition>,
    pub memories: Vec<MemoryDefinition>,
    pub globals: Vec<GlobalDefinition>,
}

/// A named bundle of host definitions, not yet visible to guests.
pub struct HostModule {
    name: String,
    runtime: Runtime,
    functions: HashMap<String, HostFunctionDefinition>,
    memories: HashMap<String, MemoryDefinition>,
    globals: HashMap<String, GlobalDefinition>,
}

impl HostModule {
    pub(crate) fn new(name: String, runtime: Runtime) -> Self {
        Self {
            name,
            runtime,
            functions: HashMap::new(),
            memories: HashMap::new(),
            globals: HashMap::new(),
        }
    }

    /// The import module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime the module will be compiled into.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Returns `true` if any item is defined under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
            || self.memories.contains_key(name)
            || self.globals.contains_key(name)
    }

    /// Check a batch of names of one kind. Names are shared across kinds
    /// because guests import all of them from the same namespace.
    fn check_batch<'n>(
        &self,
        kind: DefinitionKind,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<(), RuntimeError> {
        let mut seen = HashSet::new();
        for name in names {
            if self.contains(name) || !seen.insert(name) {
                return Err(RuntimeError::already_defined(kind, name, &self.name));
            }
        }
        Ok(())
    }

    /// Add host functions.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDefined`] on a duplicate name, or
    /// [`RuntimeError::InvalidSignature`] for a malformed declaration.
    /// Nothing from the batch is inserted on error.
    pub fn functions(
        &mut self,
        defs: impl IntoIterator<Item = HostFunctionDefinition>,
    ) -> Result<(), RuntimeError> {
        let defs: Vec<_> = defs.into_iter().collect();
        self.check_batch(DefinitionKind::Function, defs.iter().map(HostFunctionDefinition::name))?;
        for def in &defs {
            def.validate()?;
        }

        for def in defs {
            self.functions.insert(def.name().to_string(), def);
        }
        Ok(())
    }

    /// Add host memories.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDefined`] on a duplicate name, or
    /// [`RuntimeError::InvalidSignature`] if a maximum is below the
    /// initial size. Nothing from the batch is inserted on error.
    pub fn memories(
        &mut self,
        defs: impl IntoIterator<Item = MemoryDefinition>,
    ) -> Result<(), RuntimeError> {
        let defs: Vec<_> = defs.into_iter().collect();
        self.check_batch(DefinitionKind::Memory, defs.iter().map(|d| d.name.as_str()))?;
        for def in &defs {
            if def.max_pages.is_some_and(|max| max < def.pages) {
                return Err(RuntimeError::invalid_signature(
                    &def.name,
                    format!("maximum below initial size of {} pages", def.pages),
                ));
            }
        }

        for def in defs {
            self.memories.insert(def.name.clone(), def);
        }
        Ok(())
    }

    /// Add immutable globals.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDefined`] on a duplicate name.
    /// Nothing from the batch is inserted on error.
    pub fn globals(
        &mut self,
        defs: impl IntoIterator<Item = GlobalDefinition>,
    ) -> Result<(), RuntimeError> {
        let defs: Vec<_> = defs.into_iter().collect();
        self.check_batch(DefinitionKind::Global, defs.iter().map(|d| d.name.as_str()))?;

        for def in defs {
            self.globals.insert(def.name.clone(), def);
        }
        Ok(())
    }

    /// Define everything in the linker and register the module.
    ///
    /// # Errors
    ///
    /// Returns an error if a module is already registered under this name
    /// or the engine rejects a definition, and [`RuntimeError::Busy`] while
    /// a start routine holds the store.
    #[instrument(skip(self), fields(module = %self.name))]
    pub async fn compile(self) -> Result<ModuleInstance, RuntimeError> {
        self.runtime.ensure_open()?;
        let engine = self.runtime.instance().service().engine().clone();

        let mut state = self.runtime.store().await?;
        if self.runtime.modules().read().lookup(&self.name).is_some() {
            return Err(RuntimeError::instantiation(
                &self.name,
                "a module is already registered under this name",
            ));
        }
        let state = &mut *state;
        let fail = |e: anyhow::Error| RuntimeError::instantiation(&self.name, e);

        for def in self.functions.values() {
            bridge::define(&mut state.linker, engine.inner(), &self.name, def)?;
        }

        for def in self.memories.values() {
            let memory =
                wasmtime::Memory::new(&mut state.store, MemoryType::new(def.pages, def.max_pages))
                    .map_err(fail)?;
            state
                .linker
                .define(&mut state.store, &self.name, &def.name, memory)
                .map_err(fail)?;
            debug!(memory = %def.name, pages = def.pages, "Host memory defined");
        }

        for def in self.globals.values() {
            let val = def
                .value
                .to_val()
                .map_err(|reason| RuntimeError::invalid_signature(&def.name, reason))?;
            let ty = GlobalType::new(def.value.ty().to_val_type(), Mutability::Const);
            let global = Global::new(&mut state.store, ty, val).map_err(fail)?;
            state
                .linker
                .define(&mut state.store, &self.name, &def.name, global)
                .map_err(fail)?;
            debug!(global = %def.name, "Host global defined");
        }

        let functions: Vec<(String, wasmtime::Func)> = self
            .functions
            .keys()
            .filter_map(|name| {
                let func = state
                    .linker
                    .get(&mut state.store, &self.name, name)
                    .and_then(wasmtime::Extern::into_func)?;
                Some((name.clone(), func))
            })
            .collect();
        let slot = Arc::new(ModuleSlot::new(
            self.name.as_str(),
            ModuleKind::Host,
            &state.store,
            functions,
        ));
        self.runtime.modules().write().insert(Arc::clone(&slot));

        info!(
            functions = self.functions.len(),
            memories = self.memories.len(),
            globals = self.globals.len(),
            "Host module compiled"
        );

        Ok(ModuleInstance::new(slot, self.runtime.clone()))
    }
}

impl std::fmt::Debug for HostModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostModule")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("memories", &self.memories.len())
            .field("globals", &self.globals.len())
            .finish_non_exhaustive()
    }
}
