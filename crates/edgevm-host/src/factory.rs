//! Capability SDK factories.
//!
//! A [`Factory`] is one capability (database, storage, ...) bound to one
//! instance. It declares its guest-visible methods as host functions whose
//! names carry the `W_` prefix; loading exports each under its name with
//! the prefix stripped. [`FactoryPlugin`] bundles factory constructors
//! into a [`Plugin`] so a whole SDK attaches with one call.

use std::sync::Arc;

use tracing::{debug, warn};

use edgevm_common::RuntimeError;
use edgevm_core::{HostFunctionDefinition, HostModule, Instance, Plugin, PluginInstance};

/// Prefix marking a factory method as guest-visible.
pub const EXPORT_PREFIX: &str = "W_";

/// Guest-visible name of `method`, or `None` if it is not exported.
pub fn export_name(method: &str) -> Option<&str> {
    method
        .strip_prefix(EXPORT_PREFIX)
        .filter(|name| !name.is_empty())
}

/// One capability bound to an instance.
pub trait Factory: Send + Sync {
    fn name(&self) -> &str;

    /// Every method of the factory, exported or not.
    fn methods(&self) -> Vec<HostFunctionDefinition>;

    /// Add the exported methods to `module`.
    ///
    /// # Errors
    ///
    /// Returns the definition error if a name collides.
    fn load(&mut self, module: &mut HostModule) -> Result<(), RuntimeError> {
        let exported = self.methods().into_iter().filter_map(|method| {
            match export_name(method.name()).map(str::to_owned) {
                Some(name) => Some(method.with_name(name)),
                None => {
                    debug!(factory = %self.name(), method = %method.name(), "Method not exported");
                    None
                }
            }
        });
        module.functions(exported.collect::<Vec<_>>())
    }

    /// Release everything the factory holds.
    fn close(&mut self) {}
}

/// Builds a factory for one instance.
pub type FactoryConstructor =
    Arc<dyn Fn(&Instance) -> Result<Box<dyn Factory>, RuntimeError> + Send + Sync>;

/// A [`Plugin`] made of factories.
#[derive(Clone)]
pub struct FactoryPlugin {
    name: String,
    constructors: Vec<FactoryConstructor>,
}

impl FactoryPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructors: Vec::new(),
        }
    }

    /// Add a factory constructor.
    #[must_use]
    pub fn with<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&Instance) -> Result<Box<dyn Factory>, RuntimeError> + Send + Sync + 'static,
    {
        self.constructors.push(Arc::new(constructor));
        self
    }
}

impl Plugin for FactoryPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_instance(&self, instance: &Instance) -> Result<Box<dyn PluginInstance>, RuntimeError> {
        let mut factories: Vec<Box<dyn Factory>> = Vec::with_capacity(self.constructors.len());
        for constructor in &self.constructors {
            match constructor(instance) {
                Ok(factory) => factories.push(factory),
                Err(e) => {
                    warn!(plugin = %self.name, error = %e, "Factory construction failed");
                    for factory in &mut factories {
                        factory.close();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Box::new(FactoryPluginInstance { factories }))
    }
}

impl std::fmt::Debug for FactoryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryPlugin")
            .field("name", &self.name)
            .field("factories", &self.constructors.len())
            .finish()
    }
}

/// Factories of one attached [`FactoryPlugin`].
pub struct FactoryPluginInstance {
    factories: Vec<Box<dyn Factory>>,
}

impl FactoryPluginInstance {
    pub fn factories(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|factory| factory.name())
    }
}

impl PluginInstance for FactoryPluginInstance {
    fn load(&mut self, module: &mut HostModule) -> Result<(), RuntimeError> {
        for factory in &mut self.factories {
            factory.load(module)?;
            debug!(module = %module.name(), factory = %factory.name(), "Factory loaded");
        }
        Ok(())
    }

    fn close(&mut self) {
        for factory in &mut self.factories {
            factory.close();
        }
    }
}
