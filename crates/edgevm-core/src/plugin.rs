//! Plugin contract.
//!
//! A [`Plugin`] is a capability SDK that can be attached to any runtime.
//! Attaching creates a [`PluginInstance`] bound to the runtime's
//! [`Instance`], which then fills a host module named after the plugin.

use crate::Instance;
use crate::host_module::HostModule;
use edgevm_common::RuntimeError;

/// A capability SDK.
pub trait Plugin: Send + Sync {
    /// Name of the host module the plugin is exposed as.
    fn name(&self) -> &str;

    /// Create the per-instance state of the plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot serve `instance`.
    fn new_instance(&self, instance: &Instance) -> Result<Box<dyn PluginInstance>, RuntimeError>;
}

/// Per-instance state of an attached plugin.
pub trait PluginInstance: Send + Sync {
    /// Add the plugin's definitions to `module`.
    ///
    /// # Errors
    ///
    /// Returns the definition error on collision.
    fn load(&mut self, module: &mut HostModule) -> Result<(), RuntimeError>;

    /// Release resources held for the instance.
    fn close(&mut self) {}
}
