//! Sandboxed environment bound to one execution context.
//!
//! An [`Instance`] owns the resources every runtime it spawns shares:
//!
//! 1. A virtual filesystem (a private temporary directory, preopened at `/`)
//! 2. Captured stdout and stderr
//! 3. A cancellation scope: closing the instance, or cancelling the context
//!    it was created with, cancels every runtime and closes the captures

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::host_module::HostModuleDefinitions;
use crate::output::{OutputCapture, OutputReader};
use crate::{ExecutionContext, Runtime, Service};
use edgevm_common::{ExecutionConfig, RuntimeError};

/// One sandboxed environment. Cheap to clone.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    /// Id the service tracks this instance under.
    key: Uuid,
    /// Child scope of the creating context.
    ctx: ExecutionContext,
    config: ExecutionConfig,
    service: Service,
    fs: TempDir,
    stdout: OutputCapture,
    stderr: OutputCapture,
    closed: AtomicBool,
}

impl Instance {
    pub(crate) fn new(
        service: Service,
        ctx: ExecutionContext,
        config: ExecutionConfig,
    ) -> Result<Self, RuntimeError> {
        let key = ctx.id();
        let release = |e: RuntimeError| {
            service.release(key);
            e
        };

        let fs = tempfile::Builder::new()
            .prefix("edgevm-")
            .tempdir()
            .map_err(|e| release(e.into()))?;
        let stdout = OutputCapture::new(config.output, config.buffer_capacity).map_err(release)?;
        let stderr = OutputCapture::new(config.output, config.buffer_capacity).map_err(release)?;

        let scope = ctx.child();
        spawn_watcher(&scope, &stdout, &stderr);

        debug!(context = %key, fs = %fs.path().display(), "Instance filesystem created");

        Ok(Self {
            inner: Arc::new(InstanceInner {
                key,
                ctx: scope,
                config,
                service,
                fs,
                stdout,
                stderr,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The instance context: same identity as the creating context,
    /// governed by a child of its token.
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// Host directory backing the guest filesystem root.
    pub fn filesystem(&self) -> &Path {
        self.inner.fs.path()
    }

    pub(crate) fn stdout_capture(&self) -> &OutputCapture {
        &self.inner.stdout
    }

    pub(crate) fn stderr_capture(&self) -> &OutputCapture {
        &self.inner.stderr
    }

    /// Reader over captured stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe file cannot be reopened.
    pub fn stdout(&self) -> Result<OutputReader, RuntimeError> {
        self.inner.stdout.reader()
    }

    /// Reader over captured stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe file cannot be reopened.
    pub fn stderr(&self) -> Result<OutputReader, RuntimeError> {
        self.inner.stderr.reader()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Create a runtime, merging `definitions` into its `env` module.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Closed`] once the instance is closed, or the
    /// definition error if `definitions` collide with the builtins.
    #[instrument(skip(self, definitions), fields(context = %self.inner.key))]
    pub async fn runtime(
        &self,
        definitions: Option<HostModuleDefinitions>,
    ) -> Result<Runtime, RuntimeError> {
        if self.is_closed() || self.inner.ctx.is_cancelled() {
            return Err(RuntimeError::Closed { what: "instance" });
        }
        Runtime::new(self.clone(), definitions).await
    }

    /// Close the instance: cancel its runtimes, close the captures and
    /// free the context for a new instance. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.ctx.cancel();
        self.inner.stdout.close();
        self.inner.stderr.close();
        self.inner.service.release(self.inner.key);
        info!(context = %self.inner.key, "Instance closed");
    }
}

/// Close the captures once `scope` is cancelled.
fn spawn_watcher(scope: &ExecutionContext, stdout: &OutputCapture, stderr: &OutputCapture) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No Tokio runtime, captures close only with the instance");
        return;
    };

    let scope = scope.clone();
    let stdout = stdout.clone();
    let stderr = stderr.clone();
    handle.spawn(async move {
        scope.cancelled().await;
        stdout.close();
        stderr.close();
        debug!(context = %scope.id(), "Instance captures closed");
    });
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        // Also ends the watcher task
        self.ctx.cancel();
        // A closed instance already released its id, which may be reused by now
        if !*self.closed.get_mut() {
            self.service.release(self.key);
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("context", &self.inner.key)
            .field("fs", &self.inner.fs.path())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
