//! Execution identity and cancellation.
//!
//! An [`ExecutionContext`] is threaded through every core operation. It
//! names who is executing (project, application, resource, branches,
//! commit) and carries the cancellation token that governs suspensions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity + cancellation for one execution.
///
/// Cloning with [`Clone`] shares both identity and token. Use
/// [`ExecutionContext::clone_with`] or [`ExecutionContext::child`] to get
/// a context governed by a different cancellation scope.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: Uuid,
    identity: Arc<Identity>,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Identity {
    project: String,
    application: String,
    resource: String,
    branches: Vec<String>,
    commit: String,
}

impl ExecutionContext {
    /// Start building a context.
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// Unique id of this context. [`clone_with`](Self::clone_with) mints a new one.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait until this context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel this context and everything derived from its token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn project(&self) -> &str {
        &self.identity.project
    }

    pub fn application(&self) -> &str {
        &self.identity.application
    }

    pub fn resource(&self) -> &str {
        &self.identity.resource
    }

    pub fn branches(&self) -> &[String] {
        &self.identity.branches
    }

    pub fn commit(&self) -> &str {
        &self.identity.commit
    }

    /// Same identity, governed by `token`.
    ///
    /// Used when a background task must outlive, or be cancelled
    /// independently from, the call that spawned it.
    #[must_use]
    pub fn clone_with(&self, token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: Arc::clone(&self.identity),
            token,
        }
    }

    /// Same identity, governed by a child of the current token.
    #[must_use]
    pub fn child(&self) -> Self {
        self.clone_with(self.token.child_token())
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Debug, Default)]
pub struct ExecutionContextBuilder {
    identity: Identity,
    token: Option<CancellationToken>,
}

impl ExecutionContextBuilder {
    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.identity.project = project.into();
        self
    }

    #[must_use]
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.identity.application = application.into();
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.identity.resource = resource.into();
        self
    }

    #[must_use]
    pub fn branches<I, S>(mut self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity.branches = branches.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn commit(mut self, commit: impl Into<String>) -> Self {
        self.identity.commit = commit.into();
        self
    }

    /// Govern the context by an existing token instead of a fresh one.
    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Build the context.
    #[must_use]
    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            id: Uuid::new_v4(),
            identity: Arc::new(self.identity),
            token: self.token.unwrap_or_default(),
        }
    }
}
