//! Lifecycle Hooks
//!
//! Components opt into two optional hooks by implementing the traits here
//! and returning themselves from the matching
//! [`Component`](crate::instances::Component) accessor:
//!
//! - [`OnIpcInit`]: runs once the server starts serving, before readiness
//! - [`OnIpcDisconnect`]: runs each time a peer goes away
//!
//! [`LifecycleHookDispatcher`] awaits hooks one at a time in
//! [`InstanceSet`] order. The first failing hook aborts the remaining
//! dispatch and its error is returned to the caller.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{PeerHandle, ServerChannel};
use crate::error::HookError;
use crate::instances::InstanceSet;

/// Outcome of a hook
pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Runs when the server starts serving
#[async_trait]
pub trait OnIpcInit: Send + Sync {
    /// Called with the server channel, which the hook may emit on
    async fn on_ipc_init(&self, channel: &dyn ServerChannel) -> HookResult;
}

/// Runs when a peer disconnects
#[async_trait]
pub trait OnIpcDisconnect: Send + Sync {
    /// Called with the peer that went away
    async fn on_ipc_disconnect(&self, peer: &PeerHandle) -> HookResult;
}

/// Sequential hook runner
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleHookDispatcher {
    timeout: Option<Duration>,
}

impl LifecycleHookDispatcher {
    /// Create a dispatcher; `None` waits for each hook indefinitely
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Per-hook timeout, if any
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run every `on_ipc_init` hook in order
    ///
    /// Returns the number of hooks invoked.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure or timeout; later hooks do not run.
    pub async fn on_init(
        &self,
        instances: &InstanceSet,
        channel: &dyn ServerChannel,
    ) -> Result<usize, HookError> {
        let mut invoked = 0;
        for instance in instances {
            let Some(hook) = instance.init_hook() else {
                continue;
            };
            tracing::debug!(instance = instance.name(), "Running on_ipc_init");
            self.settle(instance.name(), hook.on_ipc_init(channel))
                .await?;
            invoked += 1;
        }
        Ok(invoked)
    }

    /// Run every `on_ipc_disconnect` hook in order
    ///
    /// Returns the number of hooks invoked.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure or timeout; later hooks do not run.
    pub async fn on_disconnect(
        &self,
        instances: &InstanceSet,
        peer: &PeerHandle,
    ) -> Result<usize, HookError> {
        let mut invoked = 0;
        for instance in instances {
            let Some(hook) = instance.disconnect_hook() else {
                continue;
            };
            tracing::debug!(instance = instance.name(), peer = %peer, "Running on_ipc_disconnect");
            self.settle(instance.name(), hook.on_ipc_disconnect(peer))
                .await?;
            invoked += 1;
        }
        Ok(invoked)
    }

    async fn settle<F>(&self, instance: &str, hook: F) -> Result<(), HookError>
    where
        F: Future<Output = HookResult>,
    {
        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, hook).await.map_err(|_| {
                HookError::TimedOut {
                    instance: instance.to_string(),
                    timeout,
                }
            })?,
            None => hook.await,
        };
        outcome.map_err(|e| HookError::failed(instance, e.to_string()))
    }
}
