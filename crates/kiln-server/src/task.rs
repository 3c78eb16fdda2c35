//! Recurring background work hosted by the server loop.

use crate::{StateView, TaskError};
use async_trait::async_trait;
use kiln_config::ProcessConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A unit of recurring work.
///
/// Runs once immediately after the server reaches `Running`, then once per
/// [`interval`](ScheduledTask::interval). A run is never started while the
/// previous run of the same task is still in flight.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Task name used in logs and the server snapshot.
    fn name(&self) -> &str;

    /// Time between runs.
    fn interval(&self) -> Duration;

    /// Performs one run.
    ///
    /// Long runs should watch [`TaskContext::cancelled`]: it fires when the
    /// drain timeout elapses, shortly before the run is aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if the run failed. The failure is recorded and the
    /// task is scheduled again.
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Handles passed to every task run.
#[derive(Debug, Clone)]
pub struct TaskContext {
    config: Arc<ProcessConfig>,
    state: StateView,
    cancel: CancellationToken,
    reload: CancellationToken,
}

impl TaskContext {
    pub(crate) const fn new(
        config: Arc<ProcessConfig>,
        state: StateView,
        cancel: CancellationToken,
        reload: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            cancel,
            reload,
        }
    }

    /// Returns the process configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Returns read access to the server state.
    #[must_use]
    pub const fn state(&self) -> &StateView {
        &self.state
    }

    /// Token cancelled when in-flight work must stop.
    #[must_use]
    pub const fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks the server to drain, stop and be restarted with fresh
    /// configuration.
    pub fn request_reload(&self) {
        self.reload.cancel();
    }
}
