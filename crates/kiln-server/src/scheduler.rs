//! Per-task drivers with failure isolation and bounded draining.

use crate::state::SharedState;
use crate::{ScheduledTask, TaskContext, TaskError};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How draining ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    /// Every in-flight run finished on its own.
    Completed,
    /// The drain timeout elapsed; these tasks were aborted mid-run.
    Forced(Vec<String>),
}

pub(crate) struct Scheduler {
    drivers: JoinSet<()>,
    drain: CancellationToken,
    hard: CancellationToken,
    state: SharedState,
}

impl Scheduler {
    pub(crate) fn new(state: SharedState) -> Self {
        Self {
            drivers: JoinSet::new(),
            drain: CancellationToken::new(),
            hard: CancellationToken::new(),
            state,
        }
    }

    /// Token handed to task runs; cancelled when the drain times out.
    pub(crate) fn hard_token(&self) -> CancellationToken {
        self.hard.clone()
    }

    pub(crate) fn spawn(&mut self, task: Arc<dyn ScheduledTask>, ctx: TaskContext) {
        self.state.write().register_task(task.name(), task.interval());
        let drain = self.drain.clone();
        let state = self.state.clone();
        self.drivers.spawn(drive(task, ctx, drain, state));
    }

    /// Stops scheduling and waits up to `timeout` for in-flight runs.
    pub(crate) async fn drain(mut self, timeout: Duration) -> DrainOutcome {
        self.drain.cancel();

        let finished = tokio::time::timeout(timeout, async {
            while self.drivers.join_next().await.is_some() {}
        })
        .await;

        if finished.is_ok() {
            return DrainOutcome::Completed;
        }

        self.hard.cancel();
        self.drivers.abort_all();
        while self.drivers.join_next().await.is_some() {}

        let aborted = self.state.write().abort_in_flight();
        for name in &aborted {
            warn!(task = %name, "in-flight task aborted after drain timeout");
        }
        DrainOutcome::Forced(aborted)
    }
}

async fn drive(
    task: Arc<dyn ScheduledTask>,
    ctx: TaskContext,
    drain: CancellationToken,
    state: SharedState,
) {
    let name = task.name().to_string();
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = drain.cancelled() => break,
            _ = ticker.tick() => {}
        }

        state.write().task_started(&name);
        debug!(task = %name, "task run started");

        let outcome = AssertUnwindSafe(task.run(&ctx)).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(TaskError::Panicked(panic_message(panic.as_ref()))),
        };

        if let Some(e) = &error {
            error!(task = %name, error = %e, "scheduled task failed");
        }
        state.write().task_finished(&name, error.map(|e| e.to_string()));
    }

    debug!(task = %name, "task driver stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
