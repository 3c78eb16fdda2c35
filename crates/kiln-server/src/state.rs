//! Server state and its read-only snapshot view.

use chrono::{DateTime, Utc};
use kiln_types::Profile;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const RECENT_FAILURES: usize = 20;

/// Lifecycle phase of the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerPhase {
    /// Constructed, not yet started.
    #[default]
    Idle,
    /// Acquiring resources.
    Starting,
    /// Running scheduled tasks.
    Running,
    /// Refusing new work, waiting for in-flight tasks.
    Draining,
    /// All resources released.
    Stopped,
}

impl ServerPhase {
    /// Returns the phase as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Run statistics for one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task name.
    pub name: String,
    /// Scheduling interval.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Completed runs, successful or not.
    pub runs: u64,
    /// Runs that returned an error or panicked.
    pub failures: u64,
    /// True while a run is in progress.
    pub in_flight: bool,
    /// True if an in-flight run was aborted at the end of draining.
    #[serde(default)]
    pub aborted: bool,
    /// Start time of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A recorded task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Task name.
    pub task: String,
    /// When the run failed.
    pub at: DateTime<Utc>,
    /// What went wrong.
    pub error: String,
}

/// Point-in-time copy of the server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Server process id.
    pub pid: u32,
    /// Server profile.
    pub profile: Profile,
    /// Current lifecycle phase.
    pub phase: ServerPhase,
    /// When the loop entered `Starting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Names of held resources, in acquisition order.
    pub resources: Vec<String>,
    /// Per-task statistics, in registration order.
    pub tasks: Vec<TaskRecord>,
    /// Most recent task failures, oldest first.
    pub recent_failures: Vec<TaskFailure>,
    /// When this snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Mutable state owned by the server loop.
#[derive(Debug)]
pub(crate) struct ServerState {
    profile: Profile,
    phase: ServerPhase,
    started_at: Option<DateTime<Utc>>,
    resources: Vec<String>,
    tasks: Vec<TaskRecord>,
    recent_failures: VecDeque<TaskFailure>,
}

impl ServerState {
    pub(crate) const fn new(profile: Profile) -> Self {
        Self {
            profile,
            phase: ServerPhase::Idle,
            started_at: None,
            resources: Vec::new(),
            tasks: Vec::new(),
            recent_failures: VecDeque::new(),
        }
    }

    pub(crate) fn set_phase(&mut self, phase: ServerPhase) {
        if phase == ServerPhase::Starting {
            self.started_at = Some(Utc::now());
        }
        self.phase = phase;
    }

    pub(crate) fn resource_acquired(&mut self, name: &str) {
        self.resources.push(name.to_string());
    }

    pub(crate) fn resource_released(&mut self, name: &str) {
        if let Some(pos) = self.resources.iter().rposition(|r| r == name) {
            self.resources.remove(pos);
        }
    }

    pub(crate) fn register_task(&mut self, name: &str, interval: Duration) {
        self.tasks.push(TaskRecord {
            name: name.to_string(),
            interval,
            runs: 0,
            failures: 0,
            in_flight: false,
            aborted: false,
            last_run_at: None,
            last_error: None,
        });
    }

    pub(crate) fn task_started(&mut self, name: &str) {
        if let Some(task) = self.task_mut(name) {
            task.in_flight = true;
            task.last_run_at = Some(Utc::now());
        }
    }

    pub(crate) fn task_finished(&mut self, name: &str, error: Option<String>) {
        let Some(task) = self.task_mut(name) else {
            return;
        };
        task.in_flight = false;
        task.runs += 1;

        if let Some(error) = error {
            task.failures += 1;
            task.last_error = Some(error.clone());
            if self.recent_failures.len() == RECENT_FAILURES {
                self.recent_failures.pop_front();
            }
            self.recent_failures.push_back(TaskFailure {
                task: name.to_string(),
                at: Utc::now(),
                error,
            });
        }
    }

    /// Marks every in-flight task as aborted.
    pub(crate) fn abort_in_flight(&mut self) -> Vec<String> {
        self.tasks
            .iter_mut()
            .filter(|t| t.in_flight)
            .map(|t| {
                t.in_flight = false;
                t.aborted = true;
                t.name.clone()
            })
            .collect()
    }

    fn task_mut(&mut self, name: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            pid: std::process::id(),
            profile: self.profile,
            phase: self.phase,
            started_at: self.started_at,
            resources: self.resources.clone(),
            tasks: self.tasks.clone(),
            recent_failures: self.recent_failures.iter().cloned().collect(),
            taken_at: Utc::now(),
        }
    }
}

/// Shared handle through which the loop mutates its state.
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<RwLock<ServerState>>);

impl SharedState {
    pub(crate) fn new(profile: Profile) -> Self {
        Self(Arc::new(RwLock::new(ServerState::new(profile))))
    }

    /// Locks for writing. A poisoned lock is recovered: every writer leaves
    /// the state consistent between statements.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ServerState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, ServerState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn view(&self) -> StateView {
        StateView(self.clone())
    }
}

/// Read-only access to a running server's state.
///
/// Readers only ever get a cloned [`ServerSnapshot`]; the lock is held for
/// the duration of the copy.
#[derive(Debug, Clone)]
pub struct StateView(SharedState);

impl StateView {
    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ServerSnapshot {
        self.0.read().snapshot()
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> ServerPhase {
        self.0.read().phase
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_bookkeeping() {
        let shared = SharedState::new(Profile::Production);
        let view = shared.view();
        {
            let mut state = shared.write();
            state.register_task("status-snapshot", Duration::from_secs(15));
            state.task_started("status-snapshot");
        }
        assert!(view.snapshot().tasks[0].in_flight);

        shared.write().task_finished("status-snapshot", Some("disk full".into()));
        let snap = view.snapshot();
        assert_eq!(snap.tasks[0].runs, 1);
        assert_eq!(snap.tasks[0].failures, 1);
        assert_eq!(snap.tasks[0].last_error.as_deref(), Some("disk full"));
        assert_eq!(snap.recent_failures.len(), 1);
        assert!(!snap.tasks[0].in_flight);
    }

    #[test]
    fn test_recent_failures_are_bounded() {
        let shared = SharedState::new(Profile::Production);
        let mut state = shared.write();
        state.register_task("t", Duration::from_secs(1));
        for i in 0..(RECENT_FAILURES + 5) {
            state.task_finished("t", Some(format!("failure {i}")));
        }
        drop(state);

        let snap = shared.view().snapshot();
        assert_eq!(snap.recent_failures.len(), RECENT_FAILURES);
        assert_eq!(snap.recent_failures[0].error, "failure 5");
        assert_eq!(snap.tasks[0].failures, (RECENT_FAILURES + 5) as u64);
    }

    #[test]
    fn test_phase_and_resources() {
        let shared = SharedState::new(Profile::Development);
        {
            let mut state = shared.write();
            state.set_phase(ServerPhase::Starting);
            state.resource_acquired("data-dir-lock");
            state.resource_acquired("status-file");
            state.resource_released("status-file");
        }
        let snap = shared.view().snapshot();
        assert_eq!(snap.phase, ServerPhase::Starting);
        assert!(snap.started_at.is_some());
        assert_eq!(snap.resources, vec!["data-dir-lock".to_string()]);
        assert_eq!(snap.profile, Profile::Development);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let shared = SharedState::new(Profile::Production);
        shared.write().register_task("report-retention", Duration::from_secs(3600));
        let snap = shared.view().snapshot();

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"phase\":\"idle\""));
        let back: ServerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
