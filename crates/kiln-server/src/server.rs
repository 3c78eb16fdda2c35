//! The server loop.

use crate::resource::ResourceStack;
use crate::scheduler::{DrainOutcome, Scheduler};
use crate::state::SharedState;
use crate::{
    ArtifactCheck, ConfigWatch, DataDirLock, ReportRetention, Resource, ResourceProvider,
    ScheduledTask, ServerError, ServerPhase, StartupContext, StateView, StatusFile,
    StatusSnapshot, TaskContext,
};
use kiln_config::ProcessConfig;
use kiln_types::Profile;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the server loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Stopped on cancellation.
    Stopped,
    /// Stopped because a task requested a reload.
    Reload,
}

/// What happened while the loop was draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    /// Why the loop stopped.
    pub exit: ServerExit,
    /// Tasks aborted because they were still running when the drain timeout
    /// elapsed. Empty on a clean drain.
    pub aborted: Vec<String>,
}

impl Shutdown {
    /// Returns true if every in-flight run finished on its own.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Hosts process-wide resources and recurring tasks until cancelled.
///
/// Lifecycle: `Idle -> Starting -> Running -> Draining -> Stopped`.
/// Resources are acquired in registration order during `Starting`; if one
/// fails the loop goes straight to `Stopped` after releasing the ones already
/// held. Cancellation moves `Running` to `Draining`: no new task run starts,
/// in-flight runs get up to the drain timeout, then every resource is
/// released in reverse order. Dropping the `run` future part way still
/// releases whatever is held, through [`Resource::release_now`].
pub struct ServerLoop {
    config: Arc<ProcessConfig>,
    profile: Profile,
    providers: Vec<Box<dyn ResourceProvider>>,
    tasks: Vec<Arc<dyn ScheduledTask>>,
    state: SharedState,
    reload: CancellationToken,
}

impl std::fmt::Debug for ServerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLoop")
            .field("profile", &self.profile)
            .field("resources", &self.resource_names())
            .field("tasks", &self.task_names())
            .finish_non_exhaustive()
    }
}

impl ServerLoop {
    /// Creates a loop with no resources and no tasks.
    #[must_use]
    pub fn new(config: Arc<ProcessConfig>, profile: Profile) -> Self {
        Self {
            config,
            profile,
            providers: Vec::new(),
            tasks: Vec::new(),
            state: SharedState::new(profile),
            reload: CancellationToken::new(),
        }
    }

    /// Creates a loop with the built-in resources and tasks for `profile`.
    #[must_use]
    pub fn with_defaults(config: Arc<ProcessConfig>, profile: Profile) -> Self {
        let server = &config.server;
        let mut this = Self::new(config.clone(), profile)
            .with_resource(DataDirLock)
            .with_task(StatusSnapshot::new(server.status_interval))
            .with_task(ReportRetention::new(server.report_retention));

        if server.require_artifacts {
            this = this.with_resource(ArtifactCheck);
        }
        this = this.with_resource(StatusFile);

        let watched = config.source_file.as_ref().filter(|_| profile.auto_reload());
        if let Some(file) = watched {
            this = this.with_task(ConfigWatch::new(file));
        }
        this
    }

    /// Adds a resource, acquired after those already registered.
    #[must_use]
    pub fn with_resource(mut self, provider: impl ResourceProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Adds a scheduled task.
    #[must_use]
    pub fn with_task(mut self, task: impl ScheduledTask + 'static) -> Self {
        self.tasks.push(Arc::new(task));
        self
    }

    /// Returns read access to the server state.
    #[must_use]
    pub fn view(&self) -> StateView {
        self.state.view()
    }

    /// Returns the server profile.
    #[must_use]
    pub const fn profile(&self) -> Profile {
        self.profile
    }

    /// Returns the registered resource names, in acquisition order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Returns the registered task names.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Runs until `cancel` fires or a task requests a reload.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Startup`] naming the resource that could not
    /// be acquired.
    pub async fn run(self, cancel: CancellationToken) -> Result<Shutdown, ServerError> {
        let drain_timeout = self.config.server.drain_timeout;
        self.set_phase(ServerPhase::Starting);
        info!(profile = %self.profile, resources = self.providers.len(), "server starting");

        let startup = StartupContext {
            config: self.config.clone(),
            state: self.view(),
        };
        let mut resources =
            match ResourceStack::acquire_all(self.state.clone(), &self.providers, &startup).await {
                Ok(resources) => resources,
                Err(e) => {
                    self.set_phase(ServerPhase::Stopped);
                    return Err(e);
                }
            };

        let mut scheduler = Scheduler::new(self.state.clone());
        let ctx = TaskContext::new(
            self.config.clone(),
            self.view(),
            scheduler.hard_token(),
            self.reload.clone(),
        );
        for task in &self.tasks {
            scheduler.spawn(task.clone(), ctx.clone());
        }

        self.set_phase(ServerPhase::Running);
        info!(tasks = self.tasks.len(), "server running");

        let exit = tokio::select! {
            () = cancel.cancelled() => ServerExit::Stopped,
            () = self.reload.cancelled() => ServerExit::Reload,
        };

        self.set_phase(ServerPhase::Draining);
        info!(?exit, timeout = ?drain_timeout, "server draining");
        let aborted = match scheduler.drain(drain_timeout).await {
            DrainOutcome::Completed => Vec::new(),
            DrainOutcome::Forced(aborted) => {
                warn!(count = aborted.len(), "drain timed out, in-flight tasks aborted");
                aborted
            }
        };

        resources.release_all().await;
        self.set_phase(ServerPhase::Stopped);
        info!("server stopped");

        Ok(Shutdown { exit, aborted })
    }

    fn set_phase(&self, phase: ServerPhase) {
        self.state.write().set_phase(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Tracked;
    use crate::scheduler::testing::Sleeper;
    use crate::{ResourceError, TaskError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path, drain: Duration) -> Arc<ProcessConfig> {
        let mut config = ProcessConfig::with_data_dir(dir);
        config.server.drain_timeout = drain;
        Arc::new(config)
    }

    /// Forwards to a shared [`Sleeper`] so the test can inspect its counters.
    struct Shared(Arc<Sleeper>);

    #[async_trait]
    impl ScheduledTask for Shared {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn interval(&self) -> Duration {
            self.0.interval()
        }

        async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
            self.0.run(ctx).await
        }
    }

    fn release_count(log: &Mutex<Vec<String>>, name: &str) -> usize {
        let entry = format!("release {name}");
        log.lock().unwrap().iter().filter(|e| **e == entry).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_tasks_then_releases() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let fast = Arc::new(Sleeper::new("fast", Duration::from_secs(60), Duration::from_secs(1)));
        let slow = Arc::new(Sleeper::new("slow", Duration::from_secs(60), Duration::from_secs(3)));

        let server = ServerLoop::new(config(temp.path(), Duration::from_secs(10)), Profile::Production)
            .with_resource(Tracked::new("lock", &log))
            .with_resource(Tracked::new("status", &log))
            .with_task(Shared(fast.clone()))
            .with_task(Shared(slow.clone()));
        let view = server.view();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(view.phase(), ServerPhase::Running);
        assert_eq!((fast.started(), slow.started()), (1, 1));

        cancel.cancel();
        let shutdown = handle.await.unwrap().unwrap();

        assert_eq!(shutdown.exit, ServerExit::Stopped);
        assert!(shutdown.is_clean());
        assert_eq!((fast.started(), slow.started()), (1, 1));
        assert_eq!((fast.completed(), slow.completed()), (1, 1));
        assert_eq!(release_count(&log, "lock"), 1);
        assert_eq!(release_count(&log, "status"), 1);
        assert_eq!(
            *log.lock().unwrap(),
            ["acquire lock", "acquire status", "release status", "release lock"]
        );
        assert_eq!(view.phase(), ServerPhase::Stopped);
        assert!(view.snapshot().resources.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_tasks_are_stopped_and_resources_released_once() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stuck = Sleeper::new("stuck", Duration::from_secs(60), Duration::from_secs(3600));
        stuck.honor_cancel = false;
        let stuck = Arc::new(stuck);
        let polite = Arc::new(Sleeper::new("polite", Duration::from_secs(60), Duration::from_secs(3600)));

        let server = ServerLoop::new(config(temp.path(), Duration::from_secs(2)), Profile::Production)
            .with_resource(Tracked::new("lock", &log))
            .with_task(Shared(stuck.clone()))
            .with_task(Shared(polite.clone()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let started = tokio::time::Instant::now();
        let shutdown = handle.await.unwrap().unwrap();

        assert!(started.elapsed() <= Duration::from_secs(3));
        assert!(shutdown.aborted.contains(&"stuck".to_string()));
        assert_eq!(stuck.completed(), 0);
        assert_eq!(polite.completed(), 0);
        assert_eq!(release_count(&log, "lock"), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_releases_acquired_and_starts_no_tasks() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new(Sleeper::new("t", Duration::from_secs(1), Duration::ZERO));

        let server = ServerLoop::new(config(temp.path(), Duration::from_secs(1)), Profile::Production)
            .with_resource(Tracked::new("lock", &log))
            .with_resource(Tracked::failing("artifacts", &log))
            .with_task(Shared(task.clone()));
        let view = server.view();

        let err = server.run(CancellationToken::new()).await.unwrap_err();

        let ServerError::Startup { resource, source } = err;
        assert_eq!(resource, "artifacts");
        assert!(matches!(source, ResourceError::NoReport(_)));
        assert_eq!(*log.lock().unwrap(), ["acquire lock", "release lock"]);
        assert_eq!(task.started(), 0);
        assert_eq!(view.phase(), ServerPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_request_stops_loop() {
        struct Reloader;

        #[async_trait]
        impl ScheduledTask for Reloader {
            fn name(&self) -> &str {
                "reloader"
            }

            fn interval(&self) -> Duration {
                Duration::from_secs(1)
            }

            async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
                ctx.request_reload();
                Ok(())
            }
        }

        let temp = TempDir::new().unwrap();
        let server = ServerLoop::new(config(temp.path(), Duration::from_secs(1)), Profile::Development)
            .with_task(Reloader);

        let shutdown = server.run(CancellationToken::new()).await.unwrap();
        assert_eq!(shutdown.exit, ServerExit::Reload);
    }

    #[test]
    fn test_defaults_follow_profile_and_config() {
        let temp = TempDir::new().unwrap();
        let mut config = ProcessConfig::with_data_dir(temp.path());
        config.source_file = Some(temp.path().join("kiln.toml"));

        let production = ServerLoop::with_defaults(Arc::new(config.clone()), Profile::Production);
        assert_eq!(production.resource_names(), ["data-dir-lock", "status-file"]);
        assert_eq!(production.task_names(), ["status-snapshot", "report-retention"]);

        config.server.require_artifacts = true;
        let development = ServerLoop::with_defaults(Arc::new(config), Profile::Development);
        assert_eq!(
            development.resource_names(),
            ["data-dir-lock", "artifacts", "status-file"]
        );
        assert_eq!(
            development.task_names(),
            ["status-snapshot", "report-retention", "config-watch"]
        );
    }

    #[tokio::test]
    async fn test_built_in_server_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path(), Duration::from_secs(1));
        let server = ServerLoop::with_defaults(config.clone(), Profile::Production);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(config.lock_file().exists());
        assert!(config.status_file().exists());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(config.lock_file()).unwrap(), "");
        assert!(!config.status_file().exists());
    }

    #[tokio::test]
    async fn test_dropping_a_draining_server_releases_resources() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stuck = Sleeper::new("stuck", Duration::from_secs(60), Duration::from_secs(3600));
        stuck.honor_cancel = false;

        let config = config(temp.path(), Duration::from_secs(3600));
        let server = ServerLoop::new(config.clone(), Profile::Production)
            .with_resource(DataDirLock)
            .with_resource(Tracked::new("extra", &log))
            .with_resource(StatusFile)
            .with_task(stuck);
        let view = server.view();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let run = server.run(cancel);
        let dropped = tokio::time::timeout(Duration::from_millis(300), run).await;

        assert!(dropped.is_err());
        assert_eq!(release_count(&log, "extra"), 1);
        assert!(!config.status_file().exists());
        assert_eq!(std::fs::read_to_string(config.lock_file()).unwrap(), "");
        assert!(view.snapshot().resources.is_empty());
    }
}
