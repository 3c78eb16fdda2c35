//! Mode selection and top-level lifecycle.
//!
//! The dispatcher validates the mode token before touching anything, resolves
//! the configuration once, then installs signal handling and runs exactly one
//! top-level component under grace-period supervision.

use crate::{logging, progress, signal};
use clap::Parser;
use kiln_config::{ConfigError, ConfigLoader, ProcessConfig};
use kiln_console::{ConsoleSession, EditorReader};
use kiln_fetch::{ClientConfig, DownloadClient, Manifest};
use kiln_jobs::{DownloadJob, JobError, JobRunner, ReportStore};
use kiln_server::{ServerExit, ServerLoop};
use kiln_types::{ExitStatus, KilnError, Mode, Profile};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Command-line inputs other than the mode token.
#[derive(Debug, Clone, Default)]
pub(crate) struct Invocation {
    pub(crate) config_file: Option<PathBuf>,
    pub(crate) verbose: u8,
    pub(crate) quiet: bool,
    pub(crate) args: Vec<String>,
}

/// How the process should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    /// Exit with this status.
    Exit(ExitStatus),
    /// Re-execute the same binary with the same arguments.
    Reload,
}

/// The top-level component a mode runs. Exactly one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Component {
    Server(Profile),
    Console,
    DownloadJob,
}

impl Component {
    pub(crate) const fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Dev => Self::Server(Profile::Development),
            Mode::Start => Self::Server(Profile::Production),
            Mode::Console => Self::Console,
            Mode::DownloadFiles => Self::DownloadJob,
        }
    }

    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Server(_) => "server",
            Self::Console => "console",
            Self::DownloadJob => "download-files",
        }
    }
}

/// Arguments accepted after `download-files`.
#[derive(Parser, Debug)]
#[command(name = "download-files", no_binary_name = true)]
struct DownloadArgs {
    /// Manifest URL or path
    #[arg(long)]
    manifest: Option<String>,

    /// Destination directory
    #[arg(long)]
    destination: Option<PathBuf>,
}

/// Selects and runs the component for a mode.
#[derive(Debug)]
pub(crate) struct ModeDispatcher {
    invocation: Invocation,
    loader: ConfigLoader,
}

impl ModeDispatcher {
    /// Creates a dispatcher reading `KILN_*` variables from the environment.
    pub(crate) fn new(invocation: Invocation) -> Self {
        let mut loader = ConfigLoader::from_process_env();
        if let Some(file) = &invocation.config_file {
            loader = loader.with_file(file);
        }
        Self::with_loader(invocation, loader)
    }

    pub(crate) const fn with_loader(invocation: Invocation, loader: ConfigLoader) -> Self {
        Self { invocation, loader }
    }

    /// Runs `token`'s component to completion.
    ///
    /// Fatal conditions are printed as one line naming the cause and turned
    /// into their exit status.
    pub(crate) async fn run(self, token: &str) -> Finished {
        match self.try_run(token).await {
            Ok(finished) => finished,
            Err(e) => {
                if !matches!(e, KilnError::InvalidMode { .. }) {
                    error!(error = %e, "fatal");
                }
                eprintln!("error: {e}");
                Finished::Exit(e.exit_status())
            }
        }
    }

    async fn try_run(self, token: &str) -> Result<Finished, KilnError> {
        let mode: Mode = token.parse().map_err(|e: kiln_types::ModeParseError| {
            KilnError::InvalidMode {
                token: e.token().to_string(),
            }
        })?;
        let component = Component::for_mode(mode);

        let loader = apply_arguments(mode, &self.invocation.args, self.loader)?;
        let resolved = loader.load(mode).map_err(startup_config_error)?;
        let config = Arc::new(resolved.config);

        let log_file = logging::init(&config, mode, self.invocation.verbose)
            .map_err(|e| KilnError::startup("logging", format!("{e:#}")))?;
        info!(
            mode = %mode,
            component = component.name(),
            data_dir = %config.data_dir().display(),
            log_file = %log_file.display(),
            "kiln starting"
        );
        for (key, value) in config.describe() {
            debug!(key, value = %value, "config");
        }
        if !resolved.ignored_keys.is_empty() {
            debug!(keys = %resolved.ignored_keys.join(", "), "ignored unknown config keys");
        }

        let cancel = CancellationToken::new();
        let signals = signal::install(cancel.clone())
            .map_err(|e| KilnError::startup("signal-handler", e))?;

        let grace = config.grace_period;
        let finished = supervise(
            component.name(),
            run_component(component, config, self.invocation.quiet, cancel.clone()),
            &cancel,
            grace,
        )
        .await;
        signals.abort();

        if let Ok(Finished::Exit(status)) = &finished {
            info!(component = component.name(), code = status.code(), "kiln stopped");
        }
        finished
    }
}

/// Applies mode arguments as config overrides.
fn apply_arguments(
    mode: Mode,
    args: &[String],
    mut loader: ConfigLoader,
) -> Result<ConfigLoader, KilnError> {
    if mode != Mode::DownloadFiles {
        return match args.first() {
            Some(arg) => Err(KilnError::startup(
                "arguments",
                format!("unexpected argument '{arg}' for mode '{mode}'"),
            )),
            None => Ok(loader),
        };
    }

    let parsed = DownloadArgs::try_parse_from(args).map_err(|e| {
        let message = e.to_string();
        let first = message.lines().next().unwrap_or_default().trim_start_matches("error: ");
        KilnError::startup("arguments", first)
    })?;

    if let Some(manifest) = parsed.manifest {
        loader = loader
            .with_override("downloads.manifest", manifest)
            .map_err(startup_config_error)?;
    }
    if let Some(destination) = parsed.destination {
        loader = loader
            .with_override("downloads.destination", destination.display().to_string())
            .map_err(startup_config_error)?;
    }
    Ok(loader)
}

fn startup_config_error(e: ConfigError) -> KilnError {
    KilnError::startup(e.key(), e)
}

/// Waits for `component`, bounding its shutdown by `grace` once `cancel`
/// fires.
///
/// The component observes the same token; if it has not returned when the
/// grace period ends it is dropped and the shutdown is reported as
/// ungraceful.
pub(crate) async fn supervise<F>(
    name: &'static str,
    component: F,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<Finished, KilnError>
where
    F: Future<Output = Result<Finished, KilnError>>,
{
    tokio::pin!(component);

    tokio::select! {
        biased;
        result = &mut component => return result,
        () = cancel.cancelled() => {}
    }

    info!(component = name, grace = ?grace, "shutdown requested, waiting for component to stop");
    if let Ok(result) = tokio::time::timeout(grace, component).await {
        result
    } else {
        error!(
            component = name,
            grace = ?grace,
            "component did not stop within the grace period, forcing exit"
        );
        Err(KilnError::UngracefulShutdown {
            component: name.to_string(),
            grace,
        })
    }
}

async fn run_component(
    component: Component,
    config: Arc<ProcessConfig>,
    quiet: bool,
    cancel: CancellationToken,
) -> Result<Finished, KilnError> {
    match component {
        Component::Server(profile) => {
            serve(ServerLoop::with_defaults(config, profile), cancel).await
        }
        Component::Console => console(config, &cancel).await,
        Component::DownloadJob => download(config, quiet, &cancel).await,
    }
}

async fn serve(server: ServerLoop, cancel: CancellationToken) -> Result<Finished, KilnError> {
    let shutdown = server.run(cancel).await?;

    if !shutdown.is_clean() {
        warn!(aborted = ?shutdown.aborted, "drain timed out, in-flight task runs were aborted");
    }
    Ok(match shutdown.exit {
        ServerExit::Stopped => Finished::Exit(ExitStatus::Success),
        ServerExit::Reload => {
            info!("configuration changed, reloading");
            Finished::Reload
        }
    })
}

async fn console(
    config: Arc<ProcessConfig>,
    cancel: &CancellationToken,
) -> Result<Finished, KilnError> {
    let history = config.console.history.then(|| config.history_file());
    let reader = EditorReader::new(history).map_err(|e| KilnError::startup("console-input", e))?;

    let mut session = ConsoleSession::new(config, reader, std::io::stdout());
    let end = session
        .run(cancel)
        .await
        .map_err(|e| KilnError::Runtime(e.to_string()))?;
    info!(end = ?end, "console session ended");
    Ok(Finished::Exit(ExitStatus::Success))
}

async fn download(
    config: Arc<ProcessConfig>,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<Finished, KilnError> {
    let settings = &config.downloads;
    let location = settings
        .manifest
        .as_ref()
        .ok_or_else(|| KilnError::startup("downloads.manifest", "no manifest configured"))?;

    let client = DownloadClient::new(ClientConfig {
        pool_size: settings.workers,
        timeout: settings.request_timeout,
        ..Default::default()
    })
    .map_err(|e| KilnError::startup("download-client", e))?;

    let manifest = Manifest::load(location, &client, &settings.retry, cancel)
        .await
        .map_err(|e| {
            if cancel.is_cancelled() {
                KilnError::Job {
                    job: Component::DownloadJob.name().to_string(),
                    reason: "cancelled while loading the manifest".to_string(),
                }
            } else {
                KilnError::startup("manifest", e)
            }
        })?;
    let store = ReportStore::new(config.reports_dir())
        .map_err(|e| KilnError::startup("report-store", e))?;

    let job = DownloadJob::from_manifest(&settings.destination, manifest);
    let bar = progress::JobProgress::new(job.items.len(), quiet);
    let runner = JobRunner::from_settings(Arc::new(client), settings)
        .with_store(store)
        .on_item(bar.callback());

    let result = runner.execute(job, cancel).await;
    bar.finish(match &result {
        Ok(report) => Some(report),
        Err(e) => e.report(),
    });

    match result {
        Ok(report) => {
            if !quiet {
                let path = config.reports_dir().join(format!("{}.json", report.job_id));
                println!("Report written to: {}", path.display());
            }
            Ok(Finished::Exit(report.exit_status()))
        }
        Err(e) => Err(KilnError::Job {
            job: e
                .report()
                .map_or_else(|| Component::DownloadJob.name().to_string(), |r| r.job_id.to_string()),
            reason: match &e {
                JobError::Failed { report } => report.failure_summary(),
                JobError::Cancelled { .. } => "cancelled before all items finished".to_string(),
                other => other.to_string(),
            },
        }),
    }
}
