//! The console read-evaluate-respond loop.

use crate::command::{HELP, parse_count};
use crate::{Command, ConsoleError, Input, LineReader, ReportRef, Result};
use kiln_config::ProcessConfig;
use kiln_fetch::{digests_match, sha256_file};
use kiln_jobs::{ItemReport, Report, ReportStore, StoreError};
use kiln_server::{ServerSnapshot, StateView, read_status_file};
use serde_json::json;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const PROMPT: &str = "kiln> ";

/// How command output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Aligned columns.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl OutputFormat {
    /// Returns the format as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err("expected text or json".to_string()),
        }
    }
}

/// Settings local to one console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Output rendering.
    pub format: OutputFormat,
    /// Default number of reports listed by `reports`.
    pub limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            limit: 10,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The operator typed `exit` or `quit`.
    Exit,
    /// The input reached its end.
    EndOfInput,
    /// The operator pressed Ctrl-C at the prompt.
    Interrupted,
    /// Cancellation was requested from outside the session.
    Cancelled,
}

/// Whether the loop continues after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line.
    Continue,
    /// End the session.
    Exit,
}

/// An interactive operator session.
///
/// Reads one line at a time from a [`LineReader`] and writes responses to
/// `W`. Reports are read from the configured data directory; server state
/// comes from a co-located [`StateView`] when one is attached, otherwise from
/// the status file a running server publishes.
pub struct ConsoleSession<R, W> {
    config: Arc<ProcessConfig>,
    reader: R,
    out: W,
    store: ReportStore,
    server: Option<StateView>,
    settings: SessionSettings,
}

impl<R, W> std::fmt::Debug for ConsoleSession<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("data_dir", &self.config.data_dir())
            .field("settings", &self.settings)
            .field("co_located", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl<R, W> ConsoleSession<R, W>
where
    R: LineReader,
    W: Write + Send,
{
    /// Creates a session over `config`.
    pub fn new(config: Arc<ProcessConfig>, reader: R, out: W) -> Self {
        let store = ReportStore::open(config.reports_dir());
        Self {
            config,
            reader,
            out,
            store,
            server: None,
            settings: SessionSettings::default(),
        }
    }

    /// Attaches a co-located server's state.
    #[must_use]
    pub fn with_server(mut self, view: StateView) -> Self {
        self.server = Some(view);
        self
    }

    /// Returns the current session settings.
    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Consumes the session, returning its output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Runs until `exit`, end of input, Ctrl-C or cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error only if input or output fails; command errors are
    /// printed and the loop continues.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<SessionEnd> {
        writeln!(self.out, "kiln console. Type 'help' for commands.")?;
        self.out.flush()?;

        loop {
            let input = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                input = self.reader.read_line(PROMPT) => input?,
            };

            let line = match input {
                Input::Line(line) => line,
                Input::Eof => return Ok(SessionEnd::EndOfInput),
                Input::Interrupted => return Ok(SessionEnd::Interrupted),
            };

            match self.execute_line(&line).await {
                Ok(Flow::Exit) => return Ok(SessionEnd::Exit),
                Ok(Flow::Continue) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(line = %line, error = %e, "console command rejected");
                    writeln!(self.out, "error: {e}")?;
                }
            }
            self.out.flush()?;
        }
    }

    /// Parses and executes one line.
    ///
    /// # Errors
    ///
    /// Returns the parse or execution error. Nothing has been changed when an
    /// error is returned.
    pub async fn execute_line(&mut self, line: &str) -> Result<Flow> {
        match Command::parse(line)? {
            Some(command) => self.execute(command).await,
            None => Ok(Flow::Continue),
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Help => self.help()?,
            Command::Status => self.status()?,
            Command::Config => self.show_config()?,
            Command::Reports { limit } => self.reports(limit.unwrap_or(self.settings.limit))?,
            Command::Report(which) => self.report(which)?,
            Command::Files => self.files()?,
            Command::Verify => self.verify().await?,
            Command::Set { key, value } => self.set(&key, &value)?,
            Command::Forget(ids) => self.forget(&ids)?,
            Command::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    fn help(&mut self) -> Result<()> {
        for (usage, description) in HELP {
            writeln!(self.out, "  {usage:<22} {description}")?;
        }
        Ok(())
    }

    fn status(&mut self) -> Result<()> {
        let snapshot = match &self.server {
            Some(view) => Some(view.snapshot()),
            None => {
                let path = self.config.status_file();
                if path.exists() {
                    Some(read_status_file(&path).map_err(|e| ConsoleError::command("status", e))?)
                } else {
                    None
                }
            }
        };

        let Some(snapshot) = snapshot else {
            return self.emit(&json!({ "running": false }), |out| {
                writeln!(out, "server not running")
            });
        };

        self.emit(&snapshot, |out| render_snapshot(out, &snapshot))
    }

    fn show_config(&mut self) -> Result<()> {
        let rows = self.config.describe();
        let object: serde_json::Map<_, _> = rows
            .iter()
            .map(|(key, value)| ((*key).to_string(), json!(value)))
            .collect();

        self.emit(&object, |out| {
            for (key, value) in &rows {
                writeln!(out, "{key:<32} {value}")?;
            }
            Ok(())
        })
    }

    fn reports(&mut self, limit: usize) -> Result<()> {
        let reports: Vec<Report> = self.store.list()?.into_iter().take(limit).collect();

        self.emit(&reports, |out| {
            if reports.is_empty() {
                return writeln!(out, "No reports found.");
            }
            writeln!(
                out,
                "{:<36} {:<20} {:<32} {:>7} {:>7} {:>6}",
                "JOB", "FINISHED", "OUTCOME", "FETCHED", "SKIPPED", "FAILED"
            )?;
            writeln!(out, "{}", "-".repeat(113))?;
            for report in &reports {
                let counts = report.counts();
                writeln!(
                    out,
                    "{:<36} {:<20} {:<32} {:>7} {:>7} {:>6}",
                    report.job_id,
                    report.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    report.outcome,
                    counts.fetched,
                    counts.skipped,
                    counts.failed
                )?;
            }
            writeln!(out, "\nTotal: {} report(s)", reports.len())
        })
    }

    fn report(&mut self, which: ReportRef) -> Result<()> {
        let report = match which {
            ReportRef::Latest => self.latest("report")?,
            ReportRef::Id(id) => self.store.load(id).map_err(|e| match e {
                StoreError::ReportNotFound(_) => {
                    ConsoleError::command("report", format!("no report with id {id}"))
                }
                other => other.into(),
            })?,
        };

        self.emit(&report, |out| {
            writeln!(out, "job:         {}", report.job_id)?;
            writeln!(out, "kind:        {}", report.kind)?;
            writeln!(out, "status:      {}", report.status)?;
            writeln!(out, "outcome:     {}", report.outcome)?;
            writeln!(out, "destination: {}", report.destination.display())?;
            writeln!(
                out,
                "finished:    {}",
                report.finished_at.format("%Y-%m-%d %H:%M:%S")
            )?;
            writeln!(out)?;
            writeln!(
                out,
                "{:<24} {:<10} {:>8} {:>12}  {}",
                "ITEM", "STATUS", "ATTEMPTS", "BYTES", "ERROR"
            )?;
            writeln!(out, "{}", "-".repeat(70))?;
            for item in &report.items {
                writeln!(
                    out,
                    "{:<24} {:<10} {:>8} {:>12}  {}",
                    item.name,
                    item.status,
                    item.attempts,
                    item.artifact.as_ref().map_or(0, |a| a.bytes),
                    item.error.as_deref().unwrap_or("")
                )?;
            }
            Ok(())
        })
    }

    fn files(&mut self) -> Result<()> {
        let report = self.latest("files")?;
        let rows: Vec<_> = report
            .items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "path": item.path,
                    "status": item.status,
                    "present": item.path.is_file(),
                    "bytes": item.artifact.as_ref().map(|a| a.bytes),
                })
            })
            .collect();

        self.emit(&rows, |out| {
            writeln!(out, "{:<24} {:<10} {:<8} {}", "ITEM", "STATUS", "PRESENT", "PATH")?;
            writeln!(out, "{}", "-".repeat(70))?;
            for item in &report.items {
                let present = if item.path.is_file() { "yes" } else { "no" };
                writeln!(
                    out,
                    "{:<24} {:<10} {:<8} {}",
                    item.name,
                    item.status,
                    present,
                    item.path.display()
                )?;
            }
            Ok(())
        })
    }

    async fn verify(&mut self) -> Result<()> {
        let report = self.latest("verify")?;
        let items = report.items.clone();
        let checks = tokio::task::spawn_blocking(move || {
            items
                .iter()
                .map(|item| (item.name.clone(), check_item(item)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ConsoleError::command("verify", e))?;

        let problems = checks.iter().filter(|(_, check)| *check != "ok").count();
        let rows: Vec<_> = checks
            .iter()
            .map(|(name, check)| json!({ "name": name, "check": check }))
            .collect();

        self.emit(&rows, |out| {
            for (name, check) in &checks {
                writeln!(out, "{name:<24} {check}")?;
            }
            writeln!(
                out,
                "\n{} checked, {} problem(s)",
                checks.len(),
                problems
            )
        })
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = |reason: String| ConsoleError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        };

        let mut updated = self.settings;
        match key {
            "format" => updated.format = value.parse().map_err(invalid)?,
            "limit" => updated.limit = parse_count(value).map_err(invalid)?,
            _ => return Err(invalid("unknown setting, expected format or limit".into())),
        }

        self.settings = updated;
        writeln!(self.out, "{key} = {value}")?;
        Ok(())
    }

    fn forget(&mut self, ids: &[String]) -> Result<()> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let parsed = Uuid::parse_str(id).map_err(|e| ConsoleError::InvalidValue {
                key: "id".into(),
                value: id.clone(),
                reason: e.to_string(),
            })?;
            if !self.store.exists(parsed) {
                return Err(ConsoleError::command("forget", format!("no report with id {id}")));
            }
            targets.push(parsed);
        }
        targets.sort_unstable();
        targets.dedup();

        for id in &targets {
            self.store.delete(*id)?;
        }
        writeln!(self.out, "forgot {} report(s)", targets.len())?;
        Ok(())
    }

    fn latest(&self, command: &'static str) -> Result<Report> {
        self.store
            .load_latest()?
            .ok_or_else(|| ConsoleError::command(command, "no download report yet"))
    }

    fn emit<T, F>(&mut self, value: &T, text: F) -> Result<()>
    where
        T: serde::Serialize + ?Sized,
        F: FnOnce(&mut W) -> std::io::Result<()>,
    {
        match self.settings.format {
            OutputFormat::Text => text(&mut self.out)?,
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(value)
                    .map_err(|e| ConsoleError::command("output", e))?;
                writeln!(self.out, "{json}")?;
            }
        }
        Ok(())
    }
}

fn check_item(item: &ItemReport) -> &'static str {
    let Some(artifact) = &item.artifact else {
        return "not downloaded";
    };
    if !item.path.is_file() {
        return "missing";
    }
    match sha256_file(&item.path) {
        Ok(digest) if digests_match(&artifact.sha256, &digest) => "ok",
        Ok(_) => "changed",
        Err(_) => "unreadable",
    }
}

fn render_snapshot(out: &mut impl Write, snapshot: &ServerSnapshot) -> std::io::Result<()> {
    writeln!(
        out,
        "server {} (pid {}, {} profile)",
        snapshot.phase, snapshot.pid, snapshot.profile
    )?;
    if let Some(started) = snapshot.started_at {
        writeln!(out, "started:   {}", started.format("%Y-%m-%d %H:%M:%S"))?;
    }
    writeln!(out, "resources: {}", snapshot.resources.join(", "))?;
    writeln!(out)?;
    writeln!(
        out,
        "{:<20} {:>6} {:>8} {:<9} {}",
        "TASK", "RUNS", "FAILURES", "STATE", "LAST ERROR"
    )?;
    writeln!(out, "{}", "-".repeat(60))?;
    for task in &snapshot.tasks {
        let state = if task.in_flight {
            "running"
        } else if task.aborted {
            "aborted"
        } else {
            "idle"
        };
        writeln!(
            out,
            "{:<20} {:>6} {:>8} {:<9} {}",
            task.name,
            task.runs,
            task.failures,
            state,
            task.last_error.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}
