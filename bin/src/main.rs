//! kiln CLI - run the server loop, the operator console or a download job.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

mod dispatch;
mod logging;
mod progress;
mod reload;
mod signal;

use dispatch::{Finished, Invocation, ModeDispatcher};
use kiln_types::ExitStatus;

/// Time given to blocking work still running after the dispatcher returns.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Process orchestrator: server loop, operator console and download jobs", long_about = None)]
#[command(version)]
struct Cli {
    /// Mode to run: dev, start, console or download-files
    mode: String,

    /// Mode arguments (download-files: --manifest <url|path>, --destination <dir>)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file (defaults to $KILN_CONFIG, then ./kiln.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress progress output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitStatus::Failure.into();
        }
    };

    let invocation = Invocation {
        config_file: cli.config,
        verbose: cli.verbose,
        quiet: cli.quiet,
        args: cli.args,
    };
    let finished = runtime.block_on(ModeDispatcher::new(invocation).run(&cli.mode));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    match finished {
        Finished::Exit(status) => status.into(),
        Finished::Reload => match reload::restart() {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: reload failed: {e:#}");
                ExitStatus::Failure.into()
            }
        },
    }
}
