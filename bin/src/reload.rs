//! Development auto-reload.
//!
//! A reload replaces the process image with a fresh copy of the same binary
//! and arguments, so the new configuration belongs to a new process.

use anyhow::{Context, Result};
use std::process::{Command, ExitCode};

/// Re-executes the current binary with the current arguments.
///
/// On Unix this only returns if `exec` fails. Elsewhere the new process is
/// run as a child and its exit code is passed through.
pub(crate) fn restart() -> Result<ExitCode> {
    let exe = std::env::current_exe().context("Failed to locate the current executable")?;
    let mut command = Command::new(&exe);
    command.args(std::env::args_os().skip(1));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = command.exec();
        return Err(err).with_context(|| format!("Failed to re-execute {}", exe.display()));
    }

    #[cfg(not(unix))]
    {
        let status = command
            .status()
            .with_context(|| format!("Failed to restart {}", exe.display()))?;
        let code = status.code().and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
        return Ok(ExitCode::from(code));
    }
}
