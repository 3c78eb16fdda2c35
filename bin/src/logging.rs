//! Tracing subscriber setup.

use anyhow::{Context, Result};
use kiln_config::ProcessConfig;
use kiln_types::Mode;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log file name under the logs directory.
const LOG_FILE: &str = "kiln.log";

/// Installs the global subscriber: a stderr layer and a file layer appending
/// to `<data_dir>/logs/kiln.log`. `RUST_LOG` overrides the level.
///
/// The console mode logs to the file only so records do not interleave with
/// the prompt. If a subscriber is already installed the existing one is kept.
///
/// Returns the log file path.
pub(crate) fn init(config: &ProcessConfig, mode: Mode, verbose: u8) -> Result<PathBuf> {
    let logs_dir = config.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create log directory: {}", logs_dir.display()))?;

    let path = logs_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let level = match verbose {
        0 => mode.server_profile().unwrap_or_default().default_log_level(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,kiln={level}")));

    let stderr_layer = (mode != Mode::Console).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let file_layer = fmt::layer().with_writer(Arc::new(file)).with_ansi(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_log_file() {
        let temp = TempDir::new().unwrap();
        let config = ProcessConfig::with_data_dir(temp.path());

        let path = init(&config, Mode::Start, 0).unwrap();

        assert_eq!(path, temp.path().join("logs").join("kiln.log"));
        assert!(path.is_file());
    }
}
