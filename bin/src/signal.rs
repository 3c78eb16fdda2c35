//! Termination signal handling.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Installs handlers for Ctrl-C and, on Unix, SIGTERM.
///
/// The first signal cancels `cancel`; later signals are logged and otherwise
/// ignored, the grace period decides when the process gives up waiting.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub(crate) fn install(cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let name = tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => "SIGINT",
                    Err(e) => {
                        warn!(error = %e, "failed to listen for Ctrl-C");
                        return;
                    }
                },
                _ = terminate.recv() => "SIGTERM",
            };

            #[cfg(not(unix))]
            let name = match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    return;
                }
            };

            if cancel.is_cancelled() {
                warn!(signal = name, "already shutting down");
            } else {
                info!(signal = name, "received termination signal, shutting down");
                cancel.cancel();
            }
        }
    }))
}
