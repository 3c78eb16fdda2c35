//! Console errors.

use kiln_jobs::StoreError;
use thiserror::Error;

/// Result type alias for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Errors raised by the console.
///
/// Everything except [`ConsoleError::Output`] and [`ConsoleError::Input`] is
/// reported to the operator and the loop continues.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// The first word of the line is not a command.
    #[error("unknown command '{name}', type 'help' for a list of commands")]
    UnknownCommand {
        /// The unrecognized word.
        name: String,
    },

    /// The command's arguments do not match its usage.
    #[error("usage: {usage}")]
    Usage {
        /// Expected usage.
        usage: &'static str,
    },

    /// A setting value was rejected.
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        /// The setting.
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A recognized command failed while executing.
    #[error("{command}: {reason}")]
    Command {
        /// The command that failed.
        command: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// The report store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing to the output failed.
    #[error("failed to write console output: {0}")]
    Output(#[from] std::io::Error),

    /// Reading operator input failed.
    #[error("failed to read input: {0}")]
    Input(String),
}

impl ConsoleError {
    /// Returns true if the session cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Output(_) | Self::Input(_))
    }

    pub(crate) fn command(command: &'static str, reason: impl ToString) -> Self {
        Self::Command {
            command,
            reason: reason.to_string(),
        }
    }
}
