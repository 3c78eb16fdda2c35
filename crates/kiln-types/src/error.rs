//! Top-level error taxonomy and process exit codes.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for top-level kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Process exit codes.
///
/// Every fatal condition maps to a distinct code so that operators and
/// supervisors can tell them apart without parsing log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Clean shutdown or successful completion.
    Success,
    /// Unexpected runtime failure not covered by another code.
    Failure,
    /// The mode token was not recognized.
    InvalidMode,
    /// Configuration or resource acquisition failed.
    StartupFailure,
    /// The job failed as a whole.
    JobError,
    /// The active component did not stop within the grace period.
    UngracefulShutdown,
    /// The job succeeded but some items failed.
    PartialSuccess,
}

impl ExitStatus {
    /// Returns the numeric process exit code.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::InvalidMode => 2,
            Self::StartupFailure => 3,
            Self::JobError => 4,
            Self::UngracefulShutdown => 5,
            Self::PartialSuccess => 6,
        }
    }

    /// Returns true for the success code.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        Self::from(status.code())
    }
}

/// Fatal conditions that propagate to the process exit code.
///
/// Failures confined to a single unit of work (a download item, a scheduled
/// task, a console command) are recorded where they happen and never appear
/// here.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Bad CLI input. Raised before any side effect.
    #[error("invalid mode '{token}', expected one of: dev, start, console, download-files")]
    InvalidMode {
        /// The rejected mode token.
        token: String,
    },

    /// A resource or configuration value needed to start could not be obtained.
    #[error("startup failed: {resource}: {reason}")]
    StartupFailure {
        /// The resource or configuration key that caused the failure.
        resource: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A job failed as a whole.
    #[error("job '{job}' failed: {reason}")]
    Job {
        /// The job identifier or kind.
        job: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The active component ignored cancellation past the grace period.
    #[error("{component} did not shut down within the {grace:?} grace period")]
    UngracefulShutdown {
        /// The component that was forcibly stopped.
        component: String,
        /// The grace period that elapsed.
        grace: Duration,
    },

    /// Any other unrecovered runtime failure.
    #[error("{0}")]
    Runtime(String),
}

impl KilnError {
    /// Creates a startup failure for the named resource.
    pub fn startup(resource: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StartupFailure {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the exit status for this error.
    #[must_use]
    pub const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::InvalidMode { .. } => ExitStatus::InvalidMode,
            Self::StartupFailure { .. } => ExitStatus::StartupFailure,
            Self::Job { .. } => ExitStatus::JobError,
            Self::UngracefulShutdown { .. } => ExitStatus::UngracefulShutdown,
            Self::Runtime(_) => ExitStatus::Failure,
        }
    }
}
