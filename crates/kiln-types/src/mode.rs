//! Operating modes and server profiles.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Top-level operating selection for a process invocation.
///
/// Resolved once at startup and never changed for the lifetime of the
/// process. Each mode maps to exactly one top-level component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Server loop with the development profile (debug logging, auto-reload).
    Dev,
    /// Server loop with the production profile.
    Start,
    /// Interactive operator console.
    Console,
    /// One-shot file download job.
    DownloadFiles,
}

impl Mode {
    /// Returns the mode as its command-line token.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Start => "start",
            Self::Console => "console",
            Self::DownloadFiles => "download-files",
        }
    }

    /// Returns all recognized modes.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Dev, Self::Start, Self::Console, Self::DownloadFiles]
    }

    /// Returns the server profile for modes that launch the server loop.
    #[must_use]
    pub const fn server_profile(&self) -> Option<Profile> {
        match self {
            Self::Dev => Some(Profile::Development),
            Self::Start => Some(Profile::Production),
            Self::Console | Self::DownloadFiles => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "start" => Ok(Self::Start),
            "console" => Ok(Self::Console),
            "download-files" => Ok(Self::DownloadFiles),
            _ => Err(ModeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized mode token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeParseError(String);

impl ModeParseError {
    /// Returns the rejected token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid mode '{}', expected one of: dev, start, console, download-files",
            self.0
        )
    }
}

impl std::error::Error for ModeParseError {}

/// Configuration profile of the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Debug logging and configuration auto-reload.
    Development,
    /// Production settings, no reload.
    #[default]
    Production,
}

impl Profile {
    /// Returns true if configuration changes should trigger a reload.
    #[must_use]
    pub const fn auto_reload(&self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the default log filter directive for this profile.
    #[must_use]
    pub const fn default_log_level(&self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production => "info",
        }
    }

    /// Returns the profile as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("dev".parse::<Mode>().unwrap(), Mode::Dev);
        assert_eq!("start".parse::<Mode>().unwrap(), Mode::Start);
        assert_eq!("console".parse::<Mode>().unwrap(), Mode::Console);
        assert_eq!(
            "download-files".parse::<Mode>().unwrap(),
            Mode::DownloadFiles
        );
    }

    #[test]
    fn test_mode_parse_rejects_unknown_tokens() {
        let err = "bogus".parse::<Mode>().unwrap_err();
        assert_eq!(err.token(), "bogus");
        assert!(err.to_string().contains("download-files"));

        assert!("".parse::<Mode>().is_err());
        assert!("DEV".parse::<Mode>().is_err());
        assert!("download_files".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_round_trips_through_display() {
        for mode in Mode::all() {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), *mode);
        }
    }

    #[test]
    fn test_server_profiles() {
        assert_eq!(Mode::Dev.server_profile(), Some(Profile::Development));
        assert_eq!(Mode::Start.server_profile(), Some(Profile::Production));
        assert_eq!(Mode::Console.server_profile(), None);
        assert_eq!(Mode::DownloadFiles.server_profile(), None);

        assert!(Profile::Development.auto_reload());
        assert!(!Profile::Production.auto_reload());
    }

    #[test]
    fn test_mode_serializes_as_token() {
        let json = serde_json::to_string(&Mode::DownloadFiles).unwrap();
        assert_eq!(json, "\"download-files\"");
    }
}
