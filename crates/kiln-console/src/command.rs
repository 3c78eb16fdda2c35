//! Console command parsing.

use crate::ConsoleError;
use std::str::FromStr;
use uuid::Uuid;

/// Which report a command refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRef {
    /// The most recent report.
    Latest,
    /// A report by job id.
    Id(Uuid),
}

impl FromStr for ReportRef {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            return Ok(Self::Latest);
        }
        Uuid::parse_str(s)
            .map(Self::Id)
            .map_err(|e| ConsoleError::InvalidValue {
                key: "report".into(),
                value: s.to_string(),
                reason: e.to_string(),
            })
    }
}

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Lists the commands.
    Help,
    /// Shows the server state.
    Status,
    /// Shows the effective configuration.
    Config,
    /// Lists recent reports.
    Reports {
        /// How many to show; the session limit when absent.
        limit: Option<usize>,
    },
    /// Shows one report in full.
    Report(ReportRef),
    /// Lists the files recorded by the latest report.
    Files,
    /// Re-checks the files recorded by the latest report.
    Verify,
    /// Changes a session setting.
    Set {
        /// Setting name.
        key: String,
        /// New value, not yet validated.
        value: String,
    },
    /// Deletes reports.
    Forget(Vec<String>),
    /// Ends the session.
    Exit,
}

/// One line of help per command.
pub const HELP: &[(&str, &str)] = &[
    ("help", "show this list"),
    ("status", "show the server state"),
    ("config", "show the effective configuration"),
    ("reports [n]", "list the n most recent job reports"),
    ("report <id|latest>", "show a job report"),
    ("files", "list files from the latest download"),
    ("verify", "re-check files from the latest download"),
    ("set <key> <value>", "change a session setting (format text|json, limit <n>)"),
    ("forget <id>...", "delete job reports"),
    ("exit", "leave the console"),
];

impl Command {
    /// Parses a line. Blank lines and `#` comments yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::UnknownCommand`] for an unrecognized first word
    /// and [`ConsoleError::Usage`] when the arguments do not fit.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let command = match (name.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("help" | "?", []) => Self::Help,
            ("status", []) => Self::Status,
            ("config", []) => Self::Config,
            ("reports", []) => Self::Reports { limit: None },
            ("reports", [n]) => Self::Reports {
                limit: Some(parse_count(n).map_err(|_| usage("reports [n]"))?),
            },
            ("report", [which]) => Self::Report(which.parse()?),
            ("files", []) => Self::Files,
            ("verify", []) => Self::Verify,
            ("set", [key, value]) => Self::Set {
                key: (*key).to_string(),
                value: (*value).to_string(),
            },
            ("forget", ids) if !ids.is_empty() => {
                Self::Forget(ids.iter().map(ToString::to_string).collect())
            }
            ("exit" | "quit", []) => Self::Exit,
            ("help" | "?" | "status" | "config" | "files" | "verify" | "exit" | "quit", _) => {
                return Err(usage(name_usage(name)));
            }
            ("reports", _) => return Err(usage("reports [n]")),
            ("report", _) => return Err(usage("report <id|latest>")),
            ("set", _) => return Err(usage("set <key> <value>")),
            ("forget", _) => return Err(usage("forget <id>...")),
            _ => {
                return Err(ConsoleError::UnknownCommand {
                    name: name.to_string(),
                });
            }
        };
        Ok(Some(command))
    }

    /// Returns the command name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Status => "status",
            Self::Config => "config",
            Self::Reports { .. } => "reports",
            Self::Report(_) => "report",
            Self::Files => "files",
            Self::Verify => "verify",
            Self::Set { .. } => "set",
            Self::Forget(_) => "forget",
            Self::Exit => "exit",
        }
    }
}

/// Parses a positive count.
pub(crate) fn parse_count(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

const fn usage(usage: &'static str) -> ConsoleError {
    ConsoleError::Usage { usage }
}

fn name_usage(name: &str) -> &'static str {
    match name.to_ascii_lowercase().as_str() {
        "status" => "status",
        "config" => "config",
        "files" => "files",
        "verify" => "verify",
        "exit" | "quit" => "exit",
        _ => "help",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("help").unwrap(), Some(Command::Help));
        assert_eq!(Command::parse("  STATUS  ").unwrap(), Some(Command::Status));
        assert_eq!(
            Command::parse("reports 3").unwrap(),
            Some(Command::Reports { limit: Some(3) })
        );
        assert_eq!(
            Command::parse("report latest").unwrap(),
            Some(Command::Report(ReportRef::Latest))
        );
        assert_eq!(
            Command::parse("set format json").unwrap(),
            Some(Command::Set {
                key: "format".into(),
                value: "json".into()
            })
        );
        assert_eq!(
            Command::parse("forget a b").unwrap(),
            Some(Command::Forget(vec!["a".into(), "b".into()]))
        );
        assert_eq!(Command::parse("quit").unwrap(), Some(Command::Exit));
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("# note").unwrap(), None);
    }

    #[test]
    fn test_unknown_command() {
        let err = Command::parse("frobnicate now").unwrap_err();
        assert!(matches!(err, ConsoleError::UnknownCommand { ref name } if name == "frobnicate"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_usage_errors() {
        for line in ["reports 0", "reports x", "reports 1 2", "report", "set format", "forget", "status now"] {
            let err = Command::parse(line).unwrap_err();
            assert!(matches!(err, ConsoleError::Usage { .. }), "{line}");
        }
    }

    #[test]
    fn test_report_ref_rejects_bad_id() {
        let err = Command::parse("report not-a-uuid").unwrap_err();
        assert!(matches!(err, ConsoleError::InvalidValue { .. }));
    }
}
