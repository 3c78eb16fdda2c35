//! Interactive operator console for kiln.
//!
//! - [`ConsoleSession`] - the read-evaluate-respond loop
//! - [`Command`] - parsed operator commands
//! - [`LineReader`] - pluggable input, terminal or scripted

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod command;
mod error;
mod reader;
mod session;

pub use command::{Command, HELP, ReportRef};
pub use error::{ConsoleError, Result};
pub use reader::{EditorReader, Input, LineReader, ScriptedReader};
pub use session::{ConsoleSession, Flow, OutputFormat, SessionEnd, SessionSettings};
