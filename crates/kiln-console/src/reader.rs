//! Sources of operator input.

use crate::{ConsoleError, Result};
use async_trait::async_trait;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One unit of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A line of text.
    Line(String),
    /// The operator pressed Ctrl-C at the prompt.
    Interrupted,
    /// End of input.
    Eof,
}

/// Supplies input lines to a [`ConsoleSession`](crate::ConsoleSession).
#[async_trait]
pub trait LineReader: Send {
    /// Shows `prompt` and waits for the next input.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Input`] if the input source failed.
    async fn read_line(&mut self, prompt: &str) -> Result<Input>;
}

type Request = (String, oneshot::Sender<Result<Input>>);

/// Line editor backed by `rustyline`, with optional persistent history.
///
/// The editor is created on, and never leaves, a dedicated thread since
/// reading a line blocks. Dropping the reader ends that thread once its
/// current read returns.
#[derive(Debug)]
pub struct EditorReader {
    requests: mpsc::Sender<Request>,
}

impl EditorReader {
    /// Starts the editor thread. History is loaded from and appended to
    /// `history` when given.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Input`] if the terminal editor cannot be
    /// initialized.
    pub fn new(history: Option<PathBuf>) -> Result<Self> {
        let (requests, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("kiln-console-input".into())
            .spawn(move || match open_editor(history.as_deref()) {
                Ok(editor) => {
                    let _ = ready_tx.send(Ok(()));
                    serve(editor, history, &rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ConsoleError::Input(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| ConsoleError::Input("input thread exited during startup".into()))??;
        Ok(Self { requests })
    }
}

fn open_editor(history: Option<&Path>) -> Result<DefaultEditor> {
    let mut editor = DefaultEditor::new().map_err(|e| ConsoleError::Input(e.to_string()))?;
    if let Some(path) = history.filter(|p| p.exists()) {
        if let Err(e) = editor.load_history(path) {
            warn!(path = %path.display(), error = %e, "failed to load console history");
        }
    }
    Ok(editor)
}

fn serve(mut editor: DefaultEditor, history: Option<PathBuf>, rx: &mpsc::Receiver<Request>) {
    while let Ok((prompt, reply)) = rx.recv() {
        let input = match editor.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    let _ = editor.add_history_entry(trimmed);
                    if let Some(path) = &history {
                        if let Err(e) = editor.save_history(path) {
                            warn!(path = %path.display(), error = %e, "failed to save console history");
                        }
                    }
                }
                Ok(Input::Line(line))
            }
            Err(ReadlineError::Interrupted) => Ok(Input::Interrupted),
            Err(ReadlineError::Eof) => Ok(Input::Eof),
            Err(e) => Err(ConsoleError::Input(e.to_string())),
        };
        if reply.send(input).is_err() {
            break;
        }
    }
    debug!("console input thread stopped");
}

#[async_trait]
impl LineReader for EditorReader {
    async fn read_line(&mut self, prompt: &str) -> Result<Input> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((prompt.to_string(), tx))
            .map_err(|_| ConsoleError::Input("input thread stopped".into()))?;
        rx.await
            .map_err(|_| ConsoleError::Input("input thread stopped".into()))?
    }
}

/// Replays a fixed list of lines, then reports end of input.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReader {
    lines: VecDeque<String>,
}

impl ScriptedReader {
    /// Creates a reader over `lines`.
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the number of lines not yet read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

#[async_trait]
impl LineReader for ScriptedReader {
    async fn read_line(&mut self, _prompt: &str) -> Result<Input> {
        Ok(self.lines.pop_front().map_or(Input::Eof, Input::Line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reader_ends_with_eof() {
        let mut reader = ScriptedReader::new(["status", "exit"]);
        assert_eq!(reader.read_line("> ").await.unwrap(), Input::Line("status".into()));
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.read_line("> ").await.unwrap(), Input::Line("exit".into()));
        assert_eq!(reader.read_line("> ").await.unwrap(), Input::Eof);
    }
}
