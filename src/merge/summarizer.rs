//! Summarizer capability used to compress long aggregated descriptions
//!
//! Two implementations ship with the crate:
//! - `CommandSummarizer`: runs a configured external command, text on stdin,
//!   summary on stdout (production)
//! - `NoopSummarizer`: always unavailable, which keeps descriptions
//!   unsummarized
//!
//! `MockSummarizer` returns preconfigured output for tests.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Errors from summarizer calls. All of them trigger the fallback.
#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("summarizer not available: {0}")]
    Unavailable(String),
    #[error("summarization failed: {0}")]
    Failed(String),
    #[error("summarizer timed out after {0:?}")]
    Timeout(Duration),
    #[error("summarizer returned empty output")]
    EmptyOutput,
}

/// Compresses a description to at most `max_length` characters.
///
/// Abstracts over transport (subprocess, HTTP, mock) so the merge engine
/// doesn't depend on how the model is reached.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Identifier for logs
    fn id(&self) -> &str;

    async fn summarize(&self, text: &str, max_length: usize) -> Result<String, SummarizeError>;
}

/// Truncate to at most `max_chars` characters on a char boundary
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Summarizer that is never available
#[derive(Debug, Default, Clone)]
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    fn id(&self) -> &str {
        "noop"
    }

    async fn summarize(&self, _text: &str, _max_length: usize) -> Result<String, SummarizeError> {
        Err(SummarizeError::Unavailable("no summarizer configured".to_string()))
    }
}

/// Runs an external command per call
///
/// The text is written to stdin; stdout (trimmed) is the summary. The
/// requested maximum length is passed in `GRAPHWEAVE_MAX_LENGTH`, and
/// output longer than that is truncated. The child is killed if the call
/// times out or is dropped.
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    id: String,
}

impl CommandSummarizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        let program = program.into();
        Self {
            id: format!("command:{}", program),
            program,
            args,
            timeout,
        }
    }

    async fn run(&self, text: &str, max_length: usize) -> Result<String, SummarizeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("GRAPHWEAVE_MAX_LENGTH", max_length.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SummarizeError::Unavailable(format!("{}: {}", self.program, e)))?;

        // Feed stdin while draining stdout, so large inputs cannot fill both
        // pipes. Dropping stdin after the write closes it and the child sees EOF.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(text.as_bytes()).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| SummarizeError::Failed(e.to_string()))?;
        if let Err(e) = fed {
            // A child that exits without reading its input breaks the pipe.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(SummarizeError::Failed(format!("writing stdin: {}", e)));
            }
        }
        if !output.status.success() {
            return Err(SummarizeError::Failed(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let summary = String::from_utf8_lossy(&output.stdout);
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SummarizeError::EmptyOutput);
        }
        Ok(truncate_chars(summary, max_length).to_string())
    }
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn summarize(&self, text: &str, max_length: usize) -> Result<String, SummarizeError> {
        tokio::time::timeout(self.timeout, self.run(text, max_length))
            .await
            .map_err(|_| SummarizeError::Timeout(self.timeout))?
    }
}
