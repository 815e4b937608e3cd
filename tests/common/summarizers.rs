//! Summarizers with scripted behaviour

use async_trait::async_trait;
use graphweave::merge::{SummarizeError, Summarizer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Returns a fixed output or error and counts calls
pub struct MockSummarizer {
    response: Result<String, String>,
    calls: AtomicUsize,
}

impl MockSummarizer {
    pub fn returning(summary: impl Into<String>) -> Self {
        Self {
            response: Ok(summary.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            response: Err(reason.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    fn id(&self) -> &str {
        "mock"
    }

    async fn summarize(&self, _text: &str, max_length: usize) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(summary) => Ok(summary.chars().take(max_length).collect()),
            Err(reason) => Err(SummarizeError::Failed(reason.clone())),
        }
    }
}

/// Sleeps before answering, to run a component past its time budget
pub struct SlowSummarizer {
    delay: Duration,
}

impl SlowSummarizer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Summarizer for SlowSummarizer {
    fn id(&self) -> &str {
        "slow"
    }

    async fn summarize(&self, text: &str, max_length: usize) -> Result<String, SummarizeError> {
        tokio::time::sleep(self.delay).await;
        Ok(text.chars().take(max_length).collect())
    }
}
