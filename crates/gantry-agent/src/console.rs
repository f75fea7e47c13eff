//! Console capture.
//!
//! Build output is written line by line into a [`ConsoleSink`]. The buffered
//! sink uploads in batches and never drops a line: a failed upload keeps the
//! batch for the next flush.

use crate::error::RemoteError;
use async_trait::async_trait;
use gantry_core::ids::JobIdentifier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleTag {
    /// Messages from the agent itself.
    Notice,
    /// Task banners.
    Task,
    Out,
    Err,
    Cancel,
}

impl ConsoleTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleTag::Notice => "##",
            ConsoleTag::Task => "!!",
            ConsoleTag::Out => "&1",
            ConsoleTag::Err => "&2",
            ConsoleTag::Cancel => "x0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedLine {
    pub tag: ConsoleTag,
    pub line: String,
}

impl TaggedLine {
    pub fn new(tag: ConsoleTag, line: impl Into<String>) -> Self {
        Self {
            tag,
            line: line.into(),
        }
    }
}

/// Destination of a build's console lines.
#[async_trait]
pub trait ConsoleSink: Send + Sync {
    fn write(&self, line: TaggedLine);

    /// Push buffered lines onward.
    async fn flush(&self) -> Result<(), RemoteError>;

    /// Whether enough lines are buffered to be worth a flush.
    fn should_flush(&self) -> bool {
        false
    }
}

/// Sends console batches to the server.
#[async_trait]
pub trait ConsoleUploader: Send + Sync {
    async fn upload(&self, job: &JobIdentifier, lines: &[TaggedLine]) -> Result<(), RemoteError>;
}

pub struct BufferedConsole {
    job: JobIdentifier,
    uploader: Arc<dyn ConsoleUploader>,
    batch_size: usize,
    buffer: Mutex<VecDeque<TaggedLine>>,
}

impl BufferedConsole {
    pub fn new(job: JobIdentifier, uploader: Arc<dyn ConsoleUploader>, batch_size: usize) -> Self {
        Self {
            job,
            uploader,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[async_trait]
impl ConsoleSink for BufferedConsole {
    fn write(&self, line: TaggedLine) {
        self.buffer.lock().push_back(line);
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        let batch: Vec<TaggedLine> = self.buffer.lock().iter().cloned().collect();
        if batch.is_empty() {
            return Ok(());
        }

        match self.uploader.upload(&self.job, &batch).await {
            Ok(()) => {
                self.buffer.lock().drain(..batch.len());
                debug!(job = %self.job, lines = batch.len(), "Uploaded console batch");
                Ok(())
            }
            Err(e) => {
                warn!(job = %self.job, lines = batch.len(), error = %e, "Console upload failed, keeping lines");
                Err(e)
            }
        }
    }

    fn should_flush(&self) -> bool {
        self.buffer.lock().len() >= self.batch_size
    }
}

/// Console that keeps every line in memory.
#[derive(Debug, Default)]
pub struct InMemoryConsole {
    lines: Mutex<Vec<TaggedLine>>,
}

impl InMemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<TaggedLine> {
        self.lines.lock().clone()
    }

    /// All lines joined with newlines.
    pub fn output(&self) -> String {
        self.lines
            .lock()
            .iter()
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lines.lock().iter().any(|l| l.line.contains(text))
    }

    pub fn count_containing(&self, text: &str) -> usize {
        self.lines.lock().iter().filter(|l| l.line.contains(text)).count()
    }
}

#[async_trait]
impl ConsoleSink for InMemoryConsole {
    fn write(&self, line: TaggedLine) {
        self.lines.lock().push(line);
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::StageCounter;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FlakyUploader {
        fail_next: AtomicBool,
        received: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConsoleUploader for FlakyUploader {
        async fn upload(&self, _job: &JobIdentifier, lines: &[TaggedLine]) -> Result<(), RemoteError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RemoteError::Unreachable("connection reset".into()));
            }
            self.received
                .lock()
                .extend(lines.iter().map(|l| l.line.clone()));
            Ok(())
        }
    }

    fn job() -> JobIdentifier {
        JobIdentifier::of("cruise", 1, "1", "dev", StageCounter::Run(1), "unit")
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_lines_in_order() {
        let uploader = Arc::new(FlakyUploader::default());
        let console = BufferedConsole::new(job(), uploader.clone(), 2);

        console.write(TaggedLine::new(ConsoleTag::Out, "one"));
        assert!(!console.should_flush());
        console.write(TaggedLine::new(ConsoleTag::Out, "two"));
        assert!(console.should_flush());

        uploader.fail_next.store(true, Ordering::SeqCst);
        assert!(console.flush().await.is_err());
        assert_eq!(console.pending(), 2);

        console.write(TaggedLine::new(ConsoleTag::Err, "three"));
        console.flush().await.unwrap();

        assert_eq!(console.pending(), 0);
        assert_eq!(*uploader.received.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_in_memory_console() {
        let console = InMemoryConsole::new();
        console.write(TaggedLine::new(ConsoleTag::Notice, "hello"));
        console.write(TaggedLine::new(ConsoleTag::Out, "hello again"));
        assert_eq!(console.output(), "hello\nhello again");
        assert_eq!(console.count_containing("hello"), 2);
        console.flush().await.unwrap();
    }
}
