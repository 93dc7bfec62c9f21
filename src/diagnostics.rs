//! Bounded capture of the worker's stdout/stderr.
//!
//! Only the most recent lines are kept; they are attached to startup and crash
//! errors so the host can show what the worker printed before it died.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// A single captured line.
#[derive(Debug, Clone)]
pub struct DiagnosticLine {
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub stream: Stream,
}

/// Fixed-capacity ring of lines; the oldest line is evicted first.
#[derive(Debug)]
pub struct RingBuffer {
    lines: VecDeque<DiagnosticLine>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, content: &str, stream: Stream) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(DiagnosticLine {
            content: content.to_string(),
            timestamp: Local::now(),
            stream,
        });
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Shared handle to the worker's diagnostic ring.
///
/// Capture tasks append; everything else reads copies via [`snapshot`](Self::snapshot).
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    inner: Arc<Mutex<RingBuffer>>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    pub fn push(&self, content: &str, stream: Stream) {
        let mut ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        ring.push(content, stream);
    }

    /// Copy of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<DiagnosticLine> {
        let ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        ring.lines.iter().cloned().collect()
    }

    /// The last `n` lines as plain text.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let skip = ring.len().saturating_sub(n);
        ring.lines
            .iter()
            .skip(skip)
            .map(|l| l.content.clone())
            .collect()
    }

    /// Most recent stderr line, falling back to the most recent line of any kind.
    ///
    /// Python tracebacks end with the exception on stderr, which is the line
    /// worth surfacing.
    pub fn last_error_line(&self) -> Option<String> {
        let ring = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        ring.lines
            .iter()
            .rev()
            .filter(|l| !l.content.trim().is_empty())
            .find(|l| l.stream == Stream::Stderr)
            .or_else(|| {
                ring.lines
                    .iter()
                    .rev()
                    .find(|l| !l.content.trim().is_empty())
            })
            .map(|l| l.content.trim().to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export as timestamped text, for attaching to bug reports.
    pub fn export(&self) -> String {
        self.snapshot()
            .iter()
            .map(|l| {
                format!(
                    "[{}] [{}] {}",
                    l.timestamp.format("%H:%M:%S"),
                    l.stream,
                    l.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
