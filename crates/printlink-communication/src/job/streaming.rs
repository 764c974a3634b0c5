//! Program streaming
//!
//! Splits G-code text into sendable lines and walks them with a cursor,
//! reporting progress and pacing the feed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called with `(sent, total)` after every acknowledged line
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Sendable lines of a program: trimmed, without blank lines, without
/// `;`/`#` comment lines and with inline `;` comments stripped
pub fn program_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                return None;
            }
            let code = match line.find(';') {
                Some(pos) => line[..pos].trim_end(),
                None => line,
            };
            (!code.is_empty()).then(|| code.to_string())
        })
        .collect()
}

/// Options for streaming a program
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Pause between program lines
    pub delay: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
}

impl StreamOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("delay", &self.delay)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Outcome of a streamed program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub sent: usize,
    pub total: usize,
}

impl StreamSummary {
    pub fn is_complete(&self) -> bool {
        self.sent == self.total
    }
}

/// Cursor over a program's lines
#[derive(Debug)]
pub struct StreamingAdapter {
    lines: Vec<String>,
    cursor: usize,
    discarded: usize,
    options: StreamOptions,
}

impl StreamingAdapter {
    pub fn new(lines: Vec<String>, options: StreamOptions) -> Self {
        Self {
            lines,
            cursor: 0,
            discarded: 0,
            options,
        }
    }

    pub fn from_program(text: &str, options: StreamOptions) -> Self {
        Self::new(program_lines(text), options)
    }

    pub fn total(&self) -> usize {
        self.lines.len()
    }

    pub fn sent(&self) -> usize {
        self.cursor
    }

    /// Lines dropped by [`discard_remaining`](Self::discard_remaining)
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn is_finished(&self) -> bool {
        self.cursor + self.discarded >= self.lines.len()
    }

    /// The next unsent line
    pub fn peek(&self) -> Option<&str> {
        if self.is_finished() {
            return None;
        }
        self.lines.get(self.cursor).map(String::as_str)
    }

    /// Mark the current line sent and report progress
    pub fn advance(&mut self) {
        if self.is_finished() {
            return;
        }
        self.cursor += 1;
        if let Some(callback) = &self.options.on_progress {
            callback(self.cursor, self.lines.len());
        }
    }

    /// Wait the configured inter-line delay, if any
    pub async fn pace(&self) {
        if let Some(delay) = self.options.delay {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Drop every unsent line; returns how many were dropped
    pub fn discard_remaining(&mut self) -> usize {
        let remaining = self.lines.len() - self.cursor - self.discarded;
        self.discarded += remaining;
        remaining
    }

    /// Rewind to the first line
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.discarded = 0;
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            sent: self.cursor,
            total: self.lines.len(),
        }
    }
}
