//! Communication journal
//!
//! Append-only record of everything that crosses the link plus host-side
//! notices. Entries are rotated from the front once the journal exceeds its
//! size or age limit, and every appended entry is broadcast to live
//! subscribers and mirrored to `tracing`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Which way a journal line travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    /// Written to the printer
    Tx,
    /// Received from the printer
    Rx,
    /// Host-side notice
    Sys,
    /// Host-side failure
    Err,
}

impl std::fmt::Display for LogDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
            Self::Sys => write!(f, "sys"),
            Self::Err => write!(f, "err"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number, never reused
    pub seq: u64,
    pub direction: LogDirection,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            self.text
        )
    }
}

/// Rotation limits for the journal
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum number of retained entries.
    pub max_entries: usize,
    /// Entries older than this are dropped on the next append.
    pub max_age: Duration,
    /// Broadcast channel capacity for live subscribers.
    pub channel_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(60 * 60),
            channel_capacity: 256,
        }
    }
}

struct JournalInner {
    entries: RwLock<VecDeque<LogEntry>>,
    sender: broadcast::Sender<LogEntry>,
    next_seq: AtomicU64,
    config: JournalConfig,
}

/// Shared handle to the journal; clones append to the same log
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

impl Journal {
    pub fn new() -> Self {
        Self::with_config(JournalConfig::default())
    }

    pub fn with_config(config: JournalConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(JournalInner {
                entries: RwLock::new(VecDeque::new()),
                sender,
                next_seq: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Append an entry stamped with the current time
    pub fn append(&self, direction: LogDirection, text: impl Into<String>) -> LogEntry {
        self.append_at(direction, text.into(), Utc::now())
    }

    pub fn tx(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogDirection::Tx, text)
    }

    pub fn rx(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogDirection::Rx, text)
    }

    pub fn sys(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogDirection::Sys, text)
    }

    pub fn err(&self, text: impl Into<String>) -> LogEntry {
        self.append(LogDirection::Err, text)
    }

    fn append_at(&self, direction: LogDirection, text: String, timestamp: DateTime<Utc>) -> LogEntry {
        match direction {
            LogDirection::Tx => tracing::debug!(target: "printlink::wire", ">> {}", text),
            LogDirection::Rx => tracing::debug!(target: "printlink::wire", "<< {}", text),
            LogDirection::Sys => tracing::info!("{}", text),
            LogDirection::Err => tracing::warn!("{}", text),
        }

        let entry = LogEntry {
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            direction,
            text,
            timestamp,
        };

        {
            let mut entries = self.inner.entries.write();
            entries.push_back(entry.clone());
            self.rotate(&mut entries, timestamp);
        }

        // Nobody listening is fine
        let _ = self.inner.sender.send(entry.clone());
        entry
    }

    fn rotate(&self, entries: &mut VecDeque<LogEntry>, now: DateTime<Utc>) {
        if let Ok(max_age) = chrono::Duration::from_std(self.inner.config.max_age) {
            while entries
                .front()
                .is_some_and(|e| now.signed_duration_since(e.timestamp) > max_age)
            {
                entries.pop_front();
            }
        }

        while entries.len() > self.inner.config.max_entries {
            entries.pop_front();
        }
    }

    /// Snapshot of every retained entry, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries.read().iter().cloned().collect()
    }

    /// Retained entries with a sequence number at or after `seq`
    pub fn since(&self, seq: u64) -> Vec<LogEntry> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|e| e.seq >= seq)
            .cloned()
            .collect()
    }

    /// Live feed of new entries
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.sender.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &JournalConfig {
        &self.inner.config
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_increasing_seq() {
        let journal = Journal::new();
        let a = journal.tx("M115");
        let b = journal.rx("ok");
        assert!(b.seq > a.seq);
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.entries()[0].direction, LogDirection::Tx);
    }

    #[test]
    fn test_rotation_by_count() {
        let journal = Journal::with_config(JournalConfig {
            max_entries: 3,
            ..Default::default()
        });
        for i in 0..5 {
            journal.sys(format!("line {}", i));
        }

        let texts: Vec<_> = journal.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_rotation_by_age() {
        let journal = Journal::with_config(JournalConfig {
            max_age: Duration::from_secs(60),
            ..Default::default()
        });
        let now = Utc::now();
        journal.append_at(
            LogDirection::Rx,
            "stale".to_string(),
            now - chrono::Duration::seconds(120),
        );
        journal.append_at(LogDirection::Rx, "fresh".to_string(), now);

        let texts: Vec<_> = journal.entries().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["fresh"]);
    }

    #[test]
    fn test_since_filters_by_seq() {
        let journal = Journal::new();
        journal.sys("a");
        let mark = journal.sys("b").seq;
        journal.sys("c");
        let texts: Vec<_> = journal.since(mark).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_subscriber_receives_entries() {
        let journal = Journal::new();
        let mut rx = journal.subscribe();
        journal.err("boom");
        let entry = rx.recv().await.expect("entry");
        assert_eq!(entry.direction, LogDirection::Err);
        assert_eq!(entry.text, "boom");
    }
}
