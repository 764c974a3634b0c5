//! Print job state
//!
//! `JobStatus` is the state machine; `PrintJob` is the snapshot observers
//! read. Only the feed task mutates a running job.

use chrono::{DateTime, Utc};
use printlink_core::{JobError, Position};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Print job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Idle,
    Printing,
    Paused,
    Completed,
    Stopped,
    EmergencyStopped,
}

impl JobStatus {
    /// Printing or paused
    pub fn is_active(self) -> bool {
        matches!(self, Self::Printing | Self::Paused)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::EmergencyStopped)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (_, EmergencyStopped) => true,
            (Idle | Completed | Stopped | EmergencyStopped, Printing) => true,
            (Printing, Paused | Completed | Stopped) => true,
            (Paused, Printing | Stopped) => true,
            _ => false,
        }
    }

    /// Validate a transition
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, JobError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(JobError::InvalidStateTransition {
                current: self.to_string(),
                requested: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Printing => write!(f, "Printing"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
            Self::Stopped => write!(f, "Stopped"),
            Self::EmergencyStopped => write!(f, "EmergencyStopped"),
        }
    }
}

/// The command a job failed on and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub command: String,
    pub reason: String,
}

/// Snapshot of the current or last print job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: Uuid,
    pub status: JobStatus,
    /// Program commands acknowledged so far (the cursor)
    pub sent: usize,
    pub total: usize,
    /// Percent complete, 0 to 100
    pub progress: f64,
    /// Position captured when the job was paused
    pub park_position: Option<Position>,
    /// Flow controller occupancy after the last acknowledgement
    pub buffer_occupancy: usize,
    pub last_error: Option<JobFailure>,
    pub emergency_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for PrintJob {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            status: JobStatus::Idle,
            sent: 0,
            total: 0,
            progress: 0.0,
            park_position: None,
            buffer_occupancy: 0,
            last_error: None,
            emergency_reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

impl PrintJob {
    /// A fresh job in the printing state
    pub fn printing(total: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Printing,
            total,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Record an acknowledged program command
    pub fn record_sent(&mut self, sent: usize, occupancy: usize) {
        self.sent = sent;
        self.progress = progress_percent(sent, self.total);
        self.buffer_occupancy = occupancy;
    }

    /// Move to a terminal state
    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.park_position = None;
        self.finished_at = Some(Utc::now());
    }
}

/// `sent / total` as a percentage, exactly 100 only when everything was sent
pub fn progress_percent(sent: usize, total: usize) -> f64 {
    if sent >= total {
        return 100.0;
    }
    (sent as f64 * 100.0 / total as f64).min(99.999)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use JobStatus::*;
        assert!(Idle.can_transition_to(Printing));
        assert!(Printing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Printing));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Completed.can_transition_to(Printing));
        assert!(EmergencyStopped.can_transition_to(Printing));

        assert!(!Printing.can_transition_to(Printing));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Idle.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));

        for status in [Idle, Printing, Paused, Completed, Stopped, EmergencyStopped] {
            assert!(status.can_transition_to(EmergencyStopped));
        }
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = JobStatus::Printing.transition(JobStatus::Printing).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidStateTransition {
                current: "Printing".to_string(),
                requested: "Printing".to_string(),
            }
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 4), 0.0);
        assert_eq!(progress_percent(1, 4), 25.0);
        assert_eq!(progress_percent(4, 4), 100.0);
        assert!(progress_percent(2999, 3000) < 100.0);
    }

    #[test]
    fn test_record_sent() {
        let mut job = PrintJob::printing(2);
        job.record_sent(1, 0);
        assert_eq!(job.progress, 50.0);
        job.record_sent(2, 0);
        assert_eq!(job.progress, 100.0);
    }
}
