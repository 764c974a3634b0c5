//! Event type definitions for the event bus.
//!
//! Events are cloneable and serializable so observers can log or forward them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::Position;

/// Root event enum for all host events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// Link session events
    Connection(ConnectionEvent),
    /// Print job lifecycle events
    Job(JobEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Job(_) => EventCategory::Job,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Job(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Link session events.
    Connection,
    /// Print job events.
    Job,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Job => write!(f, "Job"),
        }
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Host asked for it
    UserRequested,
    /// A newer connect replaced the session
    Superseded,
    /// The device went away
    DeviceRemoved,
    /// Reading or writing failed
    TransportFailure(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::Superseded => write!(f, "superseded by a new connection"),
            Self::DeviceRemoved => write!(f, "device removed"),
            Self::TransportFailure(reason) => write!(f, "transport failure: {}", reason),
        }
    }
}

/// Connection-related events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Starting connection attempt.
    Connecting {
        /// Serial port path being connected to.
        port: String,
    },
    /// Handshake accepted.
    Connected {
        /// Serial port path that was connected.
        port: String,
        /// Baud rate the firmware answered at.
        baud_rate: u32,
        /// Firmware name from `M115`, if reported.
        firmware: Option<String>,
    },
    /// Session closed.
    Disconnected {
        /// Serial port path that was disconnected.
        port: String,
        /// Reason for the disconnection.
        reason: DisconnectReason,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Serial port path that failed to connect.
        port: String,
        /// Error message describing the failure.
        error: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting { port } => format!("Connecting to {}", port),
            ConnectionEvent::Connected {
                port,
                baud_rate,
                firmware,
            } => format!(
                "Connected to {} at {} baud ({})",
                port,
                baud_rate,
                firmware.as_deref().unwrap_or("unknown firmware")
            ),
            ConnectionEvent::Disconnected { port, reason } => {
                format!("Disconnected from {}: {}", port, reason)
            }
            ConnectionEvent::ConnectionFailed { port, error } => {
                format!("Connection failed to {}: {}", port, error)
            }
        }
    }
}

/// Print job events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        total: usize,
    },
    Progress {
        job_id: Uuid,
        sent: usize,
        total: usize,
    },
    Paused {
        job_id: Uuid,
        /// Position captured before parking.
        park_position: Position,
    },
    Resumed {
        job_id: Uuid,
    },
    Completed {
        job_id: Uuid,
        total: usize,
    },
    Stopped {
        job_id: Uuid,
        sent: usize,
        /// Set when the job stopped on a failure rather than a request.
        reason: Option<String>,
    },
    EmergencyStopped {
        /// `None` when no job was running.
        job_id: Option<Uuid>,
        reason: String,
    },
}

impl JobEvent {
    fn description(&self) -> String {
        match self {
            JobEvent::Started { total, .. } => format!("Print started ({} commands)", total),
            JobEvent::Progress { sent, total, .. } => format!("Printed {}/{}", sent, total),
            JobEvent::Paused { park_position, .. } => {
                format!("Print paused at {}", park_position)
            }
            JobEvent::Resumed { .. } => "Print resumed".to_string(),
            JobEvent::Completed { total, .. } => format!("Print completed ({} commands)", total),
            JobEvent::Stopped { sent, reason, .. } => match reason {
                Some(reason) => format!("Print stopped after {} commands: {}", sent, reason),
                None => format!("Print stopped after {} commands", sent),
            },
            JobEvent::EmergencyStopped { reason, .. } => format!("Emergency stop: {}", reason),
        }
    }
}
