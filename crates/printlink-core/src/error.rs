//! Error handling for printlink
//!
//! Errors are grouped by the layer that raises them:
//! - Connection errors (opening the port, handshake, device loss)
//! - Flow errors (acknowledgement tracking and retries)
//! - Job errors (print state machine)
//!
//! All error types use `thiserror` and carry only owned strings so they can be
//! cloned into job records and journal entries.

use thiserror::Error;

/// Connection error type
///
/// Raised by the link session while opening, identifying or holding the
/// serial connection to the printer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Opening, reading or writing the port failed
    #[error("Transport error on {port}: {reason}")]
    Transport {
        /// The port the failure happened on.
        port: String,
        /// The underlying transport error.
        reason: String,
    },

    /// No candidate baud rate produced a firmware signature
    #[error("No firmware response on {port} (tried {} baud)", format_bauds(.tried))]
    HandshakeFailure {
        /// The port that was probed.
        port: String,
        /// Every baud rate that was tried, in order.
        tried: Vec<u32>,
    },

    /// The port did not open within the allowed time
    #[error("Timed out opening {port} after {timeout_ms}ms")]
    OpenTimeout {
        /// The port that was being opened.
        port: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The device disappeared while the session was active
    #[error("Device removed: {port}")]
    DeviceRemoved {
        /// The port whose device went away.
        port: String,
    },

    /// A disconnect or teardown cut a connect attempt short
    #[error("Connection attempt on {port} was cancelled")]
    Cancelled {
        /// The port that was being connected.
        port: String,
    },

    /// A connect call is already running
    #[error("A connection attempt is already in progress")]
    ConnectionInProgress,

    /// No session is open
    #[error("Printer not connected")]
    NotConnected,

    /// Serial ports could not be listed
    #[error("Failed to enumerate serial ports: {reason}")]
    PortEnumeration {
        /// The reason enumeration failed.
        reason: String,
    },
}

fn format_bauds(bauds: &[u32]) -> String {
    bauds
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Command flow error type
///
/// Raised while a command is written and its acknowledgement awaited.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// No acknowledgement arrived in time
    #[error("No acknowledgement for '{command}' within {timeout_ms}ms")]
    AcknowledgementTimeout {
        /// The command awaiting acknowledgement.
        command: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The firmware answered with an error line
    #[error("Printer rejected '{command}': {message}")]
    CommandError {
        /// The rejected command.
        command: String,
        /// The error text reported by the firmware.
        message: String,
    },

    /// Every allowed attempt failed
    #[error("'{command}' failed after {attempts} attempts: {reason}")]
    RetryBudgetExceeded {
        /// The command that could not be delivered.
        command: String,
        /// How many attempts were made.
        attempts: u32,
        /// The reason the last attempt failed.
        reason: String,
    },

    /// The command can never fit in the firmware receive buffer
    #[error("'{command}' needs {cost} bytes but the printer buffer holds {capacity}")]
    BufferOverflow {
        /// The command that was rejected.
        command: String,
        /// The buffer cost of the command.
        cost: usize,
        /// The configured buffer capacity.
        capacity: usize,
    },

    /// An emergency stop or disconnect cut the wait short
    #[error("'{command}' interrupted before acknowledgement")]
    Interrupted {
        /// The command that was in flight.
        command: String,
    },

    /// Blank commands are never written
    #[error("Empty command")]
    EmptyCommand,
}

/// Print job error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The requested transition is not allowed from the current state
    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current state name.
        current: String,
        /// The requested state name.
        requested: String,
    },

    /// A control request needs a running job
    #[error("No active print job")]
    NoActiveJob,

    /// The feed task did not answer a control request in time
    #[error("Print job did not answer {action} within {timeout_ms}ms")]
    ControlTimeout {
        /// The requested action.
        action: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// `M114` was acknowledged without a parsable position line
    #[error("Printer did not report its position")]
    PositionUnavailable,

    /// The program contains nothing to send
    #[error("Program has no commands")]
    EmptyProgram,
}

/// Main error type for printlink
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command flow error
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Print job error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Connection(e) => Error::Connection(e.clone()),
            Error::Flow(e) => Error::Flow(e.clone()),
            Error::Job(e) => Error::Job(e.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Other(msg) => Error::Other(msg.clone()),
        }
    }
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Flow(FlowError::AcknowledgementTimeout { .. })
                | Error::Connection(ConnectionError::OpenTimeout { .. })
                | Error::Job(JobError::ControlTimeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// True when the link itself failed and the session was torn down
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection(
                ConnectionError::Transport { .. }
                    | ConnectionError::DeviceRemoved { .. }
                    | ConnectionError::NotConnected
            )
        )
    }

    /// Check if this is an interruption from emergency stop or disconnect
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Flow(FlowError::Interrupted { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
