//! # printlink Core
//!
//! Core types shared by the printlink crates: the error taxonomy, printer
//! telemetry and connection state, the communication journal and the event
//! bus.

pub mod data;
pub mod error;
pub mod event_bus;
pub mod journal;

pub use data::{ConnectionStatus, Position, PrinterTelemetry, TemperaturePair};

pub use error::{ConnectionError, Error, FlowError, JobError, Result};

pub use event_bus::{
    AppEvent, ConnectionEvent, DisconnectReason, EventBus, EventBusConfig, EventCategory,
    EventFilter, JobEvent, SubscriptionId,
};

pub use journal::{Journal, JournalConfig, LogDirection, LogEntry};
