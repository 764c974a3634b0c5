//! printlink Settings Crate
//!
//! Loads, validates and saves the printlink configuration file.

pub mod config;
pub mod error;

pub use config::{
    AccountingMode, Config, ConnectionSettings, FlowSettings, JournalSettings, MotionSettings,
    TelemetrySettings,
};
pub use error::{SettingsError, SettingsResult};
