//! Marlin firmware protocol
//!
//! Line classification, `M115`/`M503` report parsing and the command
//! sequences the host issues.

pub mod commands;
pub mod firmware_info;
pub mod response_parser;
pub mod settings_parser;

pub use commands::{MotionStep, ParkMotion};
pub use firmware_info::FirmwareInfo;
pub use response_parser::{
    is_handshake_signature, MarlinResponse, MarlinResponseParser, ResponseKind, TemperatureReport,
};
pub use settings_parser::{parse_settings_report, MarlinSettings};
