//! Printer data model
//!
//! Plain value types shared by the link, the job runner and observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Toolhead position as reported by `M114`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Extruder axis
    pub e: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2}",
            self.x, self.y, self.z, self.e
        )
    }
}

/// A heater reading: measured and requested temperature in °C
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperaturePair {
    pub current: f64,
    pub target: f64,
}

impl TemperaturePair {
    pub fn new(current: f64, target: f64) -> Self {
        Self { current, target }
    }
}

/// Latest known printer state, published on every parsed report
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PrinterTelemetry {
    pub position: Position,
    pub hotend: TemperaturePair,
    pub bed: TemperaturePair,
    /// When any field last changed; `None` until the first report
    pub timestamp: Option<DateTime<Utc>>,
    /// Position reports parsed so far
    #[serde(default)]
    pub position_reports: u64,
}

impl PrinterTelemetry {
    /// Record a position report
    pub fn apply_position(&mut self, position: Position) {
        self.position = position;
        self.position_reports += 1;
        self.timestamp = Some(Utc::now());
    }

    /// Record a temperature report; absent heaters keep their last value
    pub fn apply_temperatures(
        &mut self,
        hotend: Option<TemperaturePair>,
        bed: Option<TemperaturePair>,
    ) {
        if let Some(hotend) = hotend {
            self.hotend = hotend;
        }
        if let Some(bed) = bed {
            self.bed = bed;
        }
        if hotend.is_some() || bed.is_some() {
            self.timestamp = Some(Utc::now());
        }
    }
}

/// Link session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}
