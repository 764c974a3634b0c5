//! Marlin Response Parser
//!
//! Classifies one line of printer output. The parser is stateless: the same
//! line always yields the same response.

use printlink_core::{Position, TemperaturePair};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lines that only a live Marlin-style firmware prints in reply to the
/// handshake probes (`M115`, `M503`, `M119`).
pub const HANDSHAKE_SIGNATURES: [&str; 3] = ["FIRMWARE_NAME:", "Steps per unit:", "Reporting endstop"];

/// Heater readings carried by a temperature report
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureReport {
    pub hotend: Option<TemperaturePair>,
    pub bed: Option<TemperaturePair>,
}

impl TemperatureReport {
    pub fn is_empty(&self) -> bool {
        self.hotend.is_none() && self.bed.is_none()
    }
}

/// Coarse classification of a response line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Ack,
    Error,
    Busy,
    Position,
    Temperature,
    Other,
}

/// Marlin response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarlinResponse {
    /// `ok`, optionally followed by a temperature report (reply to `M105`)
    Ack { temperature: Option<TemperatureReport> },
    /// `Error:...` or `echo:Error...`
    Error { message: String },
    /// `echo:busy: processing` and friends; the firmware is alive but has not
    /// taken the command yet
    Busy { reason: String },
    /// `M114` report
    Position(Position),
    /// Temperature auto-report
    Temperature(TemperatureReport),
    /// Anything else, kept verbatim for the journal
    Other(String),
}

impl MarlinResponse {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::Ack { .. } => ResponseKind::Ack,
            Self::Error { .. } => ResponseKind::Error,
            Self::Busy { .. } => ResponseKind::Busy,
            Self::Position(_) => ResponseKind::Position,
            Self::Temperature(_) => ResponseKind::Temperature,
            Self::Other(_) => ResponseKind::Other,
        }
    }
}

impl fmt::Display for MarlinResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack { .. } => write!(f, "ok"),
            Self::Error { message } => write!(f, "error:{}", message),
            Self::Busy { reason } => write!(f, "busy:{}", reason),
            Self::Position(pos) => write!(f, "position:{}", pos),
            Self::Temperature(report) => write!(f, "temperature:{:?}", report),
            Self::Other(line) => write!(f, "message:{}", line),
        }
    }
}

/// Parser for Marlin serial output
#[derive(Debug, Clone, Copy, Default)]
pub struct MarlinResponseParser;

impl MarlinResponseParser {
    pub fn new() -> Self {
        Self
    }

    /// Classify a line. Returns `None` only for blank input.
    pub fn parse(&self, line: &str) -> Option<MarlinResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line == "ok" || line.starts_with("ok ") {
            let temperature = parse_temperatures(&line[2..]).filter(|r| !r.is_empty());
            return Some(MarlinResponse::Ack { temperature });
        }

        if line.contains("Error") || line.to_ascii_lowercase().starts_with("error") {
            return Some(MarlinResponse::Error {
                message: error_message(line),
            });
        }

        if let Some(idx) = line.find("busy:") {
            return Some(MarlinResponse::Busy {
                reason: line[idx + "busy:".len()..].trim().to_string(),
            });
        }

        if line.starts_with("X:") {
            if let Some(position) = parse_position(line) {
                return Some(MarlinResponse::Position(position));
            }
        }

        if starts_with_heater_label(line) {
            if let Some(report) = parse_temperatures(line).filter(|r| !r.is_empty()) {
                return Some(MarlinResponse::Temperature(report));
            }
        }

        Some(MarlinResponse::Other(line.to_string()))
    }
}

/// True when the line carries one of the firmware handshake signatures
pub fn is_handshake_signature(line: &str) -> bool {
    HANDSHAKE_SIGNATURES.iter().any(|sig| line.contains(sig))
}

fn error_message(line: &str) -> String {
    let rest = line.strip_prefix("echo:").unwrap_or(line).trim_start();
    let lowered = rest.to_ascii_lowercase();
    if lowered.starts_with("error") {
        rest["error".len()..]
            .trim_start_matches(':')
            .trim()
            .to_string()
    } else {
        rest.to_string()
    }
}

fn starts_with_heater_label(line: &str) -> bool {
    line.starts_with("T:") || line.starts_with("T0:") || line.starts_with("B:")
}

/// Parse `X:1.00 Y:2.00 Z:0.20 E:0.00 Count X:...`. All four axes must be
/// present and numeric; the stepper counts after `Count` are ignored.
fn parse_position(line: &str) -> Option<Position> {
    let mut x = None;
    let mut y = None;
    let mut z = None;
    let mut e = None;

    for token in line.split_whitespace() {
        if token.starts_with("Count") {
            break;
        }
        let Some((label, value)) = token.split_once(':') else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        match label {
            "X" => x = Some(value),
            "Y" => y = Some(value),
            "Z" => z = Some(value),
            "E" => e = Some(value),
            _ => {}
        }
    }

    Some(Position::new(x?, y?, z?, e?))
}

/// Extract up to one hotend and one bed pair from `T:200.0 /210.0 B:60.0 /60.0`.
///
/// The target may be glued to the reading (`T:200.0/210.0`) or be the next
/// token (`/210.0`). Readings without a numeric target are skipped.
fn parse_temperatures(text: &str) -> Option<TemperatureReport> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut report = TemperatureReport::default();

    for (i, token) in tokens.iter().enumerate() {
        let Some((label, value)) = token.split_once(':') else {
            continue;
        };
        let slot = match label {
            "T" | "T0" if report.hotend.is_none() => &mut report.hotend,
            "B" if report.bed.is_none() => &mut report.bed,
            _ => continue,
        };

        let (current, target) = match value.split_once('/') {
            Some((current, target)) => (current, target),
            None => match tokens.get(i + 1).and_then(|t| t.strip_prefix('/')) {
                Some(target) => (value, target),
                None => continue,
            },
        };

        if let (Ok(current), Ok(target)) = (current.parse::<f64>(), target.parse::<f64>()) {
            *slot = Some(TemperaturePair::new(current, target));
        }
    }

    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_error_message_strips_prefixes() {
        assert_eq!(error_message("Error:Printer halted"), "Printer halted");
        assert_eq!(error_message("echo:Error: thermal runaway"), "thermal runaway");
        assert_eq!(error_message("error:2"), "2");
    }

    #[test]
    fn test_position_requires_all_axes() {
        assert!(parse_position("X:1.00 Y:2.00 Z:3.00").is_none());
        assert!(parse_position("X:1.00 Y:abc Z:3.00 E:0").is_none());
    }

    #[test]
    fn test_temperature_target_glued() {
        let report = parse_temperatures("T:200.1/210.0 B:59.9/60.0").expect("report");
        assert_eq!(report.hotend, Some(TemperaturePair::new(200.1, 210.0)));
        assert_eq!(report.bed, Some(TemperaturePair::new(59.9, 60.0)));
    }

    #[test]
    fn test_first_hotend_wins() {
        let report = parse_temperatures("T:200.0 /210.0 B:60.0 /60.0 T0:200.0 /210.0 T1:25.0 /0.0")
            .expect("report");
        assert_eq!(report.hotend, Some(TemperaturePair::new(200.0, 210.0)));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(line in "\\PC{0,80}") {
            let parsed = MarlinResponseParser::new().parse(&line);
            prop_assert_eq!(parsed.is_none(), line.trim().is_empty());
        }

        #[test]
        fn prop_position_line_round_trips(
            x in -500i32..500,
            y in -500i32..500,
            z in 0i32..400,
            e in -100i32..100,
        ) {
            let line = format!("X:{}.00 Y:{}.00 Z:{}.00 E:{}.00 Count X:0 Y:0 Z:0", x, y, z, e);
            prop_assert_eq!(
                MarlinResponseParser::new().parse(&line),
                Some(MarlinResponse::Position(Position::new(x as f64, y as f64, z as f64, e as f64)))
            );
        }
    }
}
