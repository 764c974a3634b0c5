//! Marlin command vocabulary used by the host
//!
//! Fixed probes and the motion sequences for pause and resume.

use printlink_core::Position;

/// Firmware identification (`FIRMWARE_NAME:` reply)
pub const IDENTIFY: &str = "M115";
/// Dump active settings (`Steps per unit:` reply)
pub const REPORT_SETTINGS: &str = "M503";
/// Endstop states (`Reporting endstop status` reply)
pub const REPORT_ENDSTOPS: &str = "M119";
pub const REPORT_POSITION: &str = "M114";
pub const REPORT_TEMPERATURE: &str = "M105";

/// Written on every baud candidate during the handshake
pub const HANDSHAKE_PROBES: [&str; 3] = [IDENTIFY, REPORT_SETTINGS, REPORT_ENDSTOPS];

/// Sent before the first program line of a job: reset line numbers, enable
/// temperature auto-report, query position
pub const JOB_PRIMING: [&str; 3] = ["M110 N0", "M155 S1", REPORT_POSITION];

/// Quick stop, kill, cancel heating wait
pub const EMERGENCY_STOP: [&str; 3] = ["M410", "M112", "M108"];

/// Motion parameters for parking the head on pause
#[derive(Debug, Clone, PartialEq)]
pub struct ParkMotion {
    /// Filament retracted on pause and restored on resume (mm)
    pub retract_length: f64,
    pub retract_feed: f64,
    /// Clearance (mm) above the captured Z while parked. The lift is an
    /// absolute move to `Z + lift_height`, never lower than `lift_height`
    /// itself.
    pub lift_height: f64,
    pub lift_feed: f64,
    pub park_x: f64,
    pub park_y: f64,
    pub travel_feed: f64,
}

impl Default for ParkMotion {
    fn default() -> Self {
        Self {
            retract_length: 3.0,
            retract_feed: 1800.0,
            lift_height: 5.0,
            lift_feed: 300.0,
            park_x: 0.0,
            park_y: 0.0,
            travel_feed: 3000.0,
        }
    }
}

/// One command of a choreographed sequence
#[derive(Debug, Clone, PartialEq)]
pub struct MotionStep {
    pub command: String,
    /// Physical motion follows; wait the settle window after the ack
    pub moves: bool,
}

impl MotionStep {
    fn mode(command: &str) -> Self {
        Self {
            command: command.to_string(),
            moves: false,
        }
    }

    fn motion(command: String) -> Self {
        Self {
            command,
            moves: true,
        }
    }
}

impl ParkMotion {
    /// Absolute Z the head is lifted to when paused at `from`
    pub fn lift_target(&self, from: &Position) -> f64 {
        (from.z + self.lift_height).max(self.lift_height)
    }

    /// Retract, lift Z, park XY
    pub fn pause_sequence(&self, from: &Position) -> Vec<MotionStep> {
        vec![
            MotionStep::mode("G91"),
            MotionStep::motion(format!(
                "G1 E-{} F{}",
                format_number(self.retract_length),
                format_number(self.retract_feed)
            )),
            MotionStep::mode("G90"),
            MotionStep::motion(format!(
                "G1 Z{} F{}",
                format_number(self.lift_target(from)),
                format_number(self.lift_feed)
            )),
            MotionStep::motion(format!(
                "G1 X{} Y{} F{}",
                format_number(self.park_x),
                format_number(self.park_y),
                format_number(self.travel_feed)
            )),
        ]
    }

    /// Approach the captured position from above, descend, unretract
    pub fn resume_sequence(&self, park: &Position) -> Vec<MotionStep> {
        vec![
            MotionStep::mode("G90"),
            MotionStep::motion(format!(
                "G1 Z{} F{}",
                format_number(self.lift_target(park)),
                format_number(self.lift_feed)
            )),
            MotionStep::motion(format!(
                "G1 X{} Y{} F{}",
                format_number(park.x),
                format_number(park.y),
                format_number(self.travel_feed)
            )),
            MotionStep::motion(format!(
                "G1 Z{} F{}",
                format_number(park.z),
                format_number(self.lift_feed)
            )),
            MotionStep::mode("G91"),
            MotionStep::motion(format!(
                "G1 E{} F{}",
                format_number(self.retract_length),
                format_number(self.retract_feed)
            )),
            MotionStep::mode("G90"),
        ]
    }
}

/// Live Z nudge (baby-step)
pub fn babystep_z(delta: f64) -> String {
    format!("M290 Z{}", format_number(delta))
}

/// Shortest decimal form with at most three places: `5`, `5.2`, `-0.05`
pub fn format_number(value: f64) -> String {
    let rounded = format!("{:.3}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}
