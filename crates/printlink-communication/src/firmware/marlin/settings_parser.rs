//! `M503` settings report parsing
//!
//! Marlin echoes its active configuration as G-code lines, usually prefixed
//! with `echo:` and interleaved with comment lines such as
//! `echo:; Steps per unit:`. Each recognised command fills one section of
//! [`MarlinSettings`]; unrecognised lines and unparsable values are skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-axis values (`M92`, `M201`, `M203`, `M205`)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisValues {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

/// `M204` accelerations
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Accelerations {
    pub print: Option<f64>,
    pub retract: Option<f64>,
    pub travel: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pid {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// `M603` filament change lengths
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilamentChange {
    pub unload_length: Option<f64>,
    pub load_length: Option<f64>,
}

/// `M420` bed leveling state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BedLeveling {
    pub enabled: bool,
    pub fade_height: Option<f64>,
}

/// Active firmware configuration as reported by `M503`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarlinSettings {
    pub steps_per_unit: Option<AxisValues>,
    pub max_feedrates: Option<AxisValues>,
    pub max_acceleration: Option<AxisValues>,
    pub acceleration: Option<Accelerations>,
    pub jerk: Option<AxisValues>,
    pub home_offset: Option<Offset>,
    pub hotend_pid: Option<Pid>,
    pub bed_pid: Option<Pid>,
    pub probe_offset: Option<Offset>,
    pub linear_advance_k: Option<f64>,
    pub filament_change: Option<FilamentChange>,
    pub power_loss_recovery: Option<bool>,
    pub bed_leveling: Option<BedLeveling>,
}

impl MarlinSettings {
    /// True when no recognised setting was found
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parse the lines of an `M503` report
pub fn parse_settings_report<'a>(lines: impl IntoIterator<Item = &'a str>) -> MarlinSettings {
    let mut settings = MarlinSettings::default();

    for line in lines {
        let Some((code, params)) = split_command(line) else {
            continue;
        };

        match code {
            "M92" => settings.steps_per_unit = Some(axis_values(&params)),
            "M203" => settings.max_feedrates = Some(axis_values(&params)),
            "M201" => settings.max_acceleration = Some(axis_values(&params)),
            "M205" => settings.jerk = Some(axis_values(&params)),
            "M204" => {
                settings.acceleration = Some(Accelerations {
                    print: params.get(&'P').copied(),
                    retract: params.get(&'R').copied(),
                    travel: params.get(&'T').copied(),
                })
            }
            "M206" => settings.home_offset = Some(offset(&params)),
            "M851" => settings.probe_offset = Some(offset(&params)),
            "M301" => {
                if let Some(pid) = pid(&params) {
                    settings.hotend_pid = Some(pid);
                }
            }
            "M304" => {
                if let Some(pid) = pid(&params) {
                    settings.bed_pid = Some(pid);
                }
            }
            "M900" => {
                if let Some(k) = params.get(&'K') {
                    settings.linear_advance_k = Some(*k);
                }
            }
            "M603" => {
                settings.filament_change = Some(FilamentChange {
                    unload_length: params.get(&'U').copied(),
                    load_length: params.get(&'L').copied(),
                })
            }
            "M413" => {
                if let Some(s) = params.get(&'S') {
                    settings.power_loss_recovery = Some(*s != 0.0);
                }
            }
            "M420" => {
                if let Some(s) = params.get(&'S') {
                    settings.bed_leveling = Some(BedLeveling {
                        enabled: *s != 0.0,
                        fade_height: params.get(&'Z').copied(),
                    });
                }
            }
            _ => {}
        }
    }

    settings
}

/// Split `echo:  M92 X80.00 Y80.00` into `("M92", {X: 80.0, Y: 80.0})`.
/// Comment lines (`echo:; ...`) and non-command lines yield `None`.
fn split_command(line: &str) -> Option<(&str, HashMap<char, f64>)> {
    let body = line.trim();
    let body = body.strip_prefix("echo:").unwrap_or(body).trim();
    let body = body.split(';').next().unwrap_or("").trim();

    let mut tokens = body.split_whitespace();
    let code = tokens.next()?;
    if !code.starts_with('M') || !code[1..].chars().all(|c| c.is_ascii_digit()) || code.len() < 2 {
        return None;
    }

    let mut params = HashMap::new();
    for token in tokens {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else {
            continue;
        };
        if let Ok(value) = chars.as_str().parse::<f64>() {
            params.insert(letter.to_ascii_uppercase(), value);
        }
    }

    Some((code, params))
}

fn axis_values(params: &HashMap<char, f64>) -> AxisValues {
    AxisValues {
        x: params.get(&'X').copied(),
        y: params.get(&'Y').copied(),
        z: params.get(&'Z').copied(),
        e: params.get(&'E').copied(),
    }
}

fn offset(params: &HashMap<char, f64>) -> Offset {
    Offset {
        x: params.get(&'X').copied(),
        y: params.get(&'Y').copied(),
        z: params.get(&'Z').copied(),
    }
}

fn pid(params: &HashMap<char, f64>) -> Option<Pid> {
    Some(Pid {
        p: *params.get(&'P')?,
        i: *params.get(&'I')?,
        d: *params.get(&'D')?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &[&str] = &[
        "echo:; Linear Units:",
        "echo:  G21 ; (mm)",
        "echo:; Steps per unit:",
        "echo: M92 X80.00 Y80.00 Z400.00 E93.00",
        "echo:; Maximum feedrates (units/s):",
        "echo:  M203 X500.00 Y500.00 Z5.00 E25.00",
        "echo:  M201 X500.00 Y500.00 Z100.00 E5000.00",
        "echo:  M204 P500.00 R500.00 T1000.00",
        "echo:  M205 B20000.00 S0.00 T0.00 J0.08",
        "echo:  M206 X0.00 Y0.00 Z-1.50",
        "echo:  M420 S1 Z10.00",
        "echo:  M301 P21.73 I1.54 D76.55",
        "echo:  M304 P462.10 I85.47 D624.59",
        "echo:  M851 X-44.00 Y-9.00 Z-2.05",
        "echo:  M900 K0.00",
        "echo:  M413 S1",
        "echo:  M603 L0.00 U100.00",
        "ok",
    ];

    #[test]
    fn test_full_report() {
        let settings = parse_settings_report(REPORT.iter().copied());

        let steps = settings.steps_per_unit.expect("M92");
        assert_eq!(steps.x, Some(80.0));
        assert_eq!(steps.e, Some(93.0));

        assert_eq!(settings.max_feedrates.and_then(|f| f.z), Some(5.0));
        assert_eq!(settings.max_acceleration.and_then(|a| a.e), Some(5000.0));

        let accel = settings.acceleration.expect("M204");
        assert_eq!(accel.travel, Some(1000.0));

        assert_eq!(settings.home_offset.and_then(|o| o.z), Some(-1.5));
        assert_eq!(
            settings.bed_leveling,
            Some(BedLeveling {
                enabled: true,
                fade_height: Some(10.0)
            })
        );
        assert_eq!(
            settings.hotend_pid,
            Some(Pid {
                p: 21.73,
                i: 1.54,
                d: 76.55
            })
        );
        assert_eq!(settings.bed_pid.map(|p| p.p), Some(462.10));
        assert_eq!(settings.probe_offset.and_then(|o| o.x), Some(-44.0));
        assert_eq!(settings.linear_advance_k, Some(0.0));
        assert_eq!(settings.power_loss_recovery, Some(true));
        assert_eq!(
            settings.filament_change,
            Some(FilamentChange {
                unload_length: Some(100.0),
                load_length: Some(0.0)
            })
        );
    }

    #[test]
    fn test_malformed_values_skipped() {
        let settings = parse_settings_report(["echo: M92 Xabc Y80.00", "echo: M301 P1.0 I2.0"]);
        let steps = settings.steps_per_unit.expect("M92");
        assert_eq!(steps.x, None);
        assert_eq!(steps.y, Some(80.0));
        assert!(settings.hotend_pid.is_none());
    }

    #[test]
    fn test_unrelated_output() {
        let settings = parse_settings_report(["start", "echo:busy: processing", "ok"]);
        assert!(settings.is_empty());
    }
}
