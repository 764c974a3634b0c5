//! `M115` firmware report parsing
//!
//! The report is one line of `KEY:value` fields whose values may contain
//! spaces, followed by optional `Cap:NAME:0|1` capability lines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FIELD_KEYS: [&str; 6] = [
    "FIRMWARE_NAME:",
    "SOURCE_CODE_URL:",
    "PROTOCOL_VERSION:",
    "MACHINE_TYPE:",
    "EXTRUDER_COUNT:",
    "UUID:",
];

/// Identification reported by the firmware
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub firmware_name: Option<String>,
    pub source_code_url: Option<String>,
    pub protocol_version: Option<String>,
    pub machine_type: Option<String>,
    pub extruder_count: Option<u32>,
    pub uuid: Option<String>,
    /// `Cap:` lines, name to enabled
    pub capabilities: BTreeMap<String, bool>,
}

impl FirmwareInfo {
    /// Build from every line captured during the handshake; unrelated lines
    /// are ignored. Returns `None` when no `FIRMWARE_NAME:` line was seen.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut info: Option<FirmwareInfo> = None;
        let mut capabilities = BTreeMap::new();

        for line in lines {
            let line = line.trim();
            if info.is_none() && line.contains("FIRMWARE_NAME:") {
                info = Some(Self::parse_report_line(line));
            } else if let Some(cap) = line.strip_prefix("Cap:") {
                if let Some((name, flag)) = cap.rsplit_once(':') {
                    capabilities.insert(name.trim().to_string(), flag.trim() == "1");
                }
            }
        }

        info.map(|mut info| {
            info.capabilities = capabilities;
            info
        })
    }

    /// Parse the single `FIRMWARE_NAME:... SOURCE_CODE_URL:...` line
    pub fn parse_report_line(line: &str) -> Self {
        let mut starts: Vec<(usize, &str)> = FIELD_KEYS
            .iter()
            .filter_map(|key| line.find(key).map(|idx| (idx, *key)))
            .collect();
        starts.sort_by_key(|(idx, _)| *idx);

        let mut info = FirmwareInfo::default();
        for (i, (idx, key)) in starts.iter().enumerate() {
            let value_start = idx + key.len();
            let value_end = starts.get(i + 1).map_or(line.len(), |(next, _)| *next);
            let value = line[value_start..value_end].trim();
            if value.is_empty() {
                continue;
            }
            match *key {
                "FIRMWARE_NAME:" => info.firmware_name = Some(value.to_string()),
                "SOURCE_CODE_URL:" => info.source_code_url = Some(value.to_string()),
                "PROTOCOL_VERSION:" => info.protocol_version = Some(value.to_string()),
                "MACHINE_TYPE:" => info.machine_type = Some(value.to_string()),
                "EXTRUDER_COUNT:" => info.extruder_count = value.parse().ok(),
                "UUID:" => info.uuid = Some(value.to_string()),
                _ => {}
            }
        }
        info
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "FIRMWARE_NAME:Marlin 2.1.2.1 (Jun 12 2024 10:00:00) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 V2 EXTRUDER_COUNT:1 UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff";

    #[test]
    fn test_parse_report_line() {
        let info = FirmwareInfo::parse_report_line(REPORT);
        assert_eq!(
            info.firmware_name.as_deref(),
            Some("Marlin 2.1.2.1 (Jun 12 2024 10:00:00)")
        );
        assert_eq!(
            info.source_code_url.as_deref(),
            Some("github.com/MarlinFirmware/Marlin")
        );
        assert_eq!(info.protocol_version.as_deref(), Some("1.0"));
        assert_eq!(info.machine_type.as_deref(), Some("Ender-3 V2"));
        assert_eq!(info.extruder_count, Some(1));
        assert_eq!(
            info.uuid.as_deref(),
            Some("cede2a2f-41a2-4748-9b12-c55c62f367ff")
        );
    }

    #[test]
    fn test_capabilities_collected() {
        let lines = [
            "echo:start",
            REPORT,
            "Cap:SERIAL_XON_XOFF:0",
            "Cap:AUTOREPORT_TEMP:1",
            "ok",
        ];
        let info = FirmwareInfo::from_lines(lines).expect("info");
        assert!(info.has_capability("AUTOREPORT_TEMP"));
        assert!(!info.has_capability("SERIAL_XON_XOFF"));
        assert!(!info.has_capability("EEPROM"));
    }

    #[test]
    fn test_no_report() {
        assert!(FirmwareInfo::from_lines(["ok", "echo:Steps per unit:"]).is_none());
    }
}
