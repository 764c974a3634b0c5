//! Configuration file model
//!
//! Every section deserializes with defaults, so a config file only needs the
//! keys it wants to change. Durations are stored as integer milliseconds or
//! seconds to keep the TOML readable.

use crate::error::{SettingsError, SettingsResult};
use printlink_core::JournalConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config directory
pub const APP_DIR: &str = "printlink";
pub const CONFIG_FILE: &str = "config.toml";

/// Serial connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate used when auto-detect is off
    pub baud_rate: u32,
    pub auto_detect: bool,
    /// Rates tried by auto-detect, in order
    pub baud_candidates: Vec<u32>,
    pub open_timeout_ms: u64,
    /// How long probe replies are collected at each baud rate
    pub settle_window_ms: u64,
    /// Warn when a connected printer is silent this long; 0 disables
    pub silence_warning_secs: u64,
    pub disconnect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            auto_detect: true,
            baud_candidates: vec![115200, 250000, 57600, 38400, 9600],
            open_timeout_ms: 5000,
            settle_window_ms: 1500,
            silence_warning_secs: 10,
            disconnect_timeout_ms: 2000,
        }
    }
}

/// How command cost against the printer buffer is counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountingMode {
    /// `command_cost` per command
    #[default]
    Fixed,
    /// Command length plus newline
    Bytes,
}

/// Command flow settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Printer receive buffer size
    pub capacity: usize,
    pub accounting: AccountingMode,
    /// Cost per command in `fixed` accounting
    pub command_cost: usize,
    pub max_attempts: u32,
    pub ack_timeout_ms: u64,
    pub max_busy_wait_ms: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            capacity: 128,
            accounting: AccountingMode::Fixed,
            command_cost: 32,
            max_attempts: 3,
            ack_timeout_ms: 10_000,
            max_busy_wait_ms: 60_000,
        }
    }
}

/// Pause/resume motion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub retract_length: f64,
    pub retract_feed: f64,
    /// Clearance above the paused Z; also the lowest Z the head parks at
    pub lift_height: f64,
    pub lift_feed: f64,
    pub park_x: f64,
    pub park_y: f64,
    pub travel_feed: f64,
    /// Wait after each move of the pause and resume sequences
    pub settle_ms: u64,
    /// How long pause/resume/stop wait for the job to answer
    pub control_timeout_ms: u64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            retract_length: 3.0,
            retract_feed: 1800.0,
            lift_height: 5.0,
            lift_feed: 300.0,
            park_x: 0.0,
            park_y: 0.0,
            travel_feed: 3000.0,
            settle_ms: 500,
            control_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// `M105` poll period; 0 disables polling
    pub poll_interval_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
        }
    }
}

/// Communication journal rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    pub max_entries: usize,
    pub max_age_secs: u64,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age_secs: 3600,
        }
    }
}

impl JournalSettings {
    pub fn to_journal_config(&self) -> JournalConfig {
        JournalConfig {
            max_entries: self.max_entries,
            max_age: Duration::from_secs(self.max_age_secs),
            ..JournalConfig::default()
        }
    }
}

/// Complete printlink configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub flow: FlowSettings,
    pub motion: MotionSettings,
    pub telemetry: TelemetrySettings,
    pub journal: JournalSettings,
}

enum Format {
    Toml,
    Json,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        other => Err(SettingsError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config dir>/printlink/config.toml`
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no config directory on this platform".to_string())
            })
    }

    /// Load config from file (TOML or JSON)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::LoadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self = match format {
            Format::Toml => toml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> SettingsResult<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        match Self::default_path() {
            Ok(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save config to file (TOML or JSON), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Toml => {
                toml::to_string_pretty(self).map_err(|e| SettingsError::SaveError(e.to_string()))?
            }
            Format::Json => serde_json::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        let connection = &self.connection;
        if connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if connection.baud_candidates.is_empty() {
            return Err(SettingsError::invalid(
                "connection.baud_candidates",
                "needs at least one baud rate",
            ));
        }
        if connection.baud_candidates.contains(&0) {
            return Err(SettingsError::invalid(
                "connection.baud_candidates",
                "baud rates must be > 0",
            ));
        }
        if connection.open_timeout_ms == 0 {
            return Err(SettingsError::invalid("connection.open_timeout_ms", "must be > 0"));
        }

        let flow = &self.flow;
        if flow.capacity == 0 {
            return Err(SettingsError::invalid("flow.capacity", "must be > 0"));
        }
        if flow.max_attempts == 0 {
            return Err(SettingsError::invalid("flow.max_attempts", "must be > 0"));
        }
        if flow.ack_timeout_ms == 0 {
            return Err(SettingsError::invalid("flow.ack_timeout_ms", "must be > 0"));
        }
        if flow.accounting == AccountingMode::Fixed {
            if flow.command_cost == 0 {
                return Err(SettingsError::invalid("flow.command_cost", "must be > 0"));
            }
            if flow.command_cost > flow.capacity {
                return Err(SettingsError::invalid(
                    "flow.command_cost",
                    format!("{} exceeds capacity {}", flow.command_cost, flow.capacity),
                ));
            }
        }

        let motion = &self.motion;
        let feeds = [
            ("motion.retract_feed", motion.retract_feed),
            ("motion.lift_feed", motion.lift_feed),
            ("motion.travel_feed", motion.travel_feed),
        ];
        for (key, feed) in feeds {
            if !(feed.is_finite() && feed > 0.0) {
                return Err(SettingsError::invalid(key, "feed rate must be > 0"));
            }
        }
        if !(motion.retract_length.is_finite() && motion.retract_length >= 0.0) {
            return Err(SettingsError::invalid("motion.retract_length", "must be >= 0"));
        }
        if !(motion.lift_height.is_finite() && motion.lift_height >= 0.0) {
            return Err(SettingsError::invalid("motion.lift_height", "must be >= 0"));
        }
        if motion.control_timeout_ms == 0 {
            return Err(SettingsError::invalid("motion.control_timeout_ms", "must be > 0"));
        }

        if self.journal.max_entries == 0 {
            return Err(SettingsError::invalid("journal.max_entries", "must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flow.capacity, 128);
        assert_eq!(config.connection.baud_candidates[0], 115200);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyUSB0"

            [flow]
            accounting = "bytes"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.port, "/dev/ttyUSB0");
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.flow.accounting, AccountingMode::Bytes);
        assert_eq!(config.flow.max_attempts, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.flow.command_cost = 256;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::InvalidSetting { key, .. }) if key == "flow.command_cost"
        ));

        let mut config = Config::default();
        config.connection.baud_candidates.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.flow.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.motion.travel_feed = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bytes_accounting_ignores_cost() {
        let mut config = Config::default();
        config.flow.accounting = AccountingMode::Bytes;
        config.flow.command_cost = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_journal_conversion() {
        let journal = JournalSettings {
            max_entries: 50,
            max_age_secs: 120,
        }
        .to_journal_config();
        assert_eq!(journal.max_entries, 50);
        assert_eq!(journal.max_age, Duration::from_secs(120));
    }
}
