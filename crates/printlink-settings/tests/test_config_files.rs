use printlink_settings::{AccountingMode, Config, SettingsError};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_toml_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("printlink.toml");

    let mut config = Config::default();
    config.connection.port = "/dev/ttyACM0".to_string();
    config.connection.auto_detect = false;
    config.connection.baud_rate = 250000;
    config.flow.accounting = AccountingMode::Bytes;
    config.telemetry.poll_interval_ms = 0;

    config.save_to_file(&path).unwrap();
    let loaded = Config::load_from_file(&path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
fn test_json_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("printlink.json");
    fs::write(
        &path,
        r#"{ "connection": { "port": "COM3" }, "motion": { "lift_height": 10.0 } }"#,
    )
    .unwrap();

    let config = Config::load_from_file(&path).unwrap();

    assert_eq!(config.connection.port, "COM3");
    assert_eq!(config.motion.lift_height, 10.0);
    assert_eq!(config.motion.retract_length, 3.0);
}

#[test]
fn test_invalid_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("printlink.toml");
    fs::write(&path, "[flow]\ncapacity = 16\ncommand_cost = 32\n").unwrap();

    let result = Config::load_from_file(&path);

    assert!(matches!(
        result,
        Err(SettingsError::InvalidSetting { key, .. }) if key == "flow.command_cost"
    ));
}

#[test]
fn test_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("printlink.toml");
    fs::write(&path, "[connection\nport = ").unwrap();

    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::TomlError(_))
    ));
}

#[test]
fn test_unsupported_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("printlink.yaml");
    fs::write(&path, "connection: {}").unwrap();

    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::UnsupportedFormat(ext)) if ext == "yaml"
    ));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        Config::load_or_default(Some(&path)),
        Err(SettingsError::LoadError { .. })
    ));
}
