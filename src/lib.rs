//! # printlink
//!
//! A serial host for Marlin-based 3D printers:
//! - Baud rate discovery by probing for a Marlin signature
//! - Flow-controlled command delivery with retries and `busy:` handling
//! - Print streaming with pause/park, resume and emergency stop
//! - Live temperature and position telemetry
//!
//! ## Architecture
//!
//! printlink is organized as a workspace with multiple crates:
//!
//! 1. **printlink-core** - Errors, telemetry types, journal, event bus
//! 2. **printlink-communication** - Serial link, Marlin protocol, flow control, print jobs
//! 3. **printlink-settings** - Configuration file loading and validation
//! 4. **printlink** - Command line binary that integrates all crates

use printlink_communication::{BufferAccounting, FlowConfig, ParkMotion, ReaderConfig};
use std::time::Duration;

pub use printlink_communication::{
    list_ports, ConnectOptions, HostConfig, JobHandle, JobSettings, JobStatus, PrintJob,
    PrinterHost, SessionConfig, SessionInfo, StreamOptions, StreamSummary,
};
pub use printlink_core::{
    AppEvent, ConnectionStatus, Error, Journal, LogEntry, Position, PrinterTelemetry, Result,
};
pub use printlink_settings::{AccountingMode, Config, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Sets up structured logging with:
/// - Console output, pretty or JSON lines
/// - RUST_LOG environment variable support, INFO by default
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    // Logs go to stderr so `send` output on stdout stays clean
    if json {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .json();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_line_number(true)
            .pretty();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Build the host configuration from a validated config file
pub fn host_config(config: &Config) -> HostConfig {
    let connection = &config.connection;
    let flow = &config.flow;
    let motion = &config.motion;

    let accounting = match flow.accounting {
        AccountingMode::Fixed => BufferAccounting::FixedCost(flow.command_cost),
        AccountingMode::Bytes => BufferAccounting::Bytes,
    };

    let reader = ReaderConfig {
        silence_warning: (connection.silence_warning_secs > 0)
            .then(|| Duration::from_secs(connection.silence_warning_secs)),
        ..ReaderConfig::default()
    };

    HostConfig {
        session: SessionConfig {
            port: connection.port.clone(),
            baud_rate: connection.baud_rate,
            auto_detect: connection.auto_detect,
            baud_candidates: connection.baud_candidates.clone(),
            open_timeout: millis(connection.open_timeout_ms),
            settle_window: millis(connection.settle_window_ms),
            poll_interval: (config.telemetry.poll_interval_ms > 0)
                .then(|| millis(config.telemetry.poll_interval_ms)),
            disconnect_timeout: millis(connection.disconnect_timeout_ms),
            reader,
        },
        flow: FlowConfig {
            capacity: flow.capacity,
            accounting,
            max_attempts: flow.max_attempts,
            ack_timeout: millis(flow.ack_timeout_ms),
            max_busy_wait: millis(flow.max_busy_wait_ms),
        },
        job: JobSettings {
            motion: ParkMotion {
                retract_length: motion.retract_length,
                retract_feed: motion.retract_feed,
                lift_height: motion.lift_height,
                lift_feed: motion.lift_feed,
                park_x: motion.park_x,
                park_y: motion.park_y,
                travel_feed: motion.travel_feed,
            },
            motion_settle: millis(motion.settle_ms),
        },
        control_timeout: millis(motion.control_timeout_ms),
        journal: config.journal.to_journal_config(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_host_defaults() {
        let host = host_config(&Config::default());
        let defaults = HostConfig::default();

        assert_eq!(host.session.baud_candidates, defaults.session.baud_candidates);
        assert_eq!(host.session.settle_window, defaults.session.settle_window);
        assert_eq!(host.session.poll_interval, defaults.session.poll_interval);
        assert_eq!(host.flow.capacity, defaults.flow.capacity);
        assert_eq!(host.flow.accounting, defaults.flow.accounting);
        assert_eq!(host.flow.ack_timeout, defaults.flow.ack_timeout);
        assert_eq!(host.job.motion, defaults.job.motion);
        assert_eq!(host.job.motion_settle, defaults.job.motion_settle);
        assert_eq!(host.control_timeout, defaults.control_timeout);
    }

    #[test]
    fn test_zero_disables_polling_and_silence_warning() {
        let mut config = Config::default();
        config.telemetry.poll_interval_ms = 0;
        config.connection.silence_warning_secs = 0;
        config.flow.accounting = AccountingMode::Bytes;

        let host = host_config(&config);

        assert!(host.session.poll_interval.is_none());
        assert!(host.session.reader.silence_warning.is_none());
        assert_eq!(host.flow.accounting, BufferAccounting::Bytes);
    }
}
