//! Link session lifecycle
//!
//! `LinkSessionManager` turns a port name into exactly one usable session:
//! it walks the candidate baud rates, probes each one for a Marlin signature
//! and keeps the first that answers. It also owns the background tasks of a
//! session (the read loop and the temperature poll) and tears everything down
//! on disconnect.

use super::buffered::{CommandFlowController, FlowConfig};
use super::link::{Link, ReaderConfig};
use super::{ConnectionParams, PortOpener};
use crate::firmware::marlin::commands::{HANDSHAKE_PROBES, REPORT_TEMPERATURE};
use crate::firmware::marlin::{is_handshake_signature, parse_settings_report, FirmwareInfo, MarlinSettings};
use parking_lot::{Mutex, RwLock};
use printlink_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionStatus, DisconnectReason, EventBus,
    Journal, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Baud rates tried by auto-detect, most likely first
pub const DEFAULT_BAUD_RATES: [u32; 5] = [115200, 250000, 57600, 38400, 9600];

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Rate used when auto-detect is off
    pub baud_rate: u32,
    pub auto_detect: bool,
    /// Candidates for auto-detect, in order
    pub baud_candidates: Vec<u32>,
    pub open_timeout: Duration,
    /// How long to collect probe replies at each baud rate
    pub settle_window: Duration,
    /// `M105` poll period; `None` disables polling
    pub poll_interval: Option<Duration>,
    /// How long a graceful disconnect waits for the command in flight
    pub disconnect_timeout: Duration,
    pub reader: ReaderConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            auto_detect: true,
            baud_candidates: DEFAULT_BAUD_RATES.to_vec(),
            open_timeout: Duration::from_secs(5),
            settle_window: Duration::from_millis(1500),
            poll_interval: Some(Duration::from_secs(5)),
            disconnect_timeout: Duration::from_secs(2),
            reader: ReaderConfig::default(),
        }
    }
}

/// Per-call overrides for [`LinkSessionManager::connect`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub auto_detect: Option<bool>,
}

impl ConnectOptions {
    pub fn port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    pub fn with_auto_detect(mut self, auto_detect: bool) -> Self {
        self.auto_detect = Some(auto_detect);
        self
    }
}

/// What a successful connect settled on
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub port: String,
    pub baud_rate: u32,
    pub firmware: Option<FirmwareInfo>,
}

/// A baud rate that answered, with the read loop already running on it
struct Handshake {
    baud_rate: u32,
    generation: u64,
    lines: Vec<String>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct SessionTasks {
    reader: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Resets a half-finished connect when the connect future is dropped
struct ConnectingGuard<'a> {
    link: &'a Link,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.link.end_capture();
            self.link.release_transport();
            self.link.set_status(ConnectionStatus::Disconnected);
        }
    }
}

/// Establishes, holds and tears down the printer session
pub struct LinkSessionManager {
    opener: Arc<dyn PortOpener>,
    config: SessionConfig,
    link: Arc<Link>,
    flow: Arc<AsyncMutex<CommandFlowController>>,
    tasks: Mutex<SessionTasks>,
    firmware: RwLock<Option<FirmwareInfo>>,
    settings: RwLock<Option<MarlinSettings>>,
    handshake_lines: RwLock<Vec<String>>,
}

impl LinkSessionManager {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        config: SessionConfig,
        flow_config: FlowConfig,
        journal: Journal,
        bus: Arc<EventBus>,
    ) -> Self {
        let (link, signals) = Link::new(journal, bus);
        let flow = CommandFlowController::new(Arc::clone(&link), signals, flow_config);
        Self {
            opener,
            config,
            link,
            flow: Arc::new(AsyncMutex::new(flow)),
            tasks: Mutex::new(SessionTasks::default()),
            firmware: RwLock::new(None),
            settings: RwLock::new(None),
            handshake_lines: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// The single command path to the printer
    pub fn flow(&self) -> &Arc<AsyncMutex<CommandFlowController>> {
        &self.flow
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link.status()
    }

    pub fn is_connected(&self) -> bool {
        self.link.status() == ConnectionStatus::Connected
    }

    /// Parsed `M115` report from the last handshake
    pub fn firmware_info(&self) -> Option<FirmwareInfo> {
        self.firmware.read().clone()
    }

    /// Parsed `M503` report from the last handshake
    pub fn firmware_settings(&self) -> Option<MarlinSettings> {
        self.settings.read().clone()
    }

    /// Every line received during the last successful handshake
    pub fn handshake_lines(&self) -> Vec<String> {
        self.handshake_lines.read().clone()
    }

    fn candidates(&self, options: &ConnectOptions) -> Vec<u32> {
        let auto_detect = options.auto_detect.unwrap_or(self.config.auto_detect);
        match options.baud_rate {
            Some(baud) if !auto_detect => vec![baud],
            _ if auto_detect => {
                if self.config.baud_candidates.is_empty() {
                    DEFAULT_BAUD_RATES.to_vec()
                } else {
                    self.config.baud_candidates.clone()
                }
            }
            _ => vec![self.config.baud_rate],
        }
    }

    /// Open a session, trying each candidate baud rate in turn
    pub async fn connect(&self, options: ConnectOptions) -> Result<SessionInfo> {
        if !self.link.claim_connecting() {
            return Err(ConnectionError::ConnectionInProgress.into());
        }
        let mut guard = ConnectingGuard {
            link: &self.link,
            armed: true,
        };

        // A previous session on this host is replaced
        self.tasks.lock().abort_all();
        if self.link.release_transport() {
            let port = self.link.port_name();
            self.link
                .journal()
                .sys(format!("Closing {} for a new connection", port));
            let _ = self.link.bus().publish(AppEvent::Connection(ConnectionEvent::Disconnected {
                port,
                reason: DisconnectReason::Superseded,
            }));
        }
        self.link.interrupt();

        let port = options
            .port
            .clone()
            .unwrap_or_else(|| self.config.port.clone());
        let candidates = self.candidates(&options);

        tracing::info!("Connecting to {} (candidates: {:?})", port, candidates);
        let _ = self
            .link
            .bus()
            .publish(AppEvent::Connection(ConnectionEvent::Connecting { port: port.clone() }));

        let result = match self.handshake(&port, &candidates).await {
            Ok(found) => self.finish_connect(&port, found),
            Err(e) => Err(e),
        };
        guard.armed = false;

        match result {
            Ok(info) => Ok(info),
            Err(e) => {
                // The handshake already released its own transport; a
                // disconnect may have moved the status on
                self.link.abandon_connecting();
                tracing::error!("Connection to {} failed: {}", port, e);
                self.link
                    .journal()
                    .err(format!("Connection to {} failed: {}", port, e));
                let _ = self.link.bus().publish(AppEvent::Connection(
                    ConnectionEvent::ConnectionFailed {
                        port,
                        error: e.to_string(),
                    },
                ));
                Err(e)
            }
        }
    }

    async fn handshake(&self, port: &str, candidates: &[u32]) -> Result<Handshake> {
        let journal = self.link.journal();
        let mut tried = Vec::with_capacity(candidates.len());

        for &baud_rate in candidates {
            tried.push(baud_rate);
            journal.sys(format!("Trying {} @ {} baud", port, baud_rate));

            let params = ConnectionParams::serial(port, baud_rate);
            let transport =
                match tokio::time::timeout(self.config.open_timeout, self.opener.open(&params)).await {
                    Ok(opened) => opened?,
                    Err(_) => {
                        return Err(ConnectionError::OpenTimeout {
                            port: port.to_string(),
                            timeout_ms: self.config.open_timeout.as_millis() as u64,
                        }
                        .into())
                    }
                };

            let generation = self.link.install_transport(transport, port);
            self.link.begin_capture();
            let reader = self.link.spawn_reader(generation, self.config.reader.clone());

            let found = Handshake {
                baud_rate,
                generation,
                lines: Vec::new(),
                reader,
            };

            for probe in HANDSHAKE_PROBES {
                if let Err(e) = self.link.write_line(probe) {
                    self.abandon(found);
                    return Err(e);
                }
            }

            self.settle(generation).await;

            let lines = self.link.end_capture();
            if !self.link.is_current(generation)
                || self.link.status() != ConnectionStatus::Connecting
            {
                let error = self.cancelled(port);
                self.abandon(found);
                return Err(error);
            }

            if lines.iter().any(|line| is_handshake_signature(line)) {
                return Ok(Handshake { lines, ..found });
            }

            tracing::debug!("No firmware signature at {} baud", baud_rate);
            journal.err(format!("No firmware response @ {} baud", baud_rate));
            self.abandon(found);
        }

        Err(ConnectionError::HandshakeFailure {
            port: port.to_string(),
            tried,
        }
        .into())
    }

    /// Wait out the settle window, returning early once the attempt is
    /// disconnected or its transport goes away
    async fn settle(&self, generation: u64) {
        let deadline = tokio::time::Instant::now() + self.config.settle_window;
        let mut interrupt = self.link.subscribe_interrupt();
        let mut status = self.link.subscribe_status();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = interrupt.changed() => {}
                _ = status.changed() => {}
            }
            if !self.link.is_current(generation)
                || self.link.status() != ConnectionStatus::Connecting
            {
                return;
            }
        }
    }

    /// Why the attempt on `port` ended early
    fn cancelled(&self, port: &str) -> printlink_core::Error {
        match self.link.lost_link_error() {
            Some(error) => error.into(),
            None => ConnectionError::Cancelled {
                port: port.to_string(),
            }
            .into(),
        }
    }

    /// Stop the read loop and close the transport of a failed attempt
    fn abandon(&self, attempt: Handshake) {
        attempt.reader.abort();
        self.link.end_capture();
        self.link.release_transport_at(attempt.generation);
    }

    fn finish_connect(&self, port: &str, found: Handshake) -> Result<SessionInfo> {
        if !self.link.promote_connected(found.generation) {
            let error = self.cancelled(port);
            self.abandon(found);
            return Err(error);
        }

        let Handshake {
            baud_rate,
            lines,
            reader,
            ..
        } = found;
        let port = port.to_string();
        let firmware = FirmwareInfo::from_lines(lines.iter().map(String::as_str));
        let settings = parse_settings_report(lines.iter().map(String::as_str));

        *self.firmware.write() = firmware.clone();
        *self.settings.write() = (!settings.is_empty()).then_some(settings);
        *self.handshake_lines.write() = lines;

        let mut tasks = self.tasks.lock();
        tasks.reader = Some(reader);
        tasks.poller = self.config.poll_interval.map(|interval| self.spawn_poller(interval));
        drop(tasks);

        let firmware_name = firmware.as_ref().and_then(|f| f.firmware_name.clone());
        tracing::info!("Connected to {} @ {} baud", port, baud_rate);
        self.link.journal().sys(match &firmware_name {
            Some(name) => format!("Connected to {} @ {} baud ({})", port, baud_rate, name),
            None => format!("Connected to {} @ {} baud", port, baud_rate),
        });
        let _ = self
            .link
            .bus()
            .publish(AppEvent::Connection(ConnectionEvent::Connected {
                port: port.clone(),
                baud_rate,
                firmware: firmware_name,
            }));

        Ok(SessionInfo {
            port,
            baud_rate,
            firmware,
        })
    }

    /// Poll temperatures while nothing else is using the command path
    fn spawn_poller(&self, interval: Duration) -> JoinHandle<()> {
        let link = Arc::clone(&self.link);
        let flow = Arc::clone(&self.flow);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if link.status() != ConnectionStatus::Connected {
                    break;
                }
                let Ok(mut controller) = flow.try_lock() else {
                    continue;
                };
                if let Err(e) = controller.submit(REPORT_TEMPERATURE).await {
                    tracing::debug!("Temperature poll failed: {}", e);
                    if e.is_link_failure() {
                        break;
                    }
                }
            }
        })
    }

    /// Close the session. A graceful disconnect lets the command in flight
    /// finish first, bounded by `disconnect_timeout`; `force` interrupts it.
    /// Returns true only when a transport was actually closed.
    pub async fn disconnect(&self, force: bool) -> bool {
        if let Some(poller) = self.tasks.lock().poller.take() {
            poller.abort();
        }

        let mut in_flight = None;
        if !force && self.link.has_transport() {
            match tokio::time::timeout(self.config.disconnect_timeout, self.flow.lock()).await {
                Ok(guard) => in_flight = Some(guard),
                Err(_) => {
                    tracing::warn!("Command still in flight, interrupting it");
                    self.link
                        .journal()
                        .sys("Interrupting the command in flight to disconnect");
                }
            }
        }

        let closed = self.link.close_session(DisconnectReason::UserRequested);
        drop(in_flight);
        self.tasks.lock().abort_all();

        if closed {
            tracing::info!("Disconnected from {}", self.link.port_name());
        }
        closed
    }
}

impl std::fmt::Debug for LinkSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSessionManager")
            .field("config", &self.config)
            .field("link", &self.link)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::Transport;
    use async_trait::async_trait;

    struct NoPorts;

    #[async_trait]
    impl PortOpener for NoPorts {
        async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
            Err(ConnectionError::Transport {
                port: params.port.clone(),
                reason: "No such file or directory".to_string(),
            }
            .into())
        }
    }

    fn manager(config: SessionConfig) -> LinkSessionManager {
        LinkSessionManager::new(
            Arc::new(NoPorts),
            config,
            FlowConfig::default(),
            Journal::new(),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_candidates() {
        let session = manager(SessionConfig::default());
        assert_eq!(
            session.candidates(&ConnectOptions::default()),
            DEFAULT_BAUD_RATES.to_vec()
        );
        assert_eq!(
            session.candidates(
                &ConnectOptions::default()
                    .with_baud_rate(250000)
                    .with_auto_detect(false)
            ),
            vec![250000]
        );

        let fixed = manager(SessionConfig {
            auto_detect: false,
            baud_rate: 57600,
            ..SessionConfig::default()
        });
        assert_eq!(fixed.candidates(&ConnectOptions::default()), vec![57600]);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_disconnected() {
        let session = manager(SessionConfig::default());
        let result = session.connect(ConnectOptions::port("/dev/ttyUSB9")).await;
        assert!(matches!(
            result,
            Err(printlink_core::Error::Connection(ConnectionError::Transport { .. }))
        ));
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(!session.link().has_transport());
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let session = manager(SessionConfig::default());
        assert!(!session.disconnect(false).await);
        assert!(!session.disconnect(true).await);
    }
}
