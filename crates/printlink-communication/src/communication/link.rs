//! Shared link state
//!
//! `Link` owns the open transport and everything the read loop feeds:
//! the connection status, the telemetry snapshot, the acknowledgement signal
//! channel consumed by the flow controller, and the interrupt epoch that
//! cancels in-flight waits. The session manager installs and releases the
//! transport; the flow controller writes through it.

use super::Transport;
use crate::firmware::marlin::{MarlinResponse, MarlinResponseParser};
use parking_lot::{Mutex, RwLock};
use printlink_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionStatus, DisconnectReason, EventBus,
    Journal, PrinterTelemetry, Result,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Acknowledgement-relevant lines forwarded to the flow controller
#[derive(Debug, Clone, PartialEq)]
pub enum FlowSignal {
    /// `ok` line, verbatim
    Ack(String),
    /// Firmware error message
    Error(String),
    /// Firmware busy notice
    Busy(String),
}

/// Read loop timing
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Sleep between reads when no data arrived
    pub idle_delay: Duration,
    /// Warn once per silent period when a connected printer says nothing
    pub silence_warning: Option<Duration>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(5),
            silence_warning: Some(Duration::from_secs(10)),
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Idle,
    Detached,
    Failed(io::Error),
}

pub struct Link {
    transport: Mutex<Option<Box<dyn Transport>>>,
    /// Bumped on every install and release; a read loop exits once its
    /// generation is stale
    generation: AtomicU64,
    /// Set by an emergency stop until the job side has wound down
    halted: AtomicBool,
    port_name: RwLock<String>,
    /// Why the last session ended; cleared when a transport is installed
    closed_by: RwLock<Option<DisconnectReason>>,
    status: watch::Sender<ConnectionStatus>,
    telemetry: watch::Sender<PrinterTelemetry>,
    interrupt: watch::Sender<u64>,
    signals: mpsc::UnboundedSender<FlowSignal>,
    capture: Mutex<Option<Vec<String>>>,
    parser: MarlinResponseParser,
    journal: Journal,
    bus: Arc<EventBus>,
}

impl Link {
    /// Create a link with no transport; the receiver belongs to the flow
    /// controller
    pub fn new(journal: Journal, bus: Arc<EventBus>) -> (Arc<Self>, mpsc::UnboundedReceiver<FlowSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            port_name: RwLock::new(String::new()),
            closed_by: RwLock::new(None),
            status: watch::Sender::new(ConnectionStatus::Disconnected),
            telemetry: watch::Sender::new(PrinterTelemetry::default()),
            interrupt: watch::Sender::new(0),
            signals,
            capture: Mutex::new(None),
            parser: MarlinResponseParser::new(),
            journal,
            bus,
        });
        (link, signal_rx)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn port_name(&self) -> String {
        self.port_name.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn telemetry(&self) -> PrinterTelemetry {
        *self.telemetry.borrow()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<PrinterTelemetry> {
        self.telemetry.subscribe()
    }

    pub fn subscribe_interrupt(&self) -> watch::Receiver<u64> {
        self.interrupt.subscribe()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.lock().is_some()
    }

    /// True while the transport installed at `generation` is still in place
    pub fn is_current(&self, generation: u64) -> bool {
        let slot = self.transport.lock();
        slot.is_some() && self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.closed_by.read().clone()
    }

    /// The error a waiter should see when the session ended under it because
    /// the device or the port failed. `None` for user-initiated closes.
    pub fn lost_link_error(&self) -> Option<ConnectionError> {
        match self.close_reason()? {
            DisconnectReason::DeviceRemoved => Some(ConnectionError::DeviceRemoved {
                port: self.port_name(),
            }),
            DisconnectReason::TransportFailure(reason) => Some(ConnectionError::Transport {
                port: self.port_name(),
                reason,
            }),
            DisconnectReason::UserRequested | DisconnectReason::Superseded => None,
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        self.status.send_replace(status)
    }

    /// Move to `Connecting` unless a connect is already running
    pub(crate) fn claim_connecting(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                false
            } else {
                *status = ConnectionStatus::Connecting;
                true
            }
        })
    }

    /// `Connecting` -> `Connected` while the transport installed at
    /// `generation` is still in place; false when the attempt was torn down
    pub(crate) fn promote_connected(&self, generation: u64) -> bool {
        // Holding the slot orders this against a failing read loop
        let slot = self.transport.lock();
        if slot.is_none() || self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        })
    }

    /// `Connecting` -> `Disconnected`, leaving any other status alone
    pub(crate) fn abandon_connecting(&self) {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Cancel every in-flight acknowledgement wait
    pub fn interrupt(&self) {
        self.interrupt.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Refuse flow-controlled writes and cancel waits until
    /// [`clear_halt`](Self::clear_halt)
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Take ownership of an opened transport, closing any previous one.
    /// Returns the generation the read loop must be started with.
    pub fn install_transport(&self, transport: Box<dyn Transport>, port_name: &str) -> u64 {
        let mut slot = self.transport.lock();
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.close() {
                tracing::warn!("Failed to close previous transport: {}", e);
            }
        }
        *slot = Some(transport);
        *self.port_name.write() = port_name.to_string();
        *self.closed_by.write() = None;
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Close and drop the transport. Returns false when there was none, in
    /// which case no transport operation happens.
    pub fn release_transport(&self) -> bool {
        let taken = {
            let mut slot = self.transport.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        close_taken(taken)
    }

    /// Release the transport only if it is still the one installed at
    /// `generation`
    pub(crate) fn release_transport_at(&self, generation: u64) -> bool {
        let taken = {
            let mut slot = self.transport.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        close_taken(taken)
    }

    /// The device behind the transport at `generation` stopped answering
    /// reads. A live session is closed; a handshake in progress loses its
    /// transport and is woken to report it.
    fn read_failed(&self, generation: u64, error: &io::Error) {
        let taken = {
            let mut slot = self.transport.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if self.status() == ConnectionStatus::Connected {
                None
            } else {
                self.generation.fetch_add(1, Ordering::SeqCst);
                *self.closed_by.write() = Some(DisconnectReason::DeviceRemoved);
                Some(slot.take())
            }
        };

        match taken {
            None => {
                self.close_session(DisconnectReason::DeviceRemoved);
            }
            Some(transport) => {
                self.journal
                    .err(format!("Read from {} failed: {}", self.port_name(), error));
                close_taken(transport);
                self.interrupt();
            }
        }
    }

    /// Release the transport, interrupt waiters and publish the disconnect.
    /// Safe to call repeatedly; returns true only for the call that actually
    /// closed a transport.
    pub fn close_session(&self, reason: DisconnectReason) -> bool {
        let released = self.release_transport();
        let previous = self.set_status(ConnectionStatus::Disconnected);
        let closing = released || previous != ConnectionStatus::Disconnected;
        if closing {
            *self.closed_by.write() = Some(reason.clone());
        }
        // Waiters read the close reason once woken
        self.interrupt();

        if closing {
            let port = self.port_name();
            match &reason {
                DisconnectReason::UserRequested | DisconnectReason::Superseded => {
                    self.journal.sys(format!("Disconnected from {} ({})", port, reason))
                }
                _ => self
                    .journal
                    .err(format!("Connection to {} lost: {}", port, reason)),
            };
            let _ = self
                .bus
                .publish(AppEvent::Connection(ConnectionEvent::Disconnected { port, reason }));
        }
        released
    }

    /// Write one newline-terminated command. A failed write while connected
    /// tears the session down.
    pub fn write_line(&self, text: &str) -> Result<()> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');

        let written = {
            let mut slot = self.transport.lock();
            match slot.as_mut() {
                Some(transport) => transport.write(&data),
                None => return Err(ConnectionError::NotConnected.into()),
            }
        };

        match written {
            Ok(_) => {
                self.journal.tx(text);
                Ok(())
            }
            Err(e) => {
                let port = self.port_name();
                self.journal
                    .err(format!("Write of '{}' to {} failed: {}", text, port, e));
                if self.status() == ConnectionStatus::Connected {
                    self.close_session(DisconnectReason::TransportFailure(e.to_string()));
                }
                Err(ConnectionError::Transport {
                    port,
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Start collecting every received line (handshake)
    pub(crate) fn begin_capture(&self) {
        *self.capture.lock() = Some(Vec::new());
    }

    pub(crate) fn end_capture(&self) -> Vec<String> {
        self.capture.lock().take().unwrap_or_default()
    }

    /// Route one reassembled line
    pub fn handle_line(&self, line: &str) {
        self.journal.rx(line);
        if let Some(capture) = self.capture.lock().as_mut() {
            capture.push(line.to_string());
        }

        let Some(response) = self.parser.parse(line) else {
            return;
        };

        // Send failures mean the flow controller is gone; the line is still
        // journalled
        match response {
            MarlinResponse::Ack { temperature } => {
                if let Some(report) = temperature {
                    self.telemetry
                        .send_modify(|t| t.apply_temperatures(report.hotend, report.bed));
                }
                let _ = self.signals.send(FlowSignal::Ack(line.to_string()));
            }
            MarlinResponse::Error { message } => {
                self.journal.err(format!("Printer error: {}", message));
                let _ = self.signals.send(FlowSignal::Error(message));
            }
            MarlinResponse::Busy { reason } => {
                let _ = self.signals.send(FlowSignal::Busy(reason));
            }
            MarlinResponse::Position(position) => {
                self.telemetry.send_modify(|t| t.apply_position(position));
            }
            MarlinResponse::Temperature(report) => {
                self.telemetry
                    .send_modify(|t| t.apply_temperatures(report.hotend, report.bed));
            }
            MarlinResponse::Other(_) => {}
        }
    }

    fn read_chunk(&self, generation: u64, buf: &mut [u8]) -> ReadOutcome {
        let mut slot = self.transport.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return ReadOutcome::Detached;
        }
        let Some(transport) = slot.as_mut() else {
            return ReadOutcome::Detached;
        };

        match transport.read(buf) {
            Ok(0) => ReadOutcome::Idle,
            Ok(n) => ReadOutcome::Data(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                ReadOutcome::Idle
            }
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// Spawn the line reassembly loop for the transport installed at
    /// `generation`
    pub fn spawn_reader(self: &Arc<Self>, generation: u64, config: ReaderConfig) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut chunk = [0u8; 256];
            let mut last_rx = Instant::now();
            let mut silence_reported = false;

            loop {
                match link.read_chunk(generation, &mut chunk) {
                    ReadOutcome::Data(n) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        while let Some(pos) = buffer.find('\n') {
                            let raw: String = buffer.drain(..=pos).collect();
                            let line = raw.trim();
                            if !line.is_empty() {
                                link.handle_line(line);
                            }
                        }
                        last_rx = Instant::now();
                        silence_reported = false;
                        tokio::task::yield_now().await;
                    }
                    ReadOutcome::Idle => {
                        tokio::time::sleep(config.idle_delay).await;
                    }
                    ReadOutcome::Detached => break,
                    ReadOutcome::Failed(e) => {
                        tracing::error!("Read from {} failed: {}", link.port_name(), e);
                        link.read_failed(generation, &e);
                        break;
                    }
                }

                if let Some(limit) = config.silence_warning {
                    if !silence_reported
                        && link.status() == ConnectionStatus::Connected
                        && last_rx.elapsed() >= limit
                    {
                        link.journal
                            .sys(format!("No response from printer for {:?}", limit));
                        silence_reported = true;
                    }
                }
            }

            tracing::debug!("Read loop for generation {} finished", generation);
        })
    }
}

fn close_taken(taken: Option<Box<dyn Transport>>) -> bool {
    match taken {
        Some(mut transport) => {
            if let Err(e) = transport.close() {
                tracing::warn!("Failed to close {}: {}", transport.name(), e);
            }
            true
        }
        None => false,
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("port", &self.port_name())
            .field("status", &self.status())
            .finish()
    }
}
