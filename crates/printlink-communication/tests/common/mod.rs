#![allow(dead_code)]

use async_trait::async_trait;
use printlink_communication::{
    ConnectionParams, FlowConfig, HostConfig, JobSettings, PortOpener, PrinterHost, ReaderConfig,
    SessionConfig, Transport,
};
use printlink_core::{Position, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const PORT: &str = "/dev/ttyMOCK0";

/// Gap between `echo:busy:` lines from a busy printer
pub const BUSY_EVERY: Duration = Duration::from_millis(100);

/// A printer busy "forever" stops sending busy lines after this long
const BUSY_FOREVER: Duration = Duration::from_secs(3);

/// Simulated Marlin printer shared by the mock opener and its transports
#[derive(Clone, Default)]
pub struct MockPrinter {
    state: Arc<Mutex<PrinterState>>,
}

#[derive(Default)]
struct PrinterState {
    /// Rates the printer answers at; empty means it never answers
    baud_rates: Vec<u32>,
    current_baud: u32,
    open: bool,
    opened: Vec<u32>,
    closes: usize,
    inbox: VecDeque<u8>,
    /// Replies released into the inbox once due, in due order
    deferred: Vec<(Instant, String)>,
    written: Vec<String>,
    /// Position after every handled command
    trace: Vec<(String, Position)>,
    position: Position,
    relative: bool,
    /// Commands that never get a reply
    ignored: HashSet<String>,
    /// Go silent once this many `G1` lines were acknowledged
    silent_after_moves: Option<usize>,
    moves_acked: usize,
    muted: bool,
    fail_reads: bool,
    /// Commands answered with `echo:busy:` until done; `None` never finishes
    busy: HashMap<String, Option<Duration>>,
    /// First occurrence gets `Error:<message>` then a late `ok`
    rejections: HashMap<String, (String, Duration)>,
    /// `M114` acknowledged without a position line
    no_position: bool,
}

impl MockPrinter {
    /// A printer that answers at every baud rate
    pub fn new() -> Self {
        Self::answering_at(&[115200, 250000, 57600, 38400, 9600])
    }

    pub fn answering_at(baud_rates: &[u32]) -> Self {
        let printer = Self::default();
        printer.state.lock().unwrap().baud_rates = baud_rates.to_vec();
        printer
    }

    pub fn opener(&self) -> Arc<dyn PortOpener> {
        Arc::new(MockOpener {
            printer: self.clone(),
        })
    }

    pub fn ignore(&self, command: &str) {
        self.state.lock().unwrap().ignored.insert(command.to_string());
    }

    pub fn go_silent_after_moves(&self, moves: usize) {
        let mut state = self.state.lock().unwrap();
        state.silent_after_moves = Some(moves);
        state.moves_acked = 0;
    }

    /// Report `busy:` every [`BUSY_EVERY`] and acknowledge `command` once
    /// `work` has passed
    pub fn busy_for(&self, command: &str, work: Duration) {
        let mut state = self.state.lock().unwrap();
        state.busy.insert(command.to_string(), Some(work));
    }

    /// Report `busy:` for `command` and never acknowledge it
    pub fn stay_busy(&self, command: &str) {
        let mut state = self.state.lock().unwrap();
        state.busy.insert(command.to_string(), None);
    }

    /// Reject the next `command` like a checksum failure: `Error:` right
    /// away, the trailing `ok` after `ok_after`
    pub fn reject_once(&self, command: &str, message: &str, ok_after: Duration) {
        let mut state = self.state.lock().unwrap();
        state
            .rejections
            .insert(command.to_string(), (message.to_string(), ok_after));
    }

    pub fn omit_position_report(&self) {
        self.state.lock().unwrap().no_position = true;
    }

    /// Answer everything again
    pub fn recover(&self) {
        let mut state = self.state.lock().unwrap();
        state.silent_after_moves = None;
        state.muted = false;
        state.ignored.clear();
        state.busy.clear();
        state.rejections.clear();
        state.no_position = false;
    }

    /// Make the next read fail as if the cable was pulled
    pub fn unplug(&self) {
        self.state.lock().unwrap().fail_reads = true;
    }

    pub fn opened(&self) -> Vec<u32> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn written(&self) -> Vec<String> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn count_written(&self, command: &str) -> usize {
        self.written().iter().filter(|c| c.as_str() == command).count()
    }

    pub fn trace(&self) -> Vec<(String, Position)> {
        self.state.lock().unwrap().trace.clone()
    }

    pub fn position(&self) -> Position {
        self.state.lock().unwrap().position
    }
}

impl PrinterState {
    fn reply(&mut self, line: &str) {
        self.inbox.extend(line.as_bytes());
        self.inbox.push_back(b'\n');
    }

    fn defer(&mut self, after: Duration, line: &str) {
        self.deferred.push((Instant::now() + after, line.to_string()));
        self.deferred.sort_by_key(|(due, _)| *due);
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        let due = self.deferred.iter().take_while(|(at, _)| *at <= now).count();
        let lines: Vec<String> = self.deferred.drain(..due).map(|(_, line)| line).collect();
        for line in lines {
            self.reply(&line);
        }
    }

    fn handle(&mut self, command: &str) {
        self.written.push(command.to_string());

        let answers = self.baud_rates.contains(&self.current_baud);
        if !answers || self.muted || self.ignored.contains(command) {
            return;
        }

        if let Some((message, ok_after)) = self.rejections.remove(command) {
            self.reply(&format!("Error:{}", message));
            self.defer(ok_after, "ok");
            return;
        }

        if let Some(work) = self.busy.get(command).copied() {
            let busy_until = work.unwrap_or(BUSY_FOREVER);
            let mut at = BUSY_EVERY;
            while at < busy_until {
                self.defer(at, "echo:busy: processing");
                at += BUSY_EVERY;
            }
            if let Some(work) = work {
                self.defer(work, "ok");
            }
            return;
        }

        let mut words = command.split_whitespace();
        match words.next().unwrap_or_default() {
            "M115" => {
                self.reply(
                    "FIRMWARE_NAME:Marlin 2.1.2.1 (Github) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin \
                     PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1 \
                     UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff",
                );
                self.reply("Cap:EEPROM:1");
                self.reply("Cap:AUTOREPORT_TEMP:1");
            }
            "M503" => {
                self.reply("echo:; Steps per unit:");
                self.reply("echo:  M92 X80.00 Y80.00 Z400.00 E93.00");
                self.reply("echo:; Maximum feedrates (units/s):");
                self.reply("echo:  M203 X500.00 Y500.00 Z5.00 E25.00");
            }
            "M119" => {
                self.reply("Reporting endstop status");
                self.reply("x_min: open");
            }
            "M114" if self.no_position => {}
            "M114" => {
                let p = self.position;
                self.reply(&format!(
                    "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0",
                    p.x, p.y, p.z, p.e
                ));
            }
            "M105" => {
                self.reply("ok T:200.0 /200.0 B:60.0 /60.0 @:0 B@:0");
                return;
            }
            "G90" => self.relative = false,
            "G91" => self.relative = true,
            "G28" => self.position = Position::default(),
            "G0" | "G1" => {
                for word in words {
                    let (axis, value) = word.split_at(1);
                    let Ok(value) = value.parse::<f64>() else {
                        continue;
                    };
                    let slot = match axis {
                        "X" => &mut self.position.x,
                        "Y" => &mut self.position.y,
                        "Z" => &mut self.position.z,
                        "E" => &mut self.position.e,
                        _ => continue,
                    };
                    if self.relative {
                        *slot += value;
                    } else {
                        *slot = value;
                    }
                }
            }
            _ => {}
        }

        let position = self.position;
        self.trace.push((command.to_string(), position));
        self.reply("ok");

        if command.starts_with("G1") {
            self.moves_acked += 1;
            if self.silent_after_moves == Some(self.moves_acked) {
                self.muted = true;
            }
        }
    }
}

struct MockOpener {
    printer: MockPrinter,
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        let mut state = self.printer.state.lock().unwrap();
        state.opened.push(params.baud_rate);
        state.current_baud = params.baud_rate;
        state.open = true;
        state.inbox.clear();
        state.deferred.clear();
        state.fail_reads = false;
        Ok(Box::new(MockTransport {
            printer: self.printer.clone(),
            pending: String::new(),
        }))
    }
}

struct MockTransport {
    printer: MockPrinter,
    pending: String,
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.push_str(&String::from_utf8_lossy(data));
        let mut state = self.printer.state.lock().unwrap();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            state.handle(line.trim());
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.printer.state.lock().unwrap();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.release_due();
        let n = buf.len().min(state.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn name(&self) -> String {
        PORT.to_string()
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.printer.state.lock().unwrap();
        state.open = false;
        state.closes += 1;
        Ok(())
    }
}

/// Fast timings so tests finish quickly
pub fn test_config() -> HostConfig {
    HostConfig {
        session: SessionConfig {
            port: PORT.to_string(),
            settle_window: Duration::from_millis(100),
            open_timeout: Duration::from_secs(1),
            poll_interval: None,
            disconnect_timeout: Duration::from_millis(500),
            reader: ReaderConfig {
                idle_delay: Duration::from_millis(1),
                silence_warning: None,
            },
            ..SessionConfig::default()
        },
        flow: FlowConfig {
            ack_timeout: Duration::from_millis(300),
            max_busy_wait: Duration::from_millis(300),
            ..FlowConfig::default()
        },
        job: JobSettings {
            motion_settle: Duration::from_millis(5),
            ..JobSettings::default()
        },
        control_timeout: Duration::from_secs(5),
        ..HostConfig::default()
    }
}

pub fn host(printer: &MockPrinter) -> PrinterHost {
    PrinterHost::with_opener(test_config(), printer.opener())
}

/// A host already connected at the first baud rate
pub async fn connected_host(printer: &MockPrinter) -> PrinterHost {
    let host = host(printer);
    host.connect(Default::default())
        .await
        .expect("mock printer should answer the handshake");
    host
}
