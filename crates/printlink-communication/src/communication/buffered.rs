//! Command flow control with acknowledgement tracking
//!
//! Commands are written one at a time: `submit` resolves only when the
//! printer acknowledges the command, so resolution order is submission order.
//! An occupancy estimate of the firmware receive buffer gates every write.
//!
//! # Features
//! - Fixed-cost or byte-measured buffer accounting
//! - Per-attempt acknowledgement timeout, extended by `busy:` notices
//! - Bounded retries on timeout or firmware error
//! - Interruption by emergency stop or disconnect; nothing is written while
//!   the link is halted

use super::link::{FlowSignal, Link};
use printlink_core::{Error, FlowError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

/// How long a rejected command waits for the `ok` Marlin sends after
/// checksum and line-number errors, before it is retried
pub const TRAILING_ACK_GRACE: Duration = Duration::from_millis(100);

/// Status of the in-flight command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Built but not yet written
    Queued,
    /// Written, awaiting acknowledgement
    Sent,
    /// Acknowledged by the printer
    Acknowledged,
    /// Gave up on it
    Failed,
}

/// The command currently owned by the flow controller
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub text: String,
    pub status: CommandStatus,
    /// Attempts made so far
    pub retry_count: u32,
    pub max_attempts: u32,
    pub sent_at: Option<Instant>,
    /// Last failure reason, if any
    pub last_error: Option<String>,
}

impl PendingCommand {
    pub fn new(text: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            text: text.into(),
            status: CommandStatus::Queued,
            retry_count: 0,
            max_attempts,
            sent_at: None,
            last_error: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_attempts
    }

    pub fn awaiting_ack(&self) -> bool {
        self.status == CommandStatus::Sent
    }

    /// Mark command as sent and count the attempt
    pub fn mark_sent(&mut self) {
        self.status = CommandStatus::Sent;
        self.retry_count += 1;
        self.sent_at = Some(Instant::now());
    }

    pub fn mark_acknowledged(&mut self) {
        self.status = CommandStatus::Acknowledged;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = CommandStatus::Failed;
        self.last_error = Some(reason.into());
    }
}

/// How a command's share of the firmware buffer is estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccounting {
    /// Every command costs the same
    FixedCost(usize),
    /// Command length plus the newline
    Bytes,
}

impl BufferAccounting {
    pub fn cost_of(&self, command: &str) -> usize {
        match self {
            Self::FixedCost(cost) => *cost,
            Self::Bytes => command.len() + 1,
        }
    }
}

/// Configuration for command flow
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Firmware receive buffer size
    pub capacity: usize,
    pub accounting: BufferAccounting,
    /// Attempts per command, including the first
    pub max_attempts: u32,
    /// How long one attempt waits for `ok`
    pub ack_timeout: Duration,
    /// Upper bound on deadline extension from `busy:` notices, per attempt
    pub max_busy_wait: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            accounting: BufferAccounting::FixedCost(32),
            max_attempts: 3,
            ack_timeout: Duration::from_secs(10),
            max_busy_wait: Duration::from_secs(60),
        }
    }
}

/// Result of an acknowledged command
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub command: String,
    /// The `ok` line as received
    pub response: String,
    /// Attempts it took, starting at 1
    pub attempts: u32,
}

enum AttemptOutcome {
    Acknowledged(String),
    Failed(FlowError),
    Interrupted,
}

/// True when a command of `cost` fits next to `occupancy`
pub fn has_room(occupancy: usize, cost: usize, capacity: usize) -> bool {
    occupancy + cost <= capacity
}

/// Serialises writes to the printer and matches acknowledgements
pub struct CommandFlowController {
    link: Arc<Link>,
    config: FlowConfig,
    signals: mpsc::UnboundedReceiver<FlowSignal>,
    interrupt: watch::Receiver<u64>,
    occupancy: usize,
    pending: Option<PendingCommand>,
}

impl CommandFlowController {
    pub fn new(
        link: Arc<Link>,
        signals: mpsc::UnboundedReceiver<FlowSignal>,
        config: FlowConfig,
    ) -> Self {
        let interrupt = link.subscribe_interrupt();
        Self {
            link,
            config,
            signals,
            interrupt,
            occupancy: 0,
            pending: None,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Estimated bytes the firmware is holding for us
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// The command in flight or last handled
    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    /// Get the current buffer usage as a percentage
    pub fn buffer_usage_percent(&self) -> u32 {
        if self.config.capacity == 0 {
            return 0;
        }
        ((self.occupancy as f64 / self.config.capacity as f64) * 100.0) as u32
    }

    /// Write `command` and wait for its acknowledgement
    pub async fn submit(&mut self, command: &str) -> Result<Ack> {
        let command = command.trim();
        if command.is_empty() {
            return Err(FlowError::EmptyCommand.into());
        }

        let cost = self.config.accounting.cost_of(command);
        if cost > self.config.capacity {
            return Err(FlowError::BufferOverflow {
                command: command.to_string(),
                cost,
                capacity: self.config.capacity,
            }
            .into());
        }

        // A submit future dropped mid-wait leaves its cost behind
        if self.pending.as_ref().is_some_and(PendingCommand::awaiting_ack) {
            self.occupancy = 0;
        }

        // Only interrupts raised after this point concern this command
        self.interrupt.borrow_and_update();

        self.pending = Some(PendingCommand::new(command, self.config.max_attempts.max(1)));

        loop {
            if self.link.is_halted() {
                if let Some(pending) = self.pending.as_mut() {
                    pending.mark_failed("halted");
                }
                return Err(FlowError::Interrupted {
                    command: command.to_string(),
                }
                .into());
            }

            if !has_room(self.occupancy, cost, self.config.capacity) {
                return Err(FlowError::BufferOverflow {
                    command: command.to_string(),
                    cost,
                    capacity: self.config.capacity,
                }
                .into());
            }

            self.discard_stale_signals();
            self.link.write_line(command)?;
            self.occupancy += cost;
            if let Some(pending) = self.pending.as_mut() {
                pending.mark_sent();
            }

            let outcome = self.await_outcome(command).await;
            self.occupancy = self.occupancy.saturating_sub(cost);

            let Some(pending) = self.pending.as_mut() else {
                return Err(Error::other("flow controller lost track of its command"));
            };

            match outcome {
                AttemptOutcome::Acknowledged(response) => {
                    pending.mark_acknowledged();
                    return Ok(Ack {
                        command: command.to_string(),
                        response,
                        attempts: pending.retry_count,
                    });
                }
                AttemptOutcome::Interrupted => {
                    pending.mark_failed("interrupted");
                    // An emergency stop wins over whatever the link reports
                    if !self.link.is_halted() {
                        if let Some(lost) = self.link.lost_link_error() {
                            return Err(lost.into());
                        }
                    }
                    return Err(FlowError::Interrupted {
                        command: command.to_string(),
                    }
                    .into());
                }
                AttemptOutcome::Failed(error) => {
                    let reason = error.to_string();
                    pending.mark_failed(reason.clone());
                    if pending.can_retry() {
                        tracing::warn!(
                            "Command failed, retrying ({}/{}): {}",
                            pending.retry_count,
                            pending.max_attempts,
                            reason
                        );
                        self.link.journal().sys(format!(
                            "Retrying '{}' ({}/{}): {}",
                            command, pending.retry_count, pending.max_attempts, reason
                        ));
                        continue;
                    }

                    tracing::error!(
                        "Command '{}' failed after {} attempts",
                        command,
                        pending.retry_count
                    );
                    let error = FlowError::RetryBudgetExceeded {
                        command: command.to_string(),
                        attempts: pending.retry_count,
                        reason,
                    };
                    self.link.journal().err(error.to_string());
                    return Err(error.into());
                }
            }
        }
    }

    /// Acks left over from a timed-out attempt or from raw writes are not
    /// for the command about to be written. An `ok` that trails a firmware
    /// error is normally consumed in `await_outcome`; one arriving later than
    /// [`TRAILING_ACK_GRACE`] after its error can still be matched to the
    /// retry.
    fn discard_stale_signals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            tracing::debug!("Discarding stale {:?}", signal);
        }
    }

    async fn await_outcome(&mut self, command: &str) -> AttemptOutcome {
        let ack_timeout = self.config.ack_timeout;
        let started = Instant::now();
        let busy_limit = started + ack_timeout + self.config.max_busy_wait;
        let mut deadline = started + ack_timeout;

        let interrupt = &mut self.interrupt;
        let signals = &mut self.signals;

        loop {
            let signal = tokio::select! {
                biased;
                // A dropped sender means the link is gone; same outcome
                _ = interrupt.changed() => return AttemptOutcome::Interrupted,
                signal = signals.recv() => signal,
                _ = sleep_until(deadline) => {
                    return AttemptOutcome::Failed(FlowError::AcknowledgementTimeout {
                        command: command.to_string(),
                        timeout_ms: ack_timeout.as_millis() as u64,
                    });
                }
            };

            match signal {
                Some(FlowSignal::Ack(line)) => return AttemptOutcome::Acknowledged(line),
                Some(FlowSignal::Error(message)) => {
                    let grace = TRAILING_ACK_GRACE.min(ack_timeout);
                    if !swallow_trailing_ack(interrupt, signals, grace).await {
                        return AttemptOutcome::Interrupted;
                    }
                    return AttemptOutcome::Failed(FlowError::CommandError {
                        command: command.to_string(),
                        message,
                    });
                }
                Some(FlowSignal::Busy(reason)) => {
                    deadline = (Instant::now() + ack_timeout).min(busy_limit);
                    tracing::debug!("Printer busy ({}), waiting for '{}'", reason, command);
                }
                None => return AttemptOutcome::Interrupted,
            }
        }
    }
}

/// Wait up to `grace` for the `ok` that follows a firmware error and drop
/// it. Returns false when an interrupt arrived meanwhile.
async fn swallow_trailing_ack(
    interrupt: &mut watch::Receiver<u64>,
    signals: &mut mpsc::UnboundedReceiver<FlowSignal>,
    grace: Duration,
) -> bool {
    let until = Instant::now() + grace;
    loop {
        tokio::select! {
            biased;
            _ = interrupt.changed() => return false,
            signal = signals.recv() => match signal {
                Some(FlowSignal::Ack(line)) => {
                    tracing::debug!("Dropping '{}' that trailed a firmware error", line);
                    return true;
                }
                Some(_) => {}
                None => return false,
            },
            _ = sleep_until(until) => return true,
        }
    }
}

impl std::fmt::Debug for CommandFlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFlowController")
            .field("config", &self.config)
            .field("occupancy", &self.occupancy)
            .field("pending", &self.pending)
            .finish()
    }
}
