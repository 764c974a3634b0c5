//! Printer host facade
//!
//! `PrinterHost` is the surface applications talk to. It wires a
//! [`LinkSessionManager`] to the job feed task and exposes the observable
//! state: connection status, telemetry, the job snapshot, the journal and
//! the event bus. It is cheap to clone; clones share one printer.

use crate::communication::buffered::{Ack, FlowConfig};
use crate::communication::serial::SerialPortOpener;
use crate::communication::session::{ConnectOptions, LinkSessionManager, SessionConfig, SessionInfo};
use crate::communication::PortOpener;
use crate::firmware::marlin::commands::{babystep_z, EMERGENCY_STOP, REPORT_POSITION};
use crate::firmware::marlin::{FirmwareInfo, MarlinSettings};
use crate::job::runner::{ControlReply, JobControl, JobRunner, JobSettings};
use crate::job::{JobStatus, PrintJob, StreamOptions, StreamSummary, StreamingAdapter};
use parking_lot::Mutex;
use printlink_core::{
    AppEvent, ConnectionError, ConnectionStatus, Error, EventBus, JobError, JobEvent, Journal,
    JournalConfig, Position, PrinterTelemetry, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Everything a host needs to run
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub session: SessionConfig,
    pub flow: FlowConfig,
    pub job: JobSettings,
    /// How long pause/resume/stop wait for the feed task to answer
    pub control_timeout: Duration,
    pub journal: JournalConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            flow: FlowConfig::default(),
            job: JobSettings::default(),
            control_timeout: Duration::from_secs(60),
            journal: JournalConfig::default(),
        }
    }
}

/// A started print job
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    done: oneshot::Receiver<Result<StreamSummary>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the job to end. Stop and emergency stop end it with `Ok`;
    /// a failed command ends it with that command's error.
    pub async fn wait(self) -> Result<StreamSummary> {
        self.done
            .await
            .map_err(|_| Error::other("print job task ended without a result"))?
    }
}

struct ActiveJob {
    id: Uuid,
    control: mpsc::Sender<JobControl>,
}

struct HostInner {
    session: LinkSessionManager,
    job: Arc<watch::Sender<PrintJob>>,
    active: Mutex<Option<ActiveJob>>,
    job_settings: JobSettings,
    control_timeout: Duration,
}

/// Host for one Marlin printer
#[derive(Clone)]
pub struct PrinterHost {
    inner: Arc<HostInner>,
}

impl PrinterHost {
    /// Host talking to real serial ports
    pub fn new(config: HostConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    pub fn with_opener(config: HostConfig, opener: Arc<dyn PortOpener>) -> Self {
        let journal = Journal::with_config(config.journal);
        let bus = Arc::new(EventBus::new());
        let session = LinkSessionManager::new(opener, config.session, config.flow, journal, bus);
        Self {
            inner: Arc::new(HostInner {
                session,
                job: Arc::new(watch::Sender::new(PrintJob::default())),
                active: Mutex::new(None),
                job_settings: config.job,
                control_timeout: config.control_timeout,
            }),
        }
    }

    pub fn session(&self) -> &LinkSessionManager {
        &self.inner.session
    }

    pub fn journal(&self) -> &Journal {
        self.inner.session.link().journal()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.inner.session.link().bus()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.session.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.session.link().subscribe_status()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn telemetry(&self) -> PrinterTelemetry {
        self.inner.session.link().telemetry()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<PrinterTelemetry> {
        self.inner.session.link().subscribe_telemetry()
    }

    /// Snapshot of the current or last job
    pub fn job(&self) -> PrintJob {
        self.inner.job.borrow().clone()
    }

    pub fn subscribe_job(&self) -> watch::Receiver<PrintJob> {
        self.inner.job.subscribe()
    }

    pub fn firmware_info(&self) -> Option<FirmwareInfo> {
        self.inner.session.firmware_info()
    }

    pub fn firmware_settings(&self) -> Option<MarlinSettings> {
        self.inner.session.firmware_settings()
    }

    pub async fn connect(&self, options: ConnectOptions) -> Result<SessionInfo> {
        self.inner.session.connect(options).await
    }

    /// Close the session; safe to call at any time. Returns true when a port
    /// was actually closed.
    pub async fn disconnect(&self, force: bool) -> bool {
        self.inner.session.disconnect(force).await
    }

    /// Send one command and wait for its acknowledgement
    pub async fn send_command(&self, command: &str) -> Result<Ack> {
        let result = self.inner.session.flow().lock().await.submit(command).await;
        if let Err(e) = &result {
            self.journal()
                .err(format!("Command '{}' failed: {}", command.trim(), e));
        }
        result
    }

    /// Start streaming `program` as a print job
    pub async fn start_job(&self, program: &str, options: StreamOptions) -> Result<JobHandle> {
        let adapter = StreamingAdapter::from_program(program, options);
        if adapter.total() == 0 {
            return Err(self.rejected(JobError::EmptyProgram.into()));
        }
        if !self.is_connected() {
            return Err(self.rejected(ConnectionError::NotConnected.into()));
        }

        let job = PrintJob::printing(adapter.total());
        let id = job.id;
        let mut refused = None;
        self.inner.job.send_if_modified(|current| {
            match current.status.transition(JobStatus::Printing) {
                Ok(_) => {
                    *current = job;
                    true
                }
                Err(e) => {
                    refused = Some(e);
                    false
                }
            }
        });
        if let Some(e) = refused {
            return Err(self.rejected(e.into()));
        }

        let (control, control_rx) = mpsc::channel(8);
        let (done, done_rx) = oneshot::channel();
        *self.inner.active.lock() = Some(ActiveJob { id, control });

        let link = self.inner.session.link();
        JobRunner::new(
            id,
            Arc::clone(link),
            Arc::clone(self.inner.session.flow()),
            adapter,
            self.inner.job_settings.clone(),
            Arc::clone(&self.inner.job),
            control_rx,
        )
        .spawn(done);

        Ok(JobHandle { id, done: done_rx })
    }

    /// Stream `program` and wait for the job to end
    pub async fn send_gcode_program(
        &self,
        program: &str,
        options: StreamOptions,
    ) -> Result<StreamSummary> {
        self.start_job(program, options).await?.wait().await
    }

    /// Park the head and freeze the feed
    pub async fn pause(&self) -> Result<PrintJob> {
        self.control(JobControl::Pause).await
    }

    /// Return to the parked position and continue with the next line
    pub async fn resume(&self) -> Result<PrintJob> {
        self.control(JobControl::Resume).await
    }

    /// Discard the rest of the job without moving the head
    pub async fn stop(&self) -> Result<PrintJob> {
        self.control(JobControl::Stop).await
    }

    /// Halt the printer now. Never fails: write errors are only journalled.
    pub async fn emergency_stop(&self, reason: &str) -> Result<PrintJob> {
        let link = self.inner.session.link();
        tracing::warn!("Emergency stop: {}", reason);
        self.journal().err(format!("Emergency stop: {}", reason));

        let active = self.active_job();
        let (reply, answer) = oneshot::channel();
        let queued = match &active {
            Some((_, control)) => control
                .send(JobControl::EmergencyStop {
                    reason: reason.to_string(),
                    reply,
                })
                .await
                .is_ok(),
            None => false,
        };

        link.halt();
        for command in EMERGENCY_STOP {
            if let Err(e) = link.write_line(command) {
                tracing::warn!("Emergency stop write '{}' failed: {}", command, e);
            }
        }

        if queued {
            let confirmed = tokio::time::timeout(self.inner.control_timeout, answer).await;
            link.clear_halt();
            match confirmed {
                Ok(Ok(Ok(job))) => return Ok(job),
                Ok(Ok(Err(e))) => tracing::warn!("Print job refused the emergency stop: {}", e),
                Ok(Err(_)) => tracing::debug!("Print job ended before the emergency stop"),
                Err(_) => tracing::warn!("Print job did not confirm the emergency stop"),
            }
        } else {
            link.clear_halt();
        }

        // No feed task took care of it
        let job_id = active.map(|(id, _)| id);
        self.inner.job.send_modify(|job| {
            job.finish(JobStatus::EmergencyStopped);
            job.emergency_reason = Some(reason.to_string());
        });
        let _ = self.bus().publish(AppEvent::Job(JobEvent::EmergencyStopped {
            job_id,
            reason: reason.to_string(),
        }));
        Ok(self.job())
    }

    /// Nudge Z by `delta` mm with a baby-step, then re-read the position
    pub async fn adjust_z_offset(&self, delta: f64) -> Result<Position> {
        if !delta.is_finite() {
            return Err(Error::other(format!("Invalid Z offset: {}", delta)));
        }

        let mut flow = self.inner.session.flow().lock().await;
        let result = match flow.submit(&babystep_z(delta)).await {
            Ok(_) => flow.submit(REPORT_POSITION).await,
            Err(e) => Err(e),
        };
        drop(flow);

        match result {
            Ok(_) => {
                self.journal()
                    .sys(format!("Z offset adjusted by {} mm", delta));
                Ok(self.telemetry().position)
            }
            Err(e) => {
                self.journal()
                    .err(format!("Z offset adjustment failed: {}", e));
                Err(e)
            }
        }
    }

    fn active_job(&self) -> Option<(Uuid, mpsc::Sender<JobControl>)> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|job| (job.id, job.control.clone()))
    }

    fn rejected(&self, error: Error) -> Error {
        self.journal().err(format!("Print not started: {}", error));
        error
    }

    async fn control(&self, request: impl FnOnce(ControlReply) -> JobControl) -> Result<PrintJob> {
        let result = self.dispatch(request).await;
        if let Err(e) = &result {
            self.journal().err(e.to_string());
        }
        result
    }

    async fn dispatch(&self, request: impl FnOnce(ControlReply) -> JobControl) -> Result<PrintJob> {
        let Some((_, sender)) = self.active_job() else {
            return Err(JobError::NoActiveJob.into());
        };

        let (reply, answer) = oneshot::channel();
        let control = request(reply);
        let action = control.action();
        if sender.send(control).await.is_err() {
            return Err(JobError::NoActiveJob.into());
        }

        match tokio::time::timeout(self.inner.control_timeout, answer).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(JobError::NoActiveJob.into()),
            Err(_) => Err(JobError::ControlTimeout {
                action: action.to_string(),
                timeout_ms: self.inner.control_timeout.as_millis() as u64,
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for PrinterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterHost")
            .field("session", &self.inner.session)
            .field("job", &self.job().status)
            .finish()
    }
}
