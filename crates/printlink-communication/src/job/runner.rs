//! Print job feed task
//!
//! One task per job owns the program cursor and the job snapshot. It primes
//! the printer, feeds program lines through the flow controller and answers
//! pause/resume/stop/emergency-stop requests that arrive on its control
//! channel. Requests are looked at between lines; an emergency stop also
//! halts the link so the line in flight is cut short.

use super::state::{JobFailure, JobStatus, PrintJob};
use super::streaming::{StreamSummary, StreamingAdapter};
use crate::communication::buffered::CommandFlowController;
use crate::communication::link::Link;
use crate::firmware::marlin::commands::{JOB_PRIMING, REPORT_POSITION};
use crate::firmware::marlin::{MotionStep, ParkMotion};
use printlink_core::{
    AppEvent, ConnectionError, ConnectionStatus, Error, JobError, JobEvent, Position, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Every control request is answered with the job snapshot after it applied
pub(crate) type ControlReply = oneshot::Sender<Result<PrintJob>>;

/// Requests from the host to the feed task
pub(crate) enum JobControl {
    Pause(ControlReply),
    Resume(ControlReply),
    Stop(ControlReply),
    EmergencyStop { reason: String, reply: ControlReply },
}

impl JobControl {
    pub(crate) fn action(&self) -> &'static str {
        match self {
            Self::Pause(_) => "pause",
            Self::Resume(_) => "resume",
            Self::Stop(_) => "stop",
            Self::EmergencyStop { .. } => "emergency stop",
        }
    }

    fn requested(&self) -> JobStatus {
        match self {
            Self::Pause(_) => JobStatus::Paused,
            Self::Resume(_) => JobStatus::Printing,
            Self::Stop(_) => JobStatus::Stopped,
            Self::EmergencyStop { .. } => JobStatus::EmergencyStopped,
        }
    }

    fn into_reply(self) -> ControlReply {
        match self {
            Self::Pause(reply) | Self::Resume(reply) | Self::Stop(reply) => reply,
            Self::EmergencyStop { reply, .. } => reply,
        }
    }

    /// Answer a request that does not apply in `current`
    fn reject(self, current: JobStatus) {
        let error = JobError::InvalidStateTransition {
            current: current.to_string(),
            requested: self.requested().to_string(),
        };
        let _ = self.into_reply().send(Err(error.into()));
    }
}

/// Motion settings a job runs with
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub motion: ParkMotion,
    /// Wait after every physical move of the pause and resume sequences
    pub motion_settle: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            motion: ParkMotion::default(),
            motion_settle: Duration::from_millis(500),
        }
    }
}

pub(crate) struct JobRunner {
    id: Uuid,
    link: Arc<Link>,
    flow: Arc<AsyncMutex<CommandFlowController>>,
    adapter: StreamingAdapter,
    settings: JobSettings,
    snapshot: Arc<watch::Sender<PrintJob>>,
    control: mpsc::Receiver<JobControl>,
}

impl JobRunner {
    pub(crate) fn new(
        id: Uuid,
        link: Arc<Link>,
        flow: Arc<AsyncMutex<CommandFlowController>>,
        adapter: StreamingAdapter,
        settings: JobSettings,
        snapshot: Arc<watch::Sender<PrintJob>>,
        control: mpsc::Receiver<JobControl>,
    ) -> Self {
        Self {
            id,
            link,
            flow,
            adapter,
            settings,
            snapshot,
            control,
        }
    }

    /// Run the job to its end on a new task
    pub(crate) fn spawn(self, done: oneshot::Sender<Result<StreamSummary>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let outcome = self.run().await;
            let _ = done.send(outcome);
        })
    }

    async fn run(mut self) -> Result<StreamSummary> {
        let total = self.adapter.total();
        tracing::info!("Print job {} started ({} commands)", self.id, total);
        self.link
            .journal()
            .sys(format!("Print started: {} commands", total));
        self.publish(JobEvent::Started {
            job_id: self.id,
            total,
        });

        for command in JOB_PRIMING {
            if let Err(e) = self.submit(command).await {
                return self.abort(command, e);
            }
        }

        loop {
            while let Ok(control) = self.control.try_recv() {
                if let Some(exit) = self.handle_control(control).await {
                    return exit;
                }
            }

            let Some(line) = self.adapter.peek().map(str::to_string) else {
                break;
            };
            let occupancy = match self.submit(&line).await {
                Ok(occupancy) => occupancy,
                Err(e) => return self.abort(&line, e),
            };

            self.adapter.advance();
            let sent = self.adapter.sent();
            self.snapshot
                .send_modify(|job| job.record_sent(sent, occupancy));
            self.publish(JobEvent::Progress {
                job_id: self.id,
                sent,
                total,
            });

            self.adapter.pace().await;
        }

        Ok(self.completed())
    }

    /// Submit one command; returns the occupancy after its acknowledgement
    async fn submit(&self, command: &str) -> Result<usize> {
        let mut flow = self.flow.lock().await;
        flow.submit(command).await?;
        Ok(flow.occupancy())
    }

    async fn run_step(&self, step: &MotionStep) -> Result<()> {
        self.submit(&step.command).await?;
        if step.moves && !self.settings.motion_settle.is_zero() {
            tokio::time::sleep(self.settings.motion_settle).await;
        }
        Ok(())
    }

    fn status(&self) -> JobStatus {
        self.snapshot.borrow().status
    }

    fn current(&self) -> PrintJob {
        self.snapshot.borrow().clone()
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.link.bus().publish(AppEvent::Job(event));
    }

    async fn handle_control(&mut self, control: JobControl) -> Option<Result<StreamSummary>> {
        match control {
            JobControl::Pause(reply) => self.pause(reply).await,
            JobControl::Stop(reply) => Some(Ok(self.stopped(None, Some(reply)))),
            JobControl::EmergencyStop { reason, reply } => {
                Some(Ok(self.emergency_stopped(reason, reply)))
            }
            other @ JobControl::Resume(_) => {
                other.reject(self.status());
                None
            }
        }
    }

    async fn pause(&mut self, reply: ControlReply) -> Option<Result<StreamSummary>> {
        tracing::info!("Pausing print job {}", self.id);
        self.link.journal().sys("Pausing print");

        let reports = self.link.telemetry().position_reports;
        if let Err(e) = self.submit(REPORT_POSITION).await {
            let _ = reply.send(Err(e.clone()));
            return Some(self.abort(REPORT_POSITION, e));
        }
        // M114 prints the position before its ok
        let telemetry = self.link.telemetry();
        if telemetry.position_reports == reports {
            let error: Error = JobError::PositionUnavailable.into();
            let _ = reply.send(Err(error.clone()));
            return Some(self.abort(REPORT_POSITION, error));
        }
        let park = telemetry.position;

        for step in self.settings.motion.pause_sequence(&park) {
            if let Err(e) = self.run_step(&step).await {
                let _ = reply.send(Err(e.clone()));
                return Some(self.abort(&step.command, e));
            }
        }

        self.snapshot.send_modify(|job| {
            job.status = JobStatus::Paused;
            job.park_position = Some(park);
        });
        self.link
            .journal()
            .sys(format!("Print paused, head parked from {}", park));
        self.publish(JobEvent::Paused {
            job_id: self.id,
            park_position: park,
        });
        let _ = reply.send(Ok(self.current()));

        self.wait_while_paused(park).await
    }

    async fn wait_while_paused(&mut self, park: Position) -> Option<Result<StreamSummary>> {
        let mut status = self.link.subscribe_status();
        loop {
            let control = tokio::select! {
                control = self.control.recv() => control,
                _ = status.wait_for(|s| *s == ConnectionStatus::Disconnected) => {
                    let command = self.adapter.peek().unwrap_or_default().to_string();
                    let error = self
                        .link
                        .lost_link_error()
                        .unwrap_or(ConnectionError::NotConnected);
                    return Some(self.abort(&command, error.into()));
                }
            };
            let Some(control) = control else {
                // The host is gone; nobody can resume this job
                return Some(Ok(self.stopped(None, None)));
            };

            match control {
                JobControl::Resume(reply) => {
                    tracing::info!("Resuming print job {}", self.id);
                    for step in self.settings.motion.resume_sequence(&park) {
                        if let Err(e) = self.run_step(&step).await {
                            let _ = reply.send(Err(e.clone()));
                            return Some(self.abort(&step.command, e));
                        }
                    }

                    self.snapshot.send_modify(|job| {
                        job.status = JobStatus::Printing;
                        job.park_position = None;
                    });
                    self.link.journal().sys("Print resumed");
                    self.publish(JobEvent::Resumed { job_id: self.id });
                    let _ = reply.send(Ok(self.current()));
                    return None;
                }
                JobControl::Stop(reply) => return Some(Ok(self.stopped(None, Some(reply)))),
                JobControl::EmergencyStop { reason, reply } => {
                    return Some(Ok(self.emergency_stopped(reason, reply)))
                }
                other @ JobControl::Pause(_) => other.reject(JobStatus::Paused),
            }
        }
    }

    /// End the job after `command` failed with `error`
    fn abort(&mut self, command: &str, error: Error) -> Result<StreamSummary> {
        if error.is_interrupted() {
            // An emergency stop or stop request queues its control message
            // before cutting the wait short
            while let Ok(control) = self.control.try_recv() {
                match control {
                    JobControl::EmergencyStop { reason, reply } => {
                        return Ok(self.emergency_stopped(reason, reply))
                    }
                    JobControl::Stop(reply) => return Ok(self.stopped(None, Some(reply))),
                    other => other.reject(self.status()),
                }
            }
        }
        let error = match self.link.lost_link_error() {
            Some(lost) if !self.link.is_halted() && lost_under(&error) => lost.into(),
            _ => error,
        };

        tracing::error!("Print job {} failed on '{}': {}", self.id, command, error);
        self.link
            .journal()
            .err(format!("Print stopped at '{}': {}", command, error));
        let failure = JobFailure {
            command: command.to_string(),
            reason: error.to_string(),
        };
        self.stopped(Some(failure), None);
        Err(error)
    }

    fn stopped(&mut self, failure: Option<JobFailure>, reply: Option<ControlReply>) -> StreamSummary {
        let discarded = self.adapter.discard_remaining();
        let summary = self.adapter.summary();
        let reason = failure.as_ref().map(|f| f.reason.clone());

        self.snapshot.send_modify(|job| {
            job.finish(JobStatus::Stopped);
            job.last_error = failure;
        });
        if reason.is_none() {
            self.link.journal().sys(format!(
                "Print stopped after {}/{} commands ({} discarded)",
                summary.sent, summary.total, discarded
            ));
        }
        self.publish(JobEvent::Stopped {
            job_id: self.id,
            sent: summary.sent,
            reason,
        });
        if let Some(reply) = reply {
            let _ = reply.send(Ok(self.current()));
        }
        summary
    }

    fn emergency_stopped(&mut self, reason: String, reply: ControlReply) -> StreamSummary {
        let discarded = self.adapter.discard_remaining();
        let summary = self.adapter.summary();

        self.snapshot.send_modify(|job| {
            job.finish(JobStatus::EmergencyStopped);
            job.emergency_reason = Some(reason.clone());
        });
        self.link.journal().sys(format!(
            "Print aborted after {}/{} commands, {} discarded",
            summary.sent, summary.total, discarded
        ));
        self.publish(JobEvent::EmergencyStopped {
            job_id: Some(self.id),
            reason,
        });
        let _ = reply.send(Ok(self.current()));
        summary
    }

    fn completed(&mut self) -> StreamSummary {
        let summary = self.adapter.summary();
        self.snapshot.send_modify(|job| {
            job.record_sent(summary.sent, 0);
            job.finish(JobStatus::Completed);
        });
        tracing::info!("Print job {} completed", self.id);
        self.link
            .journal()
            .sys(format!("Print completed: {} commands", summary.total));
        self.publish(JobEvent::Completed {
            job_id: self.id,
            total: summary.total,
        });
        summary
    }
}

/// Errors that only say the link went away, without saying why
fn lost_under(error: &Error) -> bool {
    error.is_interrupted() || matches!(error, Error::Connection(ConnectionError::NotConnected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_answers_with_transition_error() {
        let (tx, mut rx) = oneshot::channel();
        JobControl::Resume(tx).reject(JobStatus::Printing);
        let answer = rx.try_recv().unwrap();
        assert!(matches!(
            answer,
            Err(Error::Job(JobError::InvalidStateTransition { .. }))
        ));
    }

    #[test]
    fn test_action_names() {
        let (tx, _rx) = oneshot::channel();
        let control = JobControl::EmergencyStop {
            reason: "user".to_string(),
            reply: tx,
        };
        assert_eq!(control.action(), "emergency stop");
        assert_eq!(control.requested(), JobStatus::EmergencyStopped);
    }
}
