//! Background execution of transfer jobs.
//!
//! One job at a time runs on its own thread and holds the command channel
//! for its whole duration. The controlling thread polls progress and may
//! cancel; it never touches the channel while the job is active.

use {
    crate::{
        channel::CommandChannel,
        error::Error,
        transfer::{self, CancelToken, ProgressCell, TransferJob, TransferProgress},
    },
    log::{error, info, warn},
    std::{
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Terminal state of a job.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Every byte was confirmed.
    Completed,
    /// Stopped on request; the device keeps a partial file.
    Cancelled,
    /// Stopped on an unrecoverable error.
    Failed(Error),
}

/// What a finished job reports.
#[derive(Debug)]
pub struct TransferReport {
    /// The job that ran.
    pub job: TransferJob,
    /// How it ended.
    pub outcome: TransferOutcome,
    /// Progress at the moment it ended.
    pub progress: TransferProgress,
    /// Wall time of the whole job.
    pub elapsed: Duration,
}

impl TransferReport {
    /// Whether the job completed.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Completed)
    }
}

/// Runs at most one transfer job at a time.
pub struct TransferOrchestrator {
    channel: Arc<Mutex<CommandChannel>>,
    active: Arc<AtomicBool>,
    progress: ProgressCell,
    cancel: CancelToken,
    worker: Option<JoinHandle<TransferReport>>,
}

impl TransferOrchestrator {
    /// Create an orchestrator sharing `channel`.
    pub fn new(channel: Arc<Mutex<CommandChannel>>) -> Self {
        Self {
            channel,
            active: Arc::new(AtomicBool::new(false)),
            progress: ProgressCell::default(),
            cancel: CancelToken::default(),
            worker: None,
        }
    }

    /// Start `job` in the background. Returns `false` if a job is already
    /// active.
    ///
    /// The report of a previous job that was never collected with
    /// [`wait`](Self::wait) is discarded.
    pub fn start(&mut self, job: TransferJob) -> bool {
        if self
            .active
            .swap(true, Ordering::SeqCst)
        {
            warn!("A {} transfer is already running", job.kind);
            return false;
        }
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        self.cancel.reset();
        self.progress.reset();
        info!("Starting {} transfer of {}", job.kind, job.source.display());

        let channel = Arc::clone(&self.channel);
        let active = Arc::clone(&self.active);
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();

        self.worker = Some(thread::spawn(move || {
            let started = Instant::now();
            let result = {
                let mut channel = channel
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                transfer::run_job(&mut channel, &job, &progress, &cancel)
            };

            let snapshot = progress.snapshot();
            let outcome = match result {
                Ok(summary) if summary.cancelled => {
                    info!(
                        "Transfer cancelled after {} of {} bytes",
                        snapshot.bytes_transferred, snapshot.total_bytes
                    );
                    TransferOutcome::Cancelled
                },
                Ok(_) => {
                    progress.reset();
                    TransferOutcome::Completed
                },
                Err(e) => {
                    error!(
                        "Transfer failed after {} of {} bytes: {e}",
                        snapshot.bytes_transferred, snapshot.total_bytes
                    );
                    progress.reset();
                    TransferOutcome::Failed(e)
                },
            };

            active.store(false, Ordering::SeqCst);
            TransferReport {
                job,
                outcome,
                progress: snapshot,
                elapsed: started.elapsed(),
            }
        }));
        true
    }

    /// Percentage of the active job confirmed so far.
    ///
    /// `None` when no job is running.
    pub fn completion_percent(&self) -> Option<f64> {
        if !self.is_active() {
            return None;
        }
        self.progress
            .snapshot()
            .percent()
    }

    /// Latest progress snapshot. Retains the partial counts of a cancelled
    /// job until the next one starts.
    pub fn progress(&self) -> TransferProgress {
        self.progress.snapshot()
    }

    /// Ask the active job to stop at the next block boundary.
    pub fn cancel(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        info!("Cancelling transfer");
        self.cancel.cancel();
        true
    }

    /// Whether a job is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Block until the current job ends and return its report.
    pub fn wait(&mut self) -> Option<TransferReport> {
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!("Transfer thread panicked");
                self.active.store(false, Ordering::SeqCst);
                None
            },
        }
    }
}

impl Drop for TransferOrchestrator {
    fn drop(&mut self) {
        if self.cancel() {
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProtocolProfile, Timing};
    use crate::testing::FakePrinter;
    use crate::transfer::TransferKind;
    use crate::transport::Transport;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn orchestrator(fake: &FakePrinter) -> TransferOrchestrator {
        let profile = ProtocolProfile::default()
            .with_geometry(16, 4)
            .with_timing(Timing::immediate());
        let channel = CommandChannel::new(Transport::new(Box::new(fake.clone())), profile);
        TransferOrchestrator::new(Arc::new(Mutex::new(channel)))
    }

    fn gcode_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![b'G'; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_idle_orchestrator() {
        let fake = FakePrinter::firmware();
        let mut orch = orchestrator(&fake);
        assert!(!orch.is_active());
        assert_eq!(orch.completion_percent(), None);
        assert!(!orch.cancel());
        assert!(orch.wait().is_none());
    }

    #[test]
    fn test_gcode_job_completes() {
        let fake = FakePrinter::firmware();
        let mut orch = orchestrator(&fake);
        let file = gcode_file(150);

        let job = TransferJob::new(file.path(), TransferKind::Gcode).with_destination("part");
        assert!(orch.start(job));
        let report = orch.wait().unwrap();

        assert!(report.is_success());
        assert_eq!(report.progress.bytes_transferred, 150);
        assert!(!orch.is_active());
        assert_eq!(orch.completion_percent(), None);
        assert_eq!(orch.progress(), TransferProgress::default());
        assert_eq!(fake.received().len(), 150);
        assert!(fake.sd_files().contains(&"part".to_string()));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let fake = FakePrinter::firmware();
        let gate = fake.gate_block_open();
        let mut orch = orchestrator(&fake);
        let file = gcode_file(100);

        assert!(orch.start(TransferJob::new(file.path(), TransferKind::Gcode)));
        assert!(orch.is_active());
        assert!(!orch.start(TransferJob::new(file.path(), TransferKind::Gcode)));

        gate.release();
        assert!(orch.wait().unwrap().is_success());
    }

    #[test]
    fn test_cancel_keeps_partial_progress() {
        let fake = FakePrinter::firmware();
        let gate = fake.gate_block_open();
        let mut orch = orchestrator(&fake);
        let file = gcode_file(300);

        assert!(orch.start(TransferJob::new(file.path(), TransferKind::Gcode)));
        gate.wait_reached();
        assert!(orch.cancel());
        assert!(orch.completion_percent().is_some());
        gate.release();

        let report = orch.wait().unwrap();
        assert!(matches!(report.outcome, TransferOutcome::Cancelled));
        // The gated first block was already under way when the cancel landed.
        assert_eq!(report.progress.bytes_transferred, 64);
        assert_eq!(orch.progress().bytes_transferred, 64);
        assert!(!orch.is_active());
        assert_eq!(fake.received().len(), 64);
    }

    #[test]
    fn test_failed_job_reports_error() {
        let fake = FakePrinter::firmware();
        let mut orch = orchestrator(&fake);

        assert!(orch.start(TransferJob::new("/nonexistent/file.gcode", TransferKind::Gcode)));
        let report = orch.wait().unwrap();
        assert!(matches!(report.outcome, TransferOutcome::Failed(Error::Io(_))));
        assert!(!orch.is_active());
    }
}
