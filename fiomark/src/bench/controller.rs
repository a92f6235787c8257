//! Run orchestration: the job queue, cancellation and the run state machine.

use crate::bench::aggregate::{Aggregator, PatternResult};
use crate::bench::error::BenchmarkError;
use crate::bench::events::{BenchmarkEvent, EventBus, RunOutcome};
use crate::bench::parser::{RawSample, ResultParser};
use crate::bench::profile::{BenchmarkProfile, TestJob, expand};
use crate::bench::runner::{self, FioRunner, JobHandle, JobOutput, locate_tool};
use chrono::{DateTime, Utc};
use fiomark_common::FiomarkConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 64 * 1024;

/// Longest a job may run before the watchdog fires, whatever its duration.
const WATCHDOG_CAP: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lifecycle of the controller. Reset on every start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Running { job_index: usize },
    Stopping,
    Stopped,
    Failed { reason: String },
}

impl RunState {
    /// Whether a run currently owns the controller.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Running { .. } | Self::Stopping)
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub results: Vec<PatternResult>,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_jobs: usize,
    pub parse_anomalies: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RunTally {
    completed: usize,
    failed: usize,
    total: usize,
    anomalies: usize,
    cancelled: bool,
    test_file: Option<PathBuf>,
}

enum JobOutcome {
    Completed(Vec<RawSample>),
    Failed(BenchmarkError),
    Cancelled,
}

/// Owns the run state and drives fio through a profile's job queue.
///
/// Cheap to clone; clones share state, so one clone can run while another
/// cancels or observes.
#[derive(Clone)]
pub struct BenchmarkController {
    config: Arc<FiomarkConfig>,
    events: EventBus,
    state: Arc<Mutex<RunState>>,
    results: Arc<Mutex<Aggregator>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl BenchmarkController {
    pub fn new(config: FiomarkConfig) -> Self {
        let events = EventBus::new(config.event_buffer);
        let (cancel, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            events,
            state: Arc::new(Mutex::new(RunState::Idle)),
            results: Arc::new(Mutex::new(Aggregator::new())),
            cancel: Arc::new(cancel),
        }
    }

    pub fn config(&self) -> &FiomarkConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BenchmarkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> RunState {
        lock(&self.state).clone()
    }

    /// Current result matrix.
    pub fn results(&self) -> Vec<PatternResult> {
        lock(&self.results).snapshot()
    }

    /// Stop the active run. Idempotent; a no-op when nothing is running.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, RunState::Preparing | RunState::Running { .. }) {
                debug!(state = ?*state, "Cancel ignored");
                return;
            }
            *state = RunState::Stopping;
        }
        info!("Cancelling benchmark");
        self.events.emit(BenchmarkEvent::StateChanged {
            state: RunState::Stopping,
        });
        self.cancel.send_replace(true);
    }

    /// Run `profile` to completion or cancellation.
    ///
    /// Fatal conditions end in [`RunState::Failed`] and are returned as the
    /// error; job-level failures are reported as events and counted.
    pub async fn start(&self, profile: BenchmarkProfile) -> Result<RunSummary, BenchmarkError> {
        {
            let mut state = lock(&self.state);
            if state.is_active() {
                return Err(BenchmarkError::AlreadyRunning);
            }
            *state = RunState::Preparing;
            self.cancel.send_replace(false);
        }
        lock(&self.results).clear();
        self.events.emit(BenchmarkEvent::StateChanged {
            state: RunState::Preparing,
        });

        let started_at = Utc::now();
        let mut tally = RunTally::default();
        let result = self.execute(&profile, &mut tally).await;

        if let Some(path) = tally.test_file.take() {
            if self.config.keep_test_file {
                info!(path = %path.display(), "Keeping test file");
            } else if let Err(e) = runner::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove test file");
            }
        }

        match result {
            Ok(()) => {
                self.set_state(RunState::Stopped);
                self.events.emit(BenchmarkEvent::Finished {
                    outcome: RunOutcome::Stopped,
                });
                let summary = RunSummary {
                    state: RunState::Stopped,
                    results: self.results(),
                    completed_jobs: tally.completed,
                    failed_jobs: tally.failed,
                    total_jobs: tally.total,
                    parse_anomalies: tally.anomalies,
                    cancelled: tally.cancelled,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(
                    completed = summary.completed_jobs,
                    failed = summary.failed_jobs,
                    cancelled = summary.cancelled,
                    "Benchmark finished"
                );
                Ok(summary)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(error = %reason, "Benchmark failed");
                self.set_state(RunState::Failed {
                    reason: reason.clone(),
                });
                self.events.emit(BenchmarkEvent::Finished {
                    outcome: RunOutcome::Failed { reason },
                });
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        profile: &BenchmarkProfile,
        tally: &mut RunTally,
    ) -> Result<(), BenchmarkError> {
        profile.validate()?;
        let tool = locate_tool(&self.config)?;
        let runner = FioRunner::new(tool, &self.config);
        let jobs = expand(profile);
        tally.total = jobs.len();
        let mut cancel_rx = self.cancel.subscribe();

        info!(
            jobs = jobs.len(),
            target = %profile.target.display(),
            estimated = %humantime::format_duration(profile.estimated_duration()),
            "Starting benchmark"
        );

        tally.test_file = Some(profile.target.clone());
        tokio::select! {
            prepared = runner.prepare_file(profile) => prepared?,
            _ = cancelled(&mut cancel_rx) => {
                tally.cancelled = true;
                return Ok(());
            }
        }

        for job in &jobs {
            if job.index > 0
                && !profile.interval.is_zero()
                && !self.wait_interval(profile.interval, &mut cancel_rx).await
            {
                tally.cancelled = true;
                break;
            }
            if self.config.flush_page_cache {
                runner::flush_page_cache().await;
            }
            if !self.enter_job(job.index) {
                tally.cancelled = true;
                break;
            }

            info!(label = %job.label(), block_size = %job.block_size, "Job started");
            self.events.emit(BenchmarkEvent::Progress {
                job_index: job.index,
                total_jobs: job.total,
                label: job.label(),
                elapsed: Duration::ZERO,
                remaining: job.duration,
            });

            match self.run_job(&runner, job, profile, &mut cancel_rx, tally).await {
                JobOutcome::Completed(samples) => {
                    let updated = lock(&self.results).record(job, &samples);
                    tally.completed += 1;
                    if let Some(result) = updated {
                        self.events.emit(BenchmarkEvent::ResultUpdated { result });
                    }
                }
                JobOutcome::Cancelled => {
                    debug!(label = %job.label(), "Job cancelled, samples discarded");
                    tally.cancelled = true;
                    break;
                }
                JobOutcome::Failed(err) => {
                    if job.index == 0 && matches!(err, BenchmarkError::LaunchFailed { .. }) {
                        return Err(err);
                    }
                    warn!(label = %job.label(), error = %err, "Job failed");
                    tally.failed += 1;
                    self.events.emit(BenchmarkEvent::JobFailed {
                        job_index: job.index,
                        label: job.label(),
                        reason: err.to_string(),
                    });
                    if self.config.abort_on_job_failure {
                        info!("Halting after job failure");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_job(
        &self,
        runner: &FioRunner,
        job: &TestJob,
        profile: &BenchmarkProfile,
        cancel_rx: &mut watch::Receiver<bool>,
        tally: &mut RunTally,
    ) -> JobOutcome {
        let mut handle = match runner.start(job, profile) {
            Ok(handle) => handle,
            Err(err) => return JobOutcome::Failed(err),
        };

        let mut parser = ResultParser::new();
        let mut samples = Vec::new();
        let mut buf = vec![0u8; READ_BUFFER];
        let limit = job
            .duration
            .saturating_add(self.config.watchdog_slack)
            .min(WATCHDOG_CAP);
        let watchdog = tokio::time::sleep_until(Instant::now() + limit);
        tokio::pin!(watchdog);

        let status = loop {
            tokio::select! {
                output = handle.next_output(&mut buf) => match output {
                    Ok(JobOutput::Data(n)) => {
                        for sample in parser.feed(&buf[..n]) {
                            self.events.emit(BenchmarkEvent::Progress {
                                job_index: job.index,
                                total_jobs: job.total,
                                label: job.label(),
                                elapsed: sample.elapsed,
                                remaining: job.duration.saturating_sub(sample.elapsed),
                            });
                            samples.push(sample);
                        }
                    }
                    Ok(JobOutput::Exited(status)) => break Some(status),
                    Err(e) => {
                        warn!(label = %job.label(), error = %e, "Failed waiting for fio");
                        break None;
                    }
                },
                _ = cancelled(cancel_rx) => {
                    handle.terminate().await;
                    tally.anomalies += parser.anomalies();
                    return JobOutcome::Cancelled;
                }
                _ = &mut watchdog => {
                    handle.terminate().await;
                    tally.anomalies += parser.anomalies();
                    return JobOutcome::Failed(BenchmarkError::JobFailed {
                        label: job.label(),
                        reason: format!(
                            "still running after {}",
                            humantime::format_duration(limit)
                        ),
                    });
                }
            }
        };

        parser.finish();
        tally.anomalies += parser.anomalies();
        self.finish_job(job, &mut handle, status, samples).await
    }

    async fn finish_job(
        &self,
        job: &TestJob,
        handle: &mut JobHandle,
        status: Option<std::process::ExitStatus>,
        samples: Vec<RawSample>,
    ) -> JobOutcome {
        if !samples.is_empty() && exited_normally(status) {
            if !status.is_some_and(|s| s.success()) {
                warn!(label = %job.label(), ?status, "fio exited non-zero, keeping its results");
            }
            debug!(label = %job.label(), samples = samples.len(), "Job finished");
            return JobOutcome::Completed(samples);
        }
        if !samples.is_empty() {
            debug!(label = %job.label(), samples = samples.len(), ?status, "Discarding partial samples");
        }

        let stderr = handle.stderr_tail().await;
        let reason = match (status, stderr.trim()) {
            (Some(s), "") if !s.success() => format!("fio exited with {s}"),
            (Some(s), detail) if !s.success() => format!("fio exited with {s}: {detail}"),
            (None, "") => "lost track of fio before it exited".to_string(),
            (None, detail) => detail.to_string(),
            _ => "no results in fio output".to_string(),
        };
        JobOutcome::Failed(BenchmarkError::JobFailed {
            label: job.label(),
            reason,
        })
    }

    /// Pause between jobs, reporting progress once a second. Returns false
    /// when cancelled.
    async fn wait_interval(
        &self,
        interval: Duration,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= interval {
                return true;
            }
            self.events.emit(BenchmarkEvent::Interval {
                elapsed,
                total: interval,
            });
            let step = (interval - elapsed).min(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = cancelled(cancel_rx) => return false,
            }
        }
    }

    /// Move to `Running`, unless a cancel got there first.
    fn enter_job(&self, job_index: usize) -> bool {
        let state = RunState::Running { job_index };
        {
            let mut current = lock(&self.state);
            if *current == RunState::Stopping {
                return false;
            }
            *current = state.clone();
        }
        self.events.emit(BenchmarkEvent::StateChanged { state });
        true
    }

    fn set_state(&self, state: RunState) {
        *lock(&self.state) = state.clone();
        self.events.emit(BenchmarkEvent::StateChanged { state });
    }
}

/// Resolves once cancellation is requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancel| *cancel).await.is_err();
    if closed {
        // Sender gone: nobody can cancel any more.
        std::future::pending::<()>().await;
    }
}

/// fio ran to its own exit rather than being killed by a signal.
fn exited_normally(status: Option<std::process::ExitStatus>) -> bool {
    status.is_some_and(|s| s.code().is_some())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
