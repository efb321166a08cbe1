//! Isolated job orchestrator.
//!
//! Each run gets its own evaluation built from its own config snapshot; the
//! only object runs share is the read-only candle cache. Runs execute on the
//! tokio runtime in cooperative batches, at most `max_active_runs` at a time,
//! and every lifecycle step is persisted through the [`JobStore`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CandleCache;
use crate::engine::content_hash;
use crate::error::JobError;
use crate::events::JobEvent;
use crate::job::{
    JobConfig, JobOutput, JobPhase, JobProgress, JobRecord, JobStatus, JobSummary, RunId,
    StatusResponse,
};
use crate::logging::{InMemoryRunLogWriter, RunLogEventKind};
use crate::metrics::BatchLatencyMetrics;
use crate::pipeline::{build_evaluation, load_candles, Evaluation, StepBudget};
use crate::replay::{trades_to_csv, TradeJournalWriter};
use crate::store::JobStore;
use crate::wallclock::TimeSource;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_combinations: usize,
    pub max_active_runs: usize,
    pub heartbeat_interval: Duration,
    pub execution_timeout: Option<Duration>,
    pub expiration: Duration,
    pub resume_interrupted: bool,
    pub budget: StepBudget,
    pub journal_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_combinations: 1_000,
            max_active_runs: 1,
            heartbeat_interval: Duration::from_secs(1),
            execution_timeout: Some(Duration::from_secs(30 * 60)),
            expiration: Duration::from_secs(24 * 60 * 60),
            resume_interrupted: true,
            budget: StepBudget::default(),
            journal_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub failed: usize,
}

/// Live state of a run that has not reached a terminal status yet.
struct RunHandle {
    abort: AtomicBool,
    wake: Notify,
    record: Mutex<JobRecord>,
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    cache: Arc<CandleCache>,
    clock: Arc<dyn TimeSource>,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<RunId, Arc<RunHandle>>>,
    events: broadcast::Sender<JobEvent>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        cache: Arc<CandleCache>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_active_runs.max(1))),
                config,
                store,
                cache,
                clock,
                active: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_runs(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Validates synchronously, persists a QUEUED record and schedules the run.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, config: JobConfig) -> Result<RunId, JobError> {
        config.validate(self.inner.config.max_combinations)?;
        let candles = load_candles(&self.inner.cache, &config.backtest)?;

        let run_id = Uuid::new_v4().to_string();
        let evaluation = build_evaluation(&run_id, &config, candles)?;
        let record = JobRecord::queued(run_id.clone(), config, self.inner.clock.now_ms());
        self.inner.store.insert(&record)?;

        info!(run_id = %run_id, kind = record.kind.as_str(), "run queued");
        self.schedule(record, evaluation);
        Ok(run_id)
    }

    fn schedule(&self, record: JobRecord, evaluation: Box<dyn Evaluation>) {
        let run_id = record.run_id.clone();
        self.emit_status(&record);
        let handle = Arc::new(RunHandle {
            abort: AtomicBool::new(false),
            wake: Notify::new(),
            record: Mutex::new(record),
        });
        self.inner
            .active
            .lock()
            .insert(run_id.clone(), Arc::clone(&handle));

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.execute(run_id, handle, evaluation).await;
        });
    }

    pub fn status(&self, run_id: &str) -> StatusResponse {
        if let Some(handle) = self.handle(run_id) {
            return StatusResponse::from_record(&handle.record.lock(), false);
        }
        match self.stored(run_id) {
            Some(record) => StatusResponse::from_record(&record, false),
            None => StatusResponse::missing(run_id),
        }
    }

    pub fn result(&self, run_id: &str) -> StatusResponse {
        if let Some(handle) = self.handle(run_id) {
            return StatusResponse::from_record(&handle.record.lock(), true);
        }
        match self.stored(run_id) {
            Some(record) => StatusResponse::from_record(&record, true),
            None => StatusResponse::missing(run_id),
        }
    }

    /// Trade journal of a completed run; `None` when there is no result.
    pub fn trades_csv(&self, run_id: &str) -> Result<Option<String>, JobError> {
        let record = match self.handle(run_id) {
            Some(handle) => Some(handle.record.lock().clone()),
            None => self.stored(run_id),
        };
        let Some(output) = record.and_then(|record| record.result) else {
            return Ok(None);
        };
        trades_to_csv(&output.trades())
            .map(Some)
            .map_err(|err| JobError::ExecutionFailed(format!("trade journal: {err}")))
    }

    /// Requests cooperative cancellation. Repeating it, or aborting a run that
    /// already finished, only reports the current status.
    pub fn abort(&self, run_id: &str) -> StatusResponse {
        if let Some(handle) = self.handle(run_id) {
            if !handle.abort.swap(true, Ordering::SeqCst) {
                info!(run_id = %run_id, "abort requested");
                handle.wake.notify_one();
            }
        }
        self.status(run_id)
    }

    /// Most recent runs, newest first, with live progress for executing ones.
    pub fn recent(&self, limit: usize) -> Vec<JobSummary> {
        let records = match self.inner.store.most_recent(limit) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "listing runs failed");
                return Vec::new();
            }
        };
        records
            .iter()
            .map(|record| match self.handle(&record.run_id) {
                Some(handle) => JobSummary::from(&*handle.record.lock()),
                None => JobSummary::from(record),
            })
            .collect()
    }

    /// Re-schedules runs a previous process left QUEUED or RUNNING, or marks
    /// them FAILED when resuming is disabled.
    pub fn recover(&self) -> Result<RecoveryReport, JobError> {
        let now = self.inner.clock.now_ms();
        let stale_after = duration_ms(self.inner.config.heartbeat_interval).saturating_mul(3);
        let mut report = RecoveryReport::default();

        for mut record in self.inner.store.unfinished()? {
            if self.handle(&record.run_id).is_some() {
                continue;
            }
            let last_seen = record.heartbeat_at_ms.unwrap_or(record.created_at_ms);
            if now.saturating_sub(last_seen) > stale_after {
                warn!(
                    run_id = %record.run_id,
                    status = record.status.as_str(),
                    silent_ms = now.saturating_sub(last_seen),
                    "found interrupted run"
                );
            }

            if !self.inner.config.resume_interrupted {
                let interrupted = JobError::ExecutionFailed("interrupted by restart".to_string());
                self.fail_unscheduled(record, &interrupted, now)?;
                report.failed += 1;
                continue;
            }

            let rebuilt = load_candles(&self.inner.cache, &record.config.backtest)
                .and_then(|candles| build_evaluation(&record.run_id, &record.config, candles));
            match rebuilt {
                Ok(evaluation) => {
                    record.requeue(now);
                    self.inner.store.update(&record)?;
                    info!(run_id = %record.run_id, "resuming interrupted run");
                    self.schedule(record, evaluation);
                    report.resumed += 1;
                }
                Err(err) => {
                    self.fail_unscheduled(record, &err, now)?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn fail_unscheduled(&self, mut record: JobRecord, err: &JobError, now: i64) -> Result<(), JobError> {
        warn!(run_id = %record.run_id, error = %err, "marking interrupted run failed");
        if record.fail(err, now) {
            self.inner.store.update(&record)?;
            self.emit_status(&record);
        }
        Ok(())
    }

    /// Deletes terminal runs that finished more than `expiration` before `now_ms`.
    pub fn sweep_expired(&self, now_ms: i64) -> Result<usize, JobError> {
        let cutoff = now_ms.saturating_sub(duration_ms(self.inner.config.expiration));
        let mut removed = 0;
        for run_id in self.inner.store.expired(cutoff)? {
            if self.inner.store.delete(&run_id)? {
                self.inner.active.lock().remove(&run_id);
                let _ = self.inner.events.send(JobEvent::Removed { run_id: run_id.clone() });
                debug!(run_id = %run_id, "expired run removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired runs swept");
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let now = orchestrator.inner.clock.now_ms();
                if let Err(err) = orchestrator.sweep_expired(now) {
                    warn!(error = %err, "expiry sweep failed");
                }
            }
        })
    }

    fn handle(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.inner.active.lock().get(run_id).cloned()
    }

    fn stored(&self, run_id: &str) -> Option<JobRecord> {
        match self.inner.store.get(run_id) {
            Ok(record) => record,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "reading run record failed");
                None
            }
        }
    }

    fn emit_status(&self, record: &JobRecord) {
        let _ = self.inner.events.send(JobEvent::StatusChanged {
            run_id: record.run_id.clone(),
            kind: record.kind,
            status: record.status,
            at_ms: record.heartbeat_at_ms.unwrap_or(record.created_at_ms),
            error: record.error.clone(),
        });
    }

    /// Writes the handle's record through to the store.
    fn persist(&self, handle: &RunHandle) -> JobRecord {
        let record = handle.record.lock().clone();
        match self.inner.store.update(&record) {
            Ok(true) => {}
            Ok(false) => debug!(run_id = %record.run_id, revision = record.revision, "stale write dropped"),
            Err(err) => warn!(run_id = %record.run_id, error = %err, "persisting run record failed"),
        }
        record
    }

    fn transition(&self, handle: &RunHandle, next: JobStatus) -> bool {
        let now = self.inner.clock.now_ms();
        if !handle.record.lock().transition(next, now) {
            return false;
        }
        let record = self.persist(handle);
        self.emit_status(&record);
        true
    }

    fn fail(&self, handle: &RunHandle, err: &JobError) {
        let now = self.inner.clock.now_ms();
        if !handle.record.lock().fail(err, now) {
            return;
        }
        let record = self.persist(handle);
        match err {
            JobError::ExecutionAborted => info!(run_id = %record.run_id, "run aborted"),
            _ => error!(run_id = %record.run_id, code = err.code().as_str(), error = %err, "run failed"),
        }
        self.emit_status(&record);
    }

    fn heartbeat(&self, handle: &RunHandle, evaluation: &dyn Evaluation, started_ms: i64) {
        let now = self.inner.clock.now_ms();
        let fraction = evaluation.progress().clamp(0.0, 1.0);
        let elapsed = now.saturating_sub(started_ms).max(0) as f64;
        let eta = (fraction > 0.0).then(|| (elapsed / fraction * (1.0 - fraction)).round() as u64);
        let progress = JobProgress {
            percent_complete: fraction * 100.0,
            phase: evaluation.phase(),
            message: evaluation.message(),
            estimated_time_remaining_ms: eta,
        };

        handle.record.lock().heartbeat(progress, now);
        let record = self.persist(handle);
        let _ = self.inner.events.send(JobEvent::Progress {
            run_id: record.run_id,
            progress: record.progress,
        });
    }

    async fn execute(self, run_id: RunId, handle: Arc<RunHandle>, evaluation: Box<dyn Evaluation>) {
        let permit = if handle.abort.load(Ordering::SeqCst) {
            None
        } else {
            tokio::select! {
                permit = Arc::clone(&self.inner.permits).acquire_owned() => Some(permit),
                _ = handle.wake.notified() => None,
            }
        };

        match permit {
            None => self.fail(&handle, &JobError::ExecutionAborted),
            Some(Err(_)) => self.fail(&handle, &JobError::ExecutionFailed("scheduler closed".to_string())),
            Some(Ok(_permit)) => {
                if handle.abort.load(Ordering::SeqCst) {
                    self.fail(&handle, &JobError::ExecutionAborted);
                } else if self.transition(&handle, JobStatus::Running) {
                    info!(run_id = %run_id, "run started");
                    match self.drive(&handle, evaluation).await {
                        Ok(output) => self.complete(&handle, output),
                        Err(err) => self.fail(&handle, &err),
                    }
                }
            }
        }

        self.inner.active.lock().remove(&run_id);
    }

    async fn drive(&self, handle: &RunHandle, mut evaluation: Box<dyn Evaluation>) -> Result<JobOutput, JobError> {
        let config = &self.inner.config;
        let started = self.inner.clock.now_ms();
        let heartbeat_ms = duration_ms(config.heartbeat_interval);
        let mut last_heartbeat = started;
        let mut latency = BatchLatencyMetrics::new();

        while !evaluation.is_finished() {
            if handle.abort.load(Ordering::SeqCst) {
                return Err(JobError::ExecutionAborted);
            }
            let now = self.inner.clock.now_ms();
            if let Some(limit) = config.execution_timeout {
                if now.saturating_sub(started) > duration_ms(limit) {
                    return Err(JobError::ExecutionTimeout {
                        limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }

            let batch_started = Instant::now();
            evaluation.step(config.budget)?;
            latency.record_latency_micros(u64::try_from(batch_started.elapsed().as_micros()).unwrap_or(u64::MAX));

            if now.saturating_sub(last_heartbeat) >= heartbeat_ms {
                self.heartbeat(handle, evaluation.as_ref(), started);
                last_heartbeat = now;
            }
            tokio::task::yield_now().await;
        }

        if let Some(report) = latency.percentiles() {
            debug!(
                batches = report.count,
                p50_micros = report.p50_micros,
                p95_micros = report.p95_micros,
                max_micros = report.max_micros,
                "batch latency"
            );
        }
        {
            let mut record = handle.record.lock();
            record.progress.phase = JobPhase::Finalizing;
            record.progress.message = "computing statistics".to_string();
        }
        evaluation.finish()
    }

    fn complete(&self, handle: &RunHandle, output: JobOutput) {
        let sealed = seal(output);
        let (output, hash) = match sealed {
            Ok(sealed) => sealed,
            Err(err) => return self.fail(handle, &err),
        };
        let trades = output.trades();
        let run_id = {
            let mut record = handle.record.lock();
            record.progress = JobProgress {
                percent_complete: 100.0,
                phase: JobPhase::Done,
                message: format!("{} trades", trades.len()),
                estimated_time_remaining_ms: None,
            };
            record.result = Some(output);
            record.result_hash = Some(hash.clone());
            record.run_id.clone()
        };

        if self.transition(handle, JobStatus::Completed) {
            info!(run_id = %run_id, result_hash = %hash, "run completed");
            if let Some(dir) = &self.inner.config.journal_dir {
                self.write_journal(dir, &run_id, &trades);
            }
        }
    }

    fn write_journal(&self, dir: &Path, run_id: &str, trades: &[core_sim::Trade]) {
        let path = dir.join(format!("{run_id}.csv"));
        let mut run_log = InMemoryRunLogWriter::new();
        let written = fs::create_dir_all(dir)
            .and_then(|_| File::create(&path))
            .and_then(|file| {
                TradeJournalWriter::new(BufWriter::new(file)).write_journal_and_log(
                    trades,
                    self.inner.clock.now_ms(),
                    &mut run_log,
                )
            });
        match written {
            Ok(()) => debug!(
                run_id = %run_id,
                path = %path.display(),
                logged = run_log.count(RunLogEventKind::JournalWritten),
                "trade journal written"
            ),
            Err(err) => warn!(run_id = %run_id, path = %path.display(), error = %err, "trade journal write failed"),
        }
    }
}

/// Pushes the output through its JSON form: anything that does not survive
/// the trip (a non-finite number where a value is required) fails the run.
/// The hash covers exactly the bytes clients will see.
fn seal(output: JobOutput) -> Result<(JobOutput, String), JobError> {
    let value = serde_json::to_value(&output)
        .map_err(|err| JobError::ExecutionFailed(format!("serializing result: {err}")))?;
    let hash = content_hash(&value)?;
    let sealed: JobOutput =
        serde_json::from_value(value).map_err(|err| JobError::MetricsInvalid(format!("result: {err}")))?;
    Ok((sealed, hash))
}
