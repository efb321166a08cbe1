//! Job records and the status contract served to clients.

use serde::{Deserialize, Serialize};

use core_sim::{MonteCarloConfig, MonteCarloReport, Trade};

use crate::engine::{BacktestReport, BacktestSpec};
use crate::error::{ErrorCode, JobError};
use crate::search::{GridSearchReport, Objective, ParameterGrid, WalkForwardConfig, WalkForwardReport};

pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    #[default]
    Backtest,
    GridSearch,
    WalkForward,
    MonteCarlo,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backtest => "BACKTEST",
            Self::GridSearch => "GRID_SEARCH",
            Self::WalkForward => "WALK_FORWARD",
            Self::MonteCarlo => "MONTE_CARLO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Failed | Self::Aborted),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Aborted),
            Self::Completed | Self::Failed | Self::Aborted => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    #[default]
    Queued,
    Backtesting,
    Optimizing,
    InSample,
    OutOfSample,
    Simulating,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percent_complete: f64,
    pub phase: JobPhase,
    pub message: String,
    #[serde(rename = "estimatedTimeRemaining")]
    pub estimated_time_remaining_ms: Option<u64>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            percent_complete: 0.0,
            phase: JobPhase::Queued,
            message: "waiting for an execution slot".to_string(),
            estimated_time_remaining_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&JobError> for JobFailure {
    fn from(error: &JobError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Everything needed to re-execute a run from scratch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobConfig {
    pub kind: JobKind,
    pub backtest: BacktestSpec,
    pub grid: ParameterGrid,
    pub objective: Objective,
    pub walk_forward: WalkForwardConfig,
    pub monte_carlo: MonteCarloConfig,
}

impl JobConfig {
    /// Checks that need no candle data.
    pub fn validate(&self, max_combinations: usize) -> Result<(), JobError> {
        self.backtest.validate()?;
        match self.kind {
            JobKind::Backtest => {}
            JobKind::GridSearch | JobKind::WalkForward => {
                let requested = self.grid.count();
                if requested > max_combinations {
                    return Err(JobError::TooManyCombinations {
                        requested,
                        limit: max_combinations,
                    });
                }
                if self.grid.combinations(&self.backtest.strategy).is_empty() {
                    return Err(JobError::ConfigInvalid(
                        "parameter grid has no valid combination".to_string(),
                    ));
                }
                if self.kind == JobKind::WalkForward {
                    self.walk_forward.validate()?;
                }
            }
            JobKind::MonteCarlo => self.monte_carlo.validate()?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutput {
    Backtest(BacktestReport),
    GridSearch(GridSearchReport),
    WalkForward(WalkForwardReport),
    MonteCarlo {
        backtest: BacktestReport,
        simulation: MonteCarloReport,
    },
}

impl JobOutput {
    /// Trades behind the headline result: the backtest itself, the best
    /// combination, or every out-of-sample fold in order.
    pub fn trades(&self) -> Vec<Trade> {
        match self {
            Self::Backtest(report) | Self::MonteCarlo { backtest: report, .. } => report.trades.clone(),
            Self::GridSearch(report) => report.best_trades.clone(),
            Self::WalkForward(report) => report
                .folds
                .iter()
                .flat_map(|fold| fold.trades.iter().cloned())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub run_id: RunId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub result: Option<JobOutput>,
    pub result_hash: Option<String>,
    pub error: Option<JobFailure>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub heartbeat_at_ms: Option<i64>,
    pub revision: u64,
}

impl JobRecord {
    pub fn queued(run_id: RunId, config: JobConfig, now_ms: i64) -> Self {
        Self {
            run_id,
            kind: config.kind,
            status: JobStatus::Queued,
            config,
            progress: JobProgress::default(),
            result: None,
            result_hash: None,
            error: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
            heartbeat_at_ms: None,
            revision: 0,
        }
    }

    /// Applies a lifecycle transition and bumps the revision. Returns `false`
    /// and leaves the record untouched when the transition is not allowed.
    pub fn transition(&mut self, next: JobStatus, now_ms: i64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at_ms = Some(now_ms),
            status if status.is_terminal() => {
                self.finished_at_ms = Some(now_ms);
                self.progress.estimated_time_remaining_ms = None;
            }
            _ => {}
        }
        self.heartbeat_at_ms = Some(now_ms);
        self.revision += 1;
        true
    }

    pub fn fail(&mut self, error: &JobError, now_ms: i64) -> bool {
        let status = match error {
            JobError::ExecutionAborted => JobStatus::Aborted,
            _ => JobStatus::Failed,
        };
        if !self.transition(status, now_ms) {
            return false;
        }
        self.error = Some(JobFailure::from(error));
        true
    }

    /// Resets an interrupted record so it can be executed again from its
    /// config snapshot. Not a lifecycle transition: only recovery uses it.
    pub fn requeue(&mut self, now_ms: i64) {
        self.status = JobStatus::Queued;
        self.progress = JobProgress::default();
        self.result = None;
        self.result_hash = None;
        self.error = None;
        self.started_at_ms = None;
        self.finished_at_ms = None;
        self.heartbeat_at_ms = Some(now_ms);
        self.revision += 1;
    }

    /// Progress never moves backwards; heartbeats only move forward in time.
    pub fn heartbeat(&mut self, progress: JobProgress, now_ms: i64) {
        let percent = progress.percent_complete.max(self.progress.percent_complete);
        self.progress = JobProgress {
            percent_complete: percent,
            ..progress
        };
        self.heartbeat_at_ms = Some(self.heartbeat_at_ms.map_or(now_ms, |last| last.max(now_ms)));
        self.revision += 1;
    }
}

/// Response shape of the status and result reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub run_id: RunId,
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    pub error: Option<JobFailure>,
}

impl StatusResponse {
    pub fn missing(run_id: &str) -> Self {
        Self {
            success: false,
            run_id: run_id.to_string(),
            kind: None,
            status: None,
            progress: None,
            result: None,
            result_hash: None,
            error: None,
        }
    }

    pub fn from_record(record: &JobRecord, with_result: bool) -> Self {
        Self {
            success: record.status != JobStatus::Failed,
            run_id: record.run_id.clone(),
            kind: Some(record.kind),
            status: Some(record.status),
            progress: Some(record.progress.clone()),
            result: if with_result { record.result.clone() } else { None },
            result_hash: record.result_hash.clone(),
            error: record.error.clone(),
        }
    }
}

/// Compact row for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub run_id: RunId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub percent_complete: f64,
    pub created_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub error: Option<JobFailure>,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            kind: record.kind,
            status: record.status,
            percent_complete: record.progress.percent_complete,
            created_at_ms: record.created_at_ms,
            finished_at_ms: record.finished_at_ms,
            error: record.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobConfig, JobKind, JobPhase, JobProgress, JobRecord, JobStatus, StatusResponse};
    use crate::error::{ErrorCode, JobError};

    fn config() -> JobConfig {
        let mut config = JobConfig::default();
        config.backtest.symbols = vec!["BTCUSDT".to_string()];
        config
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Aborted] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Aborted,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Aborted));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Aborted] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("PAUSED"), None);
    }

    #[test]
    fn transitions_bump_revision_and_stamp_times() {
        let mut record = JobRecord::queued("run-1".to_string(), config(), 10);
        assert!(record.transition(JobStatus::Running, 20));
        assert_eq!(record.started_at_ms, Some(20));
        assert_eq!(record.revision, 1);

        assert!(record.fail(&JobError::ExecutionAborted, 30));
        assert_eq!(record.status, JobStatus::Aborted);
        assert_eq!(record.finished_at_ms, Some(30));
        assert_eq!(record.error.as_ref().map(|e| e.code), Some(ErrorCode::ExecutionAborted));

        assert!(!record.transition(JobStatus::Running, 40));
        assert_eq!(record.revision, 2);
    }

    #[test]
    fn heartbeat_keeps_percent_monotonic() {
        let mut record = JobRecord::queued("run-1".to_string(), config(), 0);
        let progress = |percent| JobProgress {
            percent_complete: percent,
            phase: JobPhase::Backtesting,
            message: String::new(),
            estimated_time_remaining_ms: Some(5),
        };

        record.heartbeat(progress(40.0), 100);
        record.heartbeat(progress(25.0), 50);

        assert_eq!(record.progress.percent_complete, 40.0);
        assert_eq!(record.heartbeat_at_ms, Some(100));
    }

    #[test]
    fn status_contract_uses_camel_case_fields() {
        let record = JobRecord::queued("run-9".to_string(), config(), 0);
        let json = serde_json::to_value(StatusResponse::from_record(&record, false)).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["runId"], "run-9");
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["progress"]["percentComplete"], 0.0);
        assert!(json["progress"]["estimatedTimeRemaining"].is_null());
        assert!(json.get("result").is_none());

        let missing = serde_json::to_value(StatusResponse::missing("nope")).unwrap();
        assert_eq!(missing["success"], false);
        assert!(missing["status"].is_null());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: JobConfig = serde_json::from_str(
            r#"{"kind":"GRID_SEARCH","backtest":{"symbols":["BTCUSDT"]},"grid":{"fastPeriod":[5,10]}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, JobKind::GridSearch);
        assert_eq!(config.grid.fast_period, vec![5, 10]);
        assert!(config.validate(100).is_ok());
        assert_eq!(
            config.validate(1).unwrap_err().code(),
            ErrorCode::TooManyCombinations
        );
    }
}
