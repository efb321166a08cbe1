use serde::{Deserialize, Serialize};
use thiserror::Error;

use core_sim::{ClockError, LedgerError, MonteCarloError, RngError};
use strategy::{RiskError, StrategyError};

use crate::loader::LoadError;
use crate::store::StoreError;

/// Closed set of failure codes exposed through the job status contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigInvalid,
    DataNotFound,
    DataInsufficient,
    TooManyCombinations,
    ExecutionFailed,
    ExecutionTimeout,
    ExecutionAborted,
    IsolationViolation,
    MetricsInvalid,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::DataNotFound => "DATA_NOT_FOUND",
            Self::DataInsufficient => "DATA_INSUFFICIENT",
            Self::TooManyCombinations => "TOO_MANY_COMBINATIONS",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::ExecutionAborted => "EXECUTION_ABORTED",
            Self::IsolationViolation => "ISOLATION_VIOLATION",
            Self::MetricsInvalid => "METRICS_INVALID",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job config: {0}")]
    ConfigInvalid(String),
    #[error("no candle data for {symbol} at {timeframe}")]
    DataNotFound { symbol: String, timeframe: String },
    #[error("{symbol} has {available} candles, {required} required")]
    DataInsufficient {
        symbol: String,
        available: usize,
        required: usize,
    },
    #[error("{requested} parameter combinations exceed the limit of {limit}")]
    TooManyCombinations { requested: usize, limit: usize },
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("execution exceeded {limit_ms} ms")]
    ExecutionTimeout { limit_ms: u64 },
    #[error("run was aborted")]
    ExecutionAborted,
    #[error("isolation violated: {0}")]
    IsolationViolation(String),
    #[error("statistic {0} is not finite")]
    MetricsInvalid(String),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigInvalid(_) => ErrorCode::ConfigInvalid,
            Self::DataNotFound { .. } => ErrorCode::DataNotFound,
            Self::DataInsufficient { .. } => ErrorCode::DataInsufficient,
            Self::TooManyCombinations { .. } => ErrorCode::TooManyCombinations,
            Self::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            Self::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            Self::ExecutionAborted => ErrorCode::ExecutionAborted,
            Self::IsolationViolation(_) => ErrorCode::IsolationViolation,
            Self::MetricsInvalid(_) => ErrorCode::MetricsInvalid,
        }
    }
}

impl From<RngError> for JobError {
    fn from(err: RngError) -> Self {
        Self::ExecutionFailed(err.to_string())
    }
}

impl From<LedgerError> for JobError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidConfig(_) => Self::ConfigInvalid(err.to_string()),
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<ClockError> for JobError {
    fn from(err: ClockError) -> Self {
        Self::ExecutionFailed(err.to_string())
    }
}

impl From<MonteCarloError> for JobError {
    fn from(err: MonteCarloError) -> Self {
        match err {
            MonteCarloError::NonFiniteStatistic(name) => Self::MetricsInvalid(name.to_string()),
            MonteCarloError::EmptyTrades | MonteCarloError::NonFiniteTrade(_) => {
                Self::ExecutionFailed(err.to_string())
            }
            MonteCarloError::Rng(inner) => inner.into(),
            other => Self::ConfigInvalid(other.to_string()),
        }
    }
}

impl From<RiskError> for JobError {
    fn from(err: RiskError) -> Self {
        match err {
            RiskError::IsolationViolation { .. } => Self::IsolationViolation(err.to_string()),
            RiskError::InvalidConfig(_) => Self::ConfigInvalid(err.to_string()),
            RiskError::InvalidIntent(_) => Self::ExecutionFailed(err.to_string()),
        }
    }
}

impl From<StrategyError> for JobError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::InvalidPositionSize | StrategyError::InvalidEquity => {
                Self::ExecutionFailed(err.to_string())
            }
            other => Self::ConfigInvalid(other.to_string()),
        }
    }
}

impl From<LoadError> for JobError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound { symbol, timeframe } => Self::DataNotFound {
                symbol,
                timeframe: timeframe.as_str().to_string(),
            },
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::ExecutionFailed(format!("job store: {err}"))
    }
}
