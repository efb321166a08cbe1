use serde::{Deserialize, Serialize};
use thiserror::Error;

use core_sim::stats::mean;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum StrategyError {
    #[error("reference price must be finite and positive")]
    NonPositivePrice,
    #[error("signal threshold must be finite and non-negative")]
    InvalidThreshold,
    #[error("fast period {fast} must be positive and shorter than slow period {slow}")]
    InvalidPeriods { fast: usize, slow: usize },
    #[error("{0} must be a finite fraction in (0, 1)")]
    InvalidFraction(&'static str),
    #[error("max holding bars must be positive")]
    InvalidHoldingBars,
    #[error("equity must be finite and positive")]
    InvalidEquity,
    #[error("computed position size is not finite and positive")]
    InvalidPositionSize,
    #[error("regime detector config is invalid: {0}")]
    InvalidRegimeConfig(&'static str),
}

/// Axes of a parameter search; one value per backtest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_threshold: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_holding_bars: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 30,
            signal_threshold: 0.001,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            max_holding_bars: 100,
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.fast_period == 0 || self.fast_period >= self.slow_period {
            return Err(StrategyError::InvalidPeriods {
                fast: self.fast_period,
                slow: self.slow_period,
            });
        }
        if !self.signal_threshold.is_finite() || self.signal_threshold < 0.0 {
            return Err(StrategyError::InvalidThreshold);
        }
        if !is_fraction(self.stop_loss_pct) {
            return Err(StrategyError::InvalidFraction("stop_loss_pct"));
        }
        if !is_fraction(self.take_profit_pct) {
            return Err(StrategyError::InvalidFraction("take_profit_pct"));
        }
        if self.max_holding_bars == 0 {
            return Err(StrategyError::InvalidHoldingBars);
        }
        Ok(())
    }
}

pub(crate) fn is_fraction(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value < 1.0
}

pub fn divergence(fast_ma: f64, slow_ma: f64) -> f64 {
    fast_ma - slow_ma
}

pub fn normalized_divergence(fast_ma: f64, slow_ma: f64) -> Result<f64, StrategyError> {
    if !slow_ma.is_finite() || slow_ma <= 0.0 || !fast_ma.is_finite() {
        return Err(StrategyError::NonPositivePrice);
    }
    Ok(divergence(fast_ma, slow_ma) / slow_ma)
}

pub fn signal_from_divergence(normalized: f64, threshold: f64) -> Result<Signal, StrategyError> {
    if !threshold.is_finite() {
        return Err(StrategyError::InvalidThreshold);
    }
    let threshold = threshold.abs();

    Ok(if normalized > threshold {
        Signal::Buy
    } else if normalized < -threshold {
        Signal::Sell
    } else {
        Signal::Hold
    })
}

/// Holds on any input that cannot produce a signal.
pub fn emit_signal(fast_ma: f64, slow_ma: f64, threshold: f64) -> Signal {
    normalized_divergence(fast_ma, slow_ma)
        .and_then(|normalized| signal_from_divergence(normalized, threshold))
        .unwrap_or(Signal::Hold)
}

/// Mean of the trailing `period` values.
pub fn simple_moving_average(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    mean(&values[values.len() - period..])
}

/// Signal from released closes only; `Hold` until the slow window fills.
pub fn signal_for_history(closes: &[f64], params: &StrategyParams) -> Signal {
    match (
        simple_moving_average(closes, params.fast_period),
        simple_moving_average(closes, params.slow_period),
    ) {
        (Some(fast), Some(slow)) => emit_signal(fast, slow, params.signal_threshold),
        _ => Signal::Hold,
    }
}
