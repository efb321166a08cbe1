use serde::{Deserialize, Serialize};

use core_sim::stats::{max_drawdown, mean, std_dev};
use core_sim::{EquityPoint, Trade};

use crate::error::JobError;

/// `None` for NaN and infinities so the value serializes as `null`.
pub fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Headline statistics fail the run instead of being nulled.
pub fn require_finite(name: &str, value: f64) -> Result<f64, JobError> {
    finite(value).ok_or_else(|| JobError::MetricsInvalid(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub initial_balance: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: Option<f64>,
    pub profit_factor: Option<f64>,
    pub win_rate: Option<f64>,
    pub average_trade: Option<f64>,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_commission: f64,
}

impl PerformanceMetrics {
    pub fn compute(
        initial_balance: f64,
        equity_curve: &[EquityPoint],
        trades: &[Trade],
        periods_per_year: f64,
    ) -> Result<Self, JobError> {
        let final_equity = equity_curve
            .last()
            .map_or(initial_balance, |point| point.equity);
        let net: Vec<f64> = trades.iter().map(Trade::net_profit).collect();
        let gross_win: f64 = net.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = -net.iter().filter(|p| **p < 0.0).sum::<f64>();
        let winning_trades = net.iter().filter(|p| **p > 0.0).count();
        let losing_trades = net.iter().filter(|p| **p < 0.0).count();

        let returns: Vec<f64> = equity_curve
            .windows(2)
            .filter(|pair| pair[0].equity > 0.0)
            .map(|pair| pair[1].equity / pair[0].equity - 1.0)
            .collect();
        let sharpe = match (mean(&returns), std_dev(&returns)) {
            (Some(avg), Some(sd)) if sd > 0.0 => finite(avg / sd * periods_per_year.sqrt()),
            _ => None,
        };

        let equity = std::iter::once(initial_balance).chain(equity_curve.iter().map(|point| point.equity));

        Ok(Self {
            initial_balance,
            final_equity: require_finite("final_equity", final_equity)?,
            total_return: require_finite("total_return", final_equity / initial_balance - 1.0)?,
            max_drawdown: require_finite("max_drawdown", max_drawdown(equity))?,
            sharpe_ratio: sharpe,
            profit_factor: if gross_loss > 0.0 {
                finite(gross_win / gross_loss)
            } else {
                None
            },
            win_rate: if trades.is_empty() {
                None
            } else {
                finite(winning_trades as f64 / trades.len() as f64)
            },
            average_trade: mean(&net).and_then(finite),
            trade_count: trades.len(),
            winning_trades,
            losing_trades,
            total_commission: require_finite(
                "total_commission",
                trades.iter().map(|trade| trade.commission).sum(),
            )?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyPercentiles {
    pub count: usize,
    pub p50_micros: u64,
    pub p95_micros: u64,
    pub max_micros: u64,
}

/// Wall-clock cost of each scheduling batch; logged, never part of a result.
#[derive(Debug, Default, Clone)]
pub struct BatchLatencyMetrics {
    latencies_micros: Vec<u64>,
}

impl BatchLatencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency_micros(&mut self, latency_micros: u64) {
        self.latencies_micros.push(latency_micros);
    }

    pub fn percentiles(&self) -> Option<LatencyPercentiles> {
        if self.latencies_micros.is_empty() {
            return None;
        }

        let mut sorted = self.latencies_micros.clone();
        sorted.sort_unstable();
        let count = sorted.len();

        Some(LatencyPercentiles {
            count,
            p50_micros: percentile_nearest_rank(&sorted, 50),
            p95_micros: percentile_nearest_rank(&sorted, 95),
            max_micros: sorted[count - 1],
        })
    }
}

fn percentile_nearest_rank(sorted: &[u64], percentile: usize) -> u64 {
    let count = sorted.len();
    let rank = (percentile * count).div_ceil(100);
    sorted[rank.saturating_sub(1)]
}
