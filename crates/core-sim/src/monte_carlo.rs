//! Trade-sequence resampling for strategy validation.
//!
//! A simulator is built once per run from its config; every draw comes from a
//! single [`SeededRng`] seeded by `config.seed`, so identical inputs replay to an
//! identical report. Work proceeds in caller-sized batches through
//! [`MonteCarloSimulator::step`] so that a scheduler can interleave other work
//! and observe abort requests between batches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::candle::Trade;
use crate::rng::{RngAlgorithm, RngError, SeededRng};
use crate::stats::{mean, percentile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResamplingMethod {
    /// Contiguous blocks, preserving local autocorrelation.
    #[default]
    BlockBootstrap,
    /// Independent draws with replacement.
    TradeResampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonteCarloConfig {
    pub simulations: u32,
    pub method: ResamplingMethod,
    pub confidence_level: f64,
    pub initial_balance: f64,
    pub ruin_threshold: f64,
    pub block_size: usize,
    pub seed: i64,
    pub algorithm: RngAlgorithm,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            simulations: 1_000,
            method: ResamplingMethod::BlockBootstrap,
            confidence_level: 0.95,
            initial_balance: 100_000.0,
            ruin_threshold: 50_000.0,
            block_size: 5,
            seed: 42,
            algorithm: RngAlgorithm::Mulberry32,
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<(), MonteCarloError> {
        if self.simulations == 0 {
            return Err(MonteCarloError::NoSimulations);
        }
        if !self.confidence_level.is_finite()
            || self.confidence_level <= 0.0
            || self.confidence_level >= 1.0
        {
            return Err(MonteCarloError::InvalidConfidence(self.confidence_level));
        }
        if !self.initial_balance.is_finite() || self.initial_balance <= 0.0 {
            return Err(MonteCarloError::InvalidBalance);
        }
        if !self.ruin_threshold.is_finite() {
            return Err(MonteCarloError::InvalidBalance);
        }
        if self.method == ResamplingMethod::BlockBootstrap && self.block_size == 0 {
            return Err(MonteCarloError::InvalidBlockSize);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MonteCarloError {
    #[error("simulations must be greater than zero")]
    NoSimulations,
    #[error("trade list is empty")]
    EmptyTrades,
    #[error("confidence level must lie in (0, 1), got {0}")]
    InvalidConfidence(f64),
    #[error("block size must be greater than zero")]
    InvalidBlockSize,
    #[error("initial balance and ruin threshold must be finite and the balance positive")]
    InvalidBalance,
    #[error("trade {0} carries a non-finite profit")]
    NonFiniteTrade(usize),
    #[error("statistic {0} is not finite")]
    NonFiniteStatistic(&'static str),
    #[error(transparent)]
    Rng(#[from] RngError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBand {
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloReport {
    pub simulations: u32,
    pub method: ResamplingMethod,
    pub confidence_level: f64,
    pub trade_count: usize,
    pub terminal_equity: PercentileBand,
    pub max_drawdown: PercentileBand,
    pub ruin_probability: f64,
    pub probability_of_profit: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
    pub distribution_hash: String,
    pub seed: i64,
    pub algorithm: RngAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PathOutcome {
    terminal_equity: f64,
    max_drawdown: f64,
    ruined: bool,
}

#[derive(Debug, Clone)]
pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
    net_profits: Vec<f64>,
    rng: SeededRng,
    outcomes: Vec<PathOutcome>,
}

impl MonteCarloSimulator {
    /// Validates everything up front; nothing is sampled on error.
    pub fn new(config: MonteCarloConfig, trades: &[Trade]) -> Result<Self, MonteCarloError> {
        config.validate()?;
        if trades.is_empty() {
            return Err(MonteCarloError::EmptyTrades);
        }
        let net_profits: Vec<f64> = trades.iter().map(Trade::net_profit).collect();
        if let Some(index) = net_profits.iter().position(|profit| !profit.is_finite()) {
            return Err(MonteCarloError::NonFiniteTrade(index));
        }

        Ok(Self {
            rng: SeededRng::new(config.seed, config.algorithm),
            config,
            net_profits,
            outcomes: Vec::with_capacity(config.simulations as usize),
        })
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    pub fn completed(&self) -> u32 {
        self.outcomes.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.completed() >= self.config.simulations
    }

    pub fn progress(&self) -> f64 {
        f64::from(self.completed()) / f64::from(self.config.simulations)
    }

    /// Runs up to `batch` more iterations and returns how many ran.
    pub fn step(&mut self, batch: u32) -> Result<u32, MonteCarloError> {
        let todo = batch.min(self.config.simulations - self.completed());
        for _ in 0..todo {
            let sequence = self.resample()?;
            let outcome = self.replay(&sequence);
            self.outcomes.push(outcome);
        }
        if todo > 0 {
            debug!(
                completed = self.completed(),
                total = self.config.simulations,
                "monte carlo batch finished"
            );
        }
        Ok(todo)
    }

    pub fn run(mut self) -> Result<MonteCarloReport, MonteCarloError> {
        while !self.is_complete() {
            self.step(self.config.simulations)?;
        }
        self.finish()
    }

    pub fn finish(&self) -> Result<MonteCarloReport, MonteCarloError> {
        if self.outcomes.is_empty() {
            return Err(MonteCarloError::NoSimulations);
        }

        let terminal: Vec<f64> = self.outcomes.iter().map(|path| path.terminal_equity).collect();
        let drawdowns: Vec<f64> = self.outcomes.iter().map(|path| path.max_drawdown).collect();
        let total = self.outcomes.len() as f64;
        let ruined = self.outcomes.iter().filter(|path| path.ruined).count() as f64;
        let profitable = terminal
            .iter()
            .filter(|equity| **equity > self.config.initial_balance)
            .count() as f64;

        let tail = (1.0 - self.config.confidence_level) / 2.0;
        let terminal_band = band(&terminal, tail, "terminal_equity")?;
        let drawdown_band = band(&drawdowns, tail, "max_drawdown")?;

        let mut returns: Vec<f64> = terminal
            .iter()
            .map(|equity| equity / self.config.initial_balance - 1.0)
            .collect();
        returns.sort_by(f64::total_cmp);
        let cutoff = percentile(&returns, 1.0 - self.config.confidence_level)
            .ok_or(MonteCarloError::NonFiniteStatistic("value_at_risk"))?;
        let tail_returns: Vec<f64> = returns.iter().copied().filter(|r| *r <= cutoff).collect();
        let tail_mean = mean(&tail_returns).unwrap_or(cutoff);

        let report = MonteCarloReport {
            simulations: self.completed(),
            method: self.config.method,
            confidence_level: self.config.confidence_level,
            trade_count: self.net_profits.len(),
            terminal_equity: terminal_band,
            max_drawdown: drawdown_band,
            ruin_probability: ruined / total,
            probability_of_profit: profitable / total,
            value_at_risk: -cutoff,
            conditional_value_at_risk: -tail_mean,
            distribution_hash: distribution_hash(&terminal),
            seed: self.config.seed,
            algorithm: self.config.algorithm,
        };
        ensure_finite(report.value_at_risk, "value_at_risk")?;
        ensure_finite(report.conditional_value_at_risk, "conditional_value_at_risk")?;
        Ok(report)
    }

    fn resample(&mut self) -> Result<Vec<f64>, MonteCarloError> {
        let n = self.net_profits.len();
        let indices = match self.config.method {
            ResamplingMethod::TradeResampling => {
                let mut indices = Vec::with_capacity(n);
                for _ in 0..n {
                    indices.push(self.rng.random_int(0, n as i64 - 1)? as usize);
                }
                indices
            }
            ResamplingMethod::BlockBootstrap => {
                let block = self.config.block_size.min(n);
                let blocks = n.div_ceil(block);
                let mut indices = self.rng.block_bootstrap_indices(n, block, blocks)?;
                indices.truncate(n);
                indices
            }
        };
        Ok(indices.into_iter().map(|i| self.net_profits[i]).collect())
    }

    fn replay(&self, sequence: &[f64]) -> PathOutcome {
        let mut equity = self.config.initial_balance;
        let mut peak = equity;
        let mut max_drawdown = 0.0_f64;
        let mut ruined = equity < self.config.ruin_threshold;

        for profit in sequence {
            equity += profit;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - equity) / peak);
            }
            ruined |= equity < self.config.ruin_threshold;
        }

        PathOutcome {
            terminal_equity: equity,
            max_drawdown,
            ruined,
        }
    }
}

fn band(values: &[f64], tail: f64, name: &'static str) -> Result<PercentileBand, MonteCarloError> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let missing = MonteCarloError::NonFiniteStatistic(name);

    let band = PercentileBand {
        lower: percentile(&sorted, tail).ok_or_else(|| missing.clone())?,
        median: percentile(&sorted, 0.5).ok_or_else(|| missing.clone())?,
        upper: percentile(&sorted, 1.0 - tail).ok_or_else(|| missing.clone())?,
        mean: mean(&sorted).ok_or(missing)?,
    };
    for value in [band.lower, band.median, band.upper, band.mean] {
        ensure_finite(value, name)?;
    }
    Ok(band)
}

fn ensure_finite(value: f64, name: &'static str) -> Result<(), MonteCarloError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MonteCarloError::NonFiniteStatistic(name))
    }
}

/// SHA-256 over the terminal equities' bit patterns, in iteration order.
fn distribution_hash(terminal: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for equity in terminal {
        hasher.update(equity.to_bits().to_be_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{MonteCarloConfig, MonteCarloError, MonteCarloSimulator, ResamplingMethod};
    use crate::candle::{Direction, PositionId, Trade};
    use crate::rng::RngAlgorithm;

    fn trades() -> Vec<Trade> {
        [120.0, -80.0, 45.0, -30.0, 200.0, -150.0, 60.0, 10.0, -40.0, 90.0]
            .iter()
            .enumerate()
            .map(|(i, profit)| Trade {
                id: PositionId(i as u64 + 1),
                symbol: "BTCUSDT".to_string(),
                direction: Direction::Long,
                entry_price: 100.0,
                exit_price: 100.0 + profit,
                size: 1.0,
                open_timestamp: i as i64 * 60_000,
                close_timestamp: i as i64 * 60_000 + 30_000,
                profit: *profit,
                commission: 1.0,
            })
            .collect()
    }

    fn config(seed: i64, method: ResamplingMethod) -> MonteCarloConfig {
        MonteCarloConfig {
            simulations: 300,
            method,
            confidence_level: 0.9,
            initial_balance: 1_000.0,
            ruin_threshold: 800.0,
            block_size: 3,
            seed,
            algorithm: RngAlgorithm::Mulberry32,
        }
    }

    #[test]
    fn identical_inputs_reproduce_identical_reports() {
        for method in [ResamplingMethod::BlockBootstrap, ResamplingMethod::TradeResampling] {
            let reports: Vec<_> = (0..3)
                .map(|_| {
                    MonteCarloSimulator::new(config(7, method), &trades())
                        .unwrap()
                        .run()
                        .unwrap()
                })
                .collect();

            assert_eq!(reports[0], reports[1]);
            assert_eq!(reports[1], reports[2]);
        }
    }

    #[test]
    fn different_seeds_change_the_distribution_hash() {
        let first = MonteCarloSimulator::new(config(111, ResamplingMethod::TradeResampling), &trades())
            .unwrap()
            .run()
            .unwrap();
        let second = MonteCarloSimulator::new(config(222, ResamplingMethod::TradeResampling), &trades())
            .unwrap()
            .run()
            .unwrap();

        assert_ne!(first.distribution_hash, second.distribution_hash);
    }

    #[test]
    fn batched_stepping_matches_single_run() {
        let whole = MonteCarloSimulator::new(config(5, ResamplingMethod::BlockBootstrap), &trades())
            .unwrap()
            .run()
            .unwrap();

        let mut stepped =
            MonteCarloSimulator::new(config(5, ResamplingMethod::BlockBootstrap), &trades()).unwrap();
        while !stepped.is_complete() {
            assert!(stepped.step(7).unwrap() > 0);
        }

        assert_eq!(stepped.finish().unwrap(), whole);
        assert_eq!(stepped.step(10).unwrap(), 0);
    }

    #[test]
    fn bands_are_ordered_and_probabilities_bounded() {
        let report = MonteCarloSimulator::new(config(9, ResamplingMethod::BlockBootstrap), &trades())
            .unwrap()
            .run()
            .unwrap();

        assert!(report.terminal_equity.lower <= report.terminal_equity.median);
        assert!(report.terminal_equity.median <= report.terminal_equity.upper);
        assert!(report.max_drawdown.lower >= 0.0);
        assert!((0.0..=1.0).contains(&report.ruin_probability));
        assert!((0.0..=1.0).contains(&report.probability_of_profit));
        assert_eq!(report.trade_count, 10);
        assert_eq!(report.simulations, 300);
    }

    #[test]
    fn ruin_is_certain_when_threshold_exceeds_balance() {
        let mut cfg = config(1, ResamplingMethod::TradeResampling);
        cfg.ruin_threshold = 10_000.0;

        let report = MonteCarloSimulator::new(cfg, &trades()).unwrap().run().unwrap();

        assert_eq!(report.ruin_probability, 1.0);
    }

    #[test]
    fn oversized_blocks_are_clamped_to_trade_count() {
        let mut cfg = config(3, ResamplingMethod::BlockBootstrap);
        cfg.block_size = 50;

        let report = MonteCarloSimulator::new(cfg, &trades()).unwrap().run().unwrap();

        // A single block covering every trade replays the original order.
        let net: f64 = trades().iter().map(Trade::net_profit).sum();
        assert_eq!(report.terminal_equity.median, 1_000.0 + net);
    }

    #[test]
    fn rejects_invalid_input_before_sampling() {
        let mut cfg = config(1, ResamplingMethod::TradeResampling);
        assert_eq!(
            MonteCarloSimulator::new(cfg, &[]).unwrap_err(),
            MonteCarloError::EmptyTrades
        );

        cfg.simulations = 0;
        assert_eq!(
            MonteCarloSimulator::new(cfg, &trades()).unwrap_err(),
            MonteCarloError::NoSimulations
        );

        let mut cfg = config(1, ResamplingMethod::BlockBootstrap);
        cfg.block_size = 0;
        assert_eq!(
            MonteCarloSimulator::new(cfg, &trades()).unwrap_err(),
            MonteCarloError::InvalidBlockSize
        );

        let mut cfg = config(1, ResamplingMethod::BlockBootstrap);
        cfg.confidence_level = 1.0;
        assert_eq!(
            MonteCarloSimulator::new(cfg, &trades()).unwrap_err(),
            MonteCarloError::InvalidConfidence(1.0)
        );
    }
}
