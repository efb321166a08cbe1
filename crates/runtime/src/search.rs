//! Parameter grid search and walk-forward validation on top of the engine.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use core_sim::{Candle, Trade};
use strategy::StrategyParams;

use crate::engine::{BacktestEngine, BacktestReport, BacktestSpec, CandleSet};
use crate::error::JobError;
use crate::metrics::PerformanceMetrics;

/// Candidate values per strategy parameter. An empty axis keeps the base value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParameterGrid {
    pub fast_period: Vec<usize>,
    pub slow_period: Vec<usize>,
    pub signal_threshold: Vec<f64>,
    pub stop_loss_pct: Vec<f64>,
    pub take_profit_pct: Vec<f64>,
    pub max_holding_bars: Vec<usize>,
}

impl ParameterGrid {
    /// Size of the cartesian product, invalid combinations included.
    pub fn count(&self) -> usize {
        [
            self.fast_period.len(),
            self.slow_period.len(),
            self.signal_threshold.len(),
            self.stop_loss_pct.len(),
            self.take_profit_pct.len(),
            self.max_holding_bars.len(),
        ]
        .into_iter()
        .fold(1usize, |total, len| total.saturating_mul(len.max(1)))
    }

    /// Valid combinations in a fixed order: the last axis varies fastest.
    pub fn combinations(&self, base: &StrategyParams) -> Vec<StrategyParams> {
        let fast = axis(&self.fast_period, base.fast_period);
        let slow = axis(&self.slow_period, base.slow_period);
        let threshold = axis(&self.signal_threshold, base.signal_threshold);
        let stop = axis(&self.stop_loss_pct, base.stop_loss_pct);
        let take = axis(&self.take_profit_pct, base.take_profit_pct);
        let holding = axis(&self.max_holding_bars, base.max_holding_bars);

        let mut out = Vec::new();
        for &fast_period in &fast {
            for &slow_period in &slow {
                for &signal_threshold in &threshold {
                    for &stop_loss_pct in &stop {
                        for &take_profit_pct in &take {
                            for &max_holding_bars in &holding {
                                let params = StrategyParams {
                                    fast_period,
                                    slow_period,
                                    signal_threshold,
                                    stop_loss_pct,
                                    take_profit_pct,
                                    max_holding_bars,
                                };
                                if params.validate().is_ok() {
                                    out.push(params);
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

fn axis<T: Copy>(values: &[T], base: T) -> Vec<T> {
    if values.is_empty() {
        vec![base]
    } else {
        values.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Objective {
    #[default]
    TotalReturn,
    Sharpe,
    ProfitFactor,
}

impl Objective {
    pub fn score(self, metrics: &PerformanceMetrics) -> Option<f64> {
        match self {
            Self::TotalReturn => Some(metrics.total_return),
            Self::Sharpe => metrics.sharpe_ratio,
            Self::ProfitFactor => metrics.profit_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridEntry {
    pub index: usize,
    pub params: StrategyParams,
    pub score: Option<f64>,
    pub metrics: PerformanceMetrics,
    pub orders_accepted: usize,
    pub orders_blocked: usize,
    pub decision_hash: String,
}

/// Higher score first, missing scores last, then lower combination index.
pub fn rank_order(a: &GridEntry, b: &GridEntry) -> Ordering {
    let by_score = match (a.score, b.score) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then(a.index.cmp(&b.index))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSearchReport {
    pub objective: Objective,
    pub combinations: usize,
    pub skipped: usize,
    pub ranking: Vec<GridEntry>,
    pub best_trades: Vec<Trade>,
}

impl GridSearchReport {
    pub fn best(&self) -> Option<&GridEntry> {
        self.ranking.first()
    }
}

/// Runs one fresh engine per combination, a batch of ticks at a time.
pub struct GridSearch {
    run_id: String,
    spec: BacktestSpec,
    candles: CandleSet,
    objective: Objective,
    combinations: Vec<StrategyParams>,
    skipped: usize,
    cursor: usize,
    current: Option<BacktestEngine>,
    entries: Vec<GridEntry>,
    best: Option<(GridEntry, Vec<Trade>)>,
}

impl GridSearch {
    pub fn new(
        run_id: &str,
        spec: &BacktestSpec,
        grid: &ParameterGrid,
        objective: Objective,
        candles: CandleSet,
    ) -> Result<Self, JobError> {
        let combinations = grid.combinations(&spec.strategy);
        if combinations.is_empty() {
            return Err(JobError::ConfigInvalid(
                "parameter grid has no valid combination".to_string(),
            ));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            spec: spec.clone(),
            candles,
            objective,
            skipped: grid.count() - combinations.len(),
            combinations,
            cursor: 0,
            current: None,
            entries: Vec::new(),
            best: None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.combinations.len()
    }

    pub fn progress(&self) -> f64 {
        let partial = self.current.as_ref().map_or(0.0, BacktestEngine::progress);
        ((self.cursor as f64 + partial) / self.combinations.len() as f64).min(1.0)
    }

    pub fn completed(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.combinations.len()
    }

    pub fn step(&mut self, max_ticks: usize) -> Result<(), JobError> {
        if self.is_finished() {
            return Ok(());
        }
        if self.current.is_none() {
            let mut spec = self.spec.clone();
            spec.strategy = self.combinations[self.cursor];
            let context = format!("{}/grid-{}", self.run_id, self.cursor);
            self.current = Some(BacktestEngine::new(&context, &spec, &self.candles)?);
        }
        let Some(engine) = self.current.as_mut() else {
            return Ok(());
        };

        if !engine.step(max_ticks)?.finished {
            return Ok(());
        }
        if let Some(engine) = self.current.take() {
            self.record(engine.finish()?);
        }
        Ok(())
    }

    fn record(&mut self, report: BacktestReport) {
        let entry = GridEntry {
            index: self.cursor,
            params: report.params,
            score: self.objective.score(&report.metrics),
            metrics: report.metrics,
            orders_accepted: report.orders_accepted,
            orders_blocked: report.orders_blocked,
            decision_hash: report.decision_hash,
        };
        debug!(run_id = %self.run_id, index = entry.index, score = ?entry.score, "grid combination finished");

        let replaces_best = self
            .best
            .as_ref()
            .map_or(true, |(best, _)| rank_order(&entry, best) == Ordering::Less);
        if replaces_best {
            self.best = Some((entry.clone(), report.trades));
        }
        self.entries.push(entry);
        self.cursor += 1;
    }

    pub fn finish(mut self) -> Result<GridSearchReport, JobError> {
        while !self.is_finished() {
            self.step(usize::MAX)?;
        }
        let mut ranking = self.entries;
        ranking.sort_by(rank_order);
        Ok(GridSearchReport {
            objective: self.objective,
            combinations: self.combinations.len(),
            skipped: self.skipped,
            ranking,
            best_trades: self.best.map(|(_, trades)| trades).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WalkForwardConfig {
    pub folds: usize,
    pub in_sample_ratio: f64,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            folds: 3,
            in_sample_ratio: 0.7,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.folds == 0 {
            return Err(JobError::ConfigInvalid("walk-forward needs at least one fold".to_string()));
        }
        if !(self.in_sample_ratio > 0.0 && self.in_sample_ratio < 1.0) {
            return Err(JobError::ConfigInvalid(format!(
                "in-sample ratio must lie in (0, 1), got {}",
                self.in_sample_ratio
            )));
        }
        Ok(())
    }
}

/// Inclusive timestamp bounds of one fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldWindow {
    pub index: usize,
    pub in_sample_start: i64,
    pub in_sample_end: i64,
    pub out_of_sample_start: i64,
    pub out_of_sample_end: i64,
}

/// Splits the merged timeline into `folds` equal consecutive segments, each
/// cut into an in-sample head and an out-of-sample tail.
pub fn split_folds(candles: &CandleSet, config: &WalkForwardConfig) -> Result<Vec<FoldWindow>, JobError> {
    config.validate()?;
    let timeline: Vec<i64> = candles
        .values()
        .flat_map(|series| series.iter().map(|candle| candle.timestamp))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let segment = timeline.len() / config.folds;
    if segment < 2 {
        return Err(JobError::DataInsufficient {
            symbol: candles.keys().cloned().collect::<Vec<_>>().join(","),
            available: timeline.len(),
            required: config.folds * 2,
        });
    }

    let windows = (0..config.folds)
        .map(|index| {
            let start = index * segment;
            let end = if index + 1 == config.folds {
                timeline.len()
            } else {
                start + segment
            };
            let slice = &timeline[start..end];
            let cut = ((slice.len() as f64 * config.in_sample_ratio) as usize).clamp(1, slice.len() - 1);
            FoldWindow {
                index,
                in_sample_start: slice[0],
                in_sample_end: slice[cut - 1],
                out_of_sample_start: slice[cut],
                out_of_sample_end: slice[slice.len() - 1],
            }
        })
        .collect();
    Ok(windows)
}

/// Per-symbol copies restricted to `[start, end]`.
pub fn window(candles: &CandleSet, start: i64, end: i64) -> CandleSet {
    candles
        .iter()
        .map(|(symbol, series)| {
            let slice: Arc<[Candle]> = series
                .iter()
                .filter(|candle| candle.timestamp >= start && candle.timestamp <= end)
                .copied()
                .collect();
            (symbol.clone(), slice)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldReport {
    pub window: FoldWindow,
    pub best_params: StrategyParams,
    pub in_sample_score: Option<f64>,
    pub in_sample: PerformanceMetrics,
    pub out_of_sample: PerformanceMetrics,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardReport {
    pub objective: Objective,
    pub config: WalkForwardConfig,
    pub folds: Vec<FoldReport>,
    pub mean_out_of_sample_return: Option<f64>,
    pub profitable_folds: usize,
    pub total_out_of_sample_trades: usize,
}

enum FoldStage {
    InSample(GridSearch),
    OutOfSample {
        best: GridEntry,
        engine: BacktestEngine,
    },
}

pub struct WalkForward {
    run_id: String,
    spec: BacktestSpec,
    grid: ParameterGrid,
    objective: Objective,
    config: WalkForwardConfig,
    candles: CandleSet,
    windows: Vec<FoldWindow>,
    fold: usize,
    stage: Option<FoldStage>,
    reports: Vec<FoldReport>,
}

impl WalkForward {
    pub fn new(
        run_id: &str,
        spec: &BacktestSpec,
        grid: &ParameterGrid,
        objective: Objective,
        config: WalkForwardConfig,
        candles: CandleSet,
    ) -> Result<Self, JobError> {
        let windows = split_folds(&candles, &config)?;
        let required = spec.min_bars();
        for fold in &windows {
            for (symbol, series) in &candles {
                let bars_in = |start: i64, end: i64| {
                    series
                        .iter()
                        .filter(|candle| candle.timestamp >= start && candle.timestamp <= end)
                        .count()
                };
                let available = bars_in(fold.in_sample_start, fold.in_sample_end)
                    .min(bars_in(fold.out_of_sample_start, fold.out_of_sample_end));
                if available < required {
                    return Err(JobError::DataInsufficient {
                        symbol: symbol.clone(),
                        available,
                        required,
                    });
                }
            }
        }

        Ok(Self {
            run_id: run_id.to_string(),
            spec: spec.clone(),
            grid: grid.clone(),
            objective,
            config,
            candles,
            windows,
            fold: 0,
            stage: None,
            reports: Vec::new(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.fold >= self.windows.len()
    }

    pub fn in_sample(&self) -> bool {
        !matches!(self.stage, Some(FoldStage::OutOfSample { .. }))
    }

    pub fn current_fold(&self) -> usize {
        self.fold
    }

    pub fn total_folds(&self) -> usize {
        self.windows.len()
    }

    pub fn progress(&self) -> f64 {
        let ratio = self.config.in_sample_ratio;
        let within = match &self.stage {
            None => 0.0,
            Some(FoldStage::InSample(search)) => search.progress() * ratio,
            Some(FoldStage::OutOfSample { engine, .. }) => ratio + engine.progress() * (1.0 - ratio),
        };
        ((self.fold as f64 + within) / self.windows.len() as f64).min(1.0)
    }

    pub fn step(&mut self, max_ticks: usize) -> Result<(), JobError> {
        let Some(fold) = self.windows.get(self.fold).copied() else {
            return Ok(());
        };

        self.stage = match self.stage.take() {
            None => {
                let in_sample = window(&self.candles, fold.in_sample_start, fold.in_sample_end);
                let context = format!("{}/fold-{}", self.run_id, fold.index);
                Some(FoldStage::InSample(GridSearch::new(
                    &context,
                    &self.spec,
                    &self.grid,
                    self.objective,
                    in_sample,
                )?))
            }
            Some(FoldStage::InSample(mut search)) => {
                search.step(max_ticks)?;
                if !search.is_finished() {
                    Some(FoldStage::InSample(search))
                } else {
                    let report = search.finish()?;
                    let best = report.ranking.into_iter().next().ok_or_else(|| {
                        JobError::ExecutionFailed(format!("fold {} produced no ranking", fold.index))
                    })?;
                    let mut spec = self.spec.clone();
                    spec.strategy = best.params;
                    let out_of_sample =
                        window(&self.candles, fold.out_of_sample_start, fold.out_of_sample_end);
                    let context = format!("{}/fold-{}/oos", self.run_id, fold.index);
                    let engine = BacktestEngine::new(&context, &spec, &out_of_sample)?;
                    Some(FoldStage::OutOfSample { best, engine })
                }
            }
            Some(FoldStage::OutOfSample { best, mut engine }) => {
                if !engine.step(max_ticks)?.finished {
                    Some(FoldStage::OutOfSample { best, engine })
                } else {
                    let report = engine.finish()?;
                    debug!(
                        run_id = %self.run_id,
                        fold = fold.index,
                        total_return = report.metrics.total_return,
                        "walk-forward fold finished"
                    );
                    self.reports.push(FoldReport {
                        window: fold,
                        best_params: best.params,
                        in_sample_score: best.score,
                        in_sample: best.metrics,
                        out_of_sample: report.metrics,
                        trades: report.trades,
                    });
                    self.fold += 1;
                    None
                }
            }
        };
        Ok(())
    }

    pub fn finish(mut self) -> Result<WalkForwardReport, JobError> {
        while !self.is_finished() {
            self.step(usize::MAX)?;
        }
        let returns: Vec<f64> = self
            .reports
            .iter()
            .map(|fold| fold.out_of_sample.total_return)
            .collect();
        Ok(WalkForwardReport {
            objective: self.objective,
            config: self.config,
            mean_out_of_sample_return: core_sim::stats::mean(&returns).and_then(crate::metrics::finite),
            profitable_folds: returns.iter().filter(|r| **r > 0.0).count(),
            total_out_of_sample_trades: self.reports.iter().map(|fold| fold.trades.len()).sum(),
            folds: self.reports,
        })
    }
}
