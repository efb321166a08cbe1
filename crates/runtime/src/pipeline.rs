//! One resumable evaluation per job kind behind a single stepping interface.

use std::sync::Arc;

use core_sim::{Candle, MonteCarloConfig, MonteCarloSimulator};

use crate::cache::CandleCache;
use crate::engine::{BacktestEngine, BacktestReport, BacktestSpec, CandleSet};
use crate::error::JobError;
use crate::job::{JobConfig, JobKind, JobOutput, JobPhase};
use crate::search::{GridSearch, WalkForward};

/// Work allowed per scheduling slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub ticks: usize,
    pub simulations: u32,
}

impl Default for StepBudget {
    fn default() -> Self {
        Self {
            ticks: 500,
            simulations: 50,
        }
    }
}

pub trait Evaluation: Send {
    fn step(&mut self, budget: StepBudget) -> Result<(), JobError>;

    fn is_finished(&self) -> bool;

    /// Fraction of the whole job in `[0, 1]`.
    fn progress(&self) -> f64;

    fn phase(&self) -> JobPhase;

    fn message(&self) -> String;

    fn finish(self: Box<Self>) -> Result<JobOutput, JobError>;
}

/// Loads every requested series through the shared cache and checks that each
/// has enough bars for the strategy to produce a signal.
pub fn load_candles(cache: &CandleCache, spec: &BacktestSpec) -> Result<CandleSet, JobError> {
    let required = spec.min_bars();
    let mut set = CandleSet::new();
    for symbol in &spec.symbols {
        let series: Arc<[Candle]> = if spec.start.is_none() && spec.end.is_none() {
            cache.get(symbol, spec.timeframe)?
        } else {
            cache.range(symbol, spec.timeframe, spec.start, spec.end)?.into()
        };
        if series.len() < required {
            return Err(JobError::DataInsufficient {
                symbol: symbol.clone(),
                available: series.len(),
                required,
            });
        }
        set.insert(symbol.clone(), series);
    }
    Ok(set)
}

pub fn build_evaluation(
    run_id: &str,
    config: &JobConfig,
    candles: CandleSet,
) -> Result<Box<dyn Evaluation>, JobError> {
    let evaluation: Box<dyn Evaluation> = match config.kind {
        JobKind::Backtest => Box::new(BacktestEngine::new(run_id, &config.backtest, &candles)?),
        JobKind::GridSearch => Box::new(GridSearch::new(
            run_id,
            &config.backtest,
            &config.grid,
            config.objective,
            candles,
        )?),
        JobKind::WalkForward => Box::new(WalkForward::new(
            run_id,
            &config.backtest,
            &config.grid,
            config.objective,
            config.walk_forward,
            candles,
        )?),
        JobKind::MonteCarlo => Box::new(MonteCarloRun::new(
            run_id,
            &config.backtest,
            config.monte_carlo,
            &candles,
        )?),
    };
    Ok(evaluation)
}

impl Evaluation for BacktestEngine {
    fn step(&mut self, budget: StepBudget) -> Result<(), JobError> {
        BacktestEngine::step(self, budget.ticks).map(|_| ())
    }

    fn is_finished(&self) -> bool {
        BacktestEngine::is_finished(self)
    }

    fn progress(&self) -> f64 {
        BacktestEngine::progress(self)
    }

    fn phase(&self) -> JobPhase {
        JobPhase::Backtesting
    }

    fn message(&self) -> String {
        format!("replaying bars, {} trades closed", self.ledger().closed_trades().len())
    }

    fn finish(self: Box<Self>) -> Result<JobOutput, JobError> {
        Ok(JobOutput::Backtest(BacktestEngine::finish(*self)?))
    }
}

impl Evaluation for GridSearch {
    fn step(&mut self, budget: StepBudget) -> Result<(), JobError> {
        GridSearch::step(self, budget.ticks)
    }

    fn is_finished(&self) -> bool {
        GridSearch::is_finished(self)
    }

    fn progress(&self) -> f64 {
        GridSearch::progress(self)
    }

    fn phase(&self) -> JobPhase {
        JobPhase::Optimizing
    }

    fn message(&self) -> String {
        format!("combination {} of {}", self.completed().min(self.total()), self.total())
    }

    fn finish(self: Box<Self>) -> Result<JobOutput, JobError> {
        Ok(JobOutput::GridSearch(GridSearch::finish(*self)?))
    }
}

impl Evaluation for WalkForward {
    fn step(&mut self, budget: StepBudget) -> Result<(), JobError> {
        WalkForward::step(self, budget.ticks)
    }

    fn is_finished(&self) -> bool {
        WalkForward::is_finished(self)
    }

    fn progress(&self) -> f64 {
        WalkForward::progress(self)
    }

    fn phase(&self) -> JobPhase {
        if self.in_sample() {
            JobPhase::InSample
        } else {
            JobPhase::OutOfSample
        }
    }

    fn message(&self) -> String {
        let fold = (self.current_fold() + 1).min(self.total_folds());
        format!("fold {fold} of {}", self.total_folds())
    }

    fn finish(self: Box<Self>) -> Result<JobOutput, JobError> {
        Ok(JobOutput::WalkForward(WalkForward::finish(*self)?))
    }
}

enum MonteCarloStage {
    Backtest(BacktestEngine),
    Simulating {
        backtest: BacktestReport,
        simulator: MonteCarloSimulator,
    },
}

/// Backtest first, then resample its closed trades.
pub struct MonteCarloRun {
    config: MonteCarloConfig,
    stage: Option<MonteCarloStage>,
}

impl MonteCarloRun {
    pub fn new(
        run_id: &str,
        spec: &BacktestSpec,
        config: MonteCarloConfig,
        candles: &CandleSet,
    ) -> Result<Self, JobError> {
        config.validate()?;
        Ok(Self {
            config,
            stage: Some(MonteCarloStage::Backtest(BacktestEngine::new(run_id, spec, candles)?)),
        })
    }
}

impl Evaluation for MonteCarloRun {
    fn step(&mut self, budget: StepBudget) -> Result<(), JobError> {
        self.stage = match self.stage.take() {
            Some(MonteCarloStage::Backtest(mut engine)) => {
                if engine.step(budget.ticks)?.finished {
                    let backtest = engine.finish()?;
                    let simulator = MonteCarloSimulator::new(self.config, &backtest.trades)?;
                    Some(MonteCarloStage::Simulating { backtest, simulator })
                } else {
                    Some(MonteCarloStage::Backtest(engine))
                }
            }
            Some(MonteCarloStage::Simulating {
                backtest,
                mut simulator,
            }) => {
                simulator.step(budget.simulations)?;
                Some(MonteCarloStage::Simulating { backtest, simulator })
            }
            None => None,
        };
        Ok(())
    }

    fn is_finished(&self) -> bool {
        match &self.stage {
            Some(MonteCarloStage::Simulating { simulator, .. }) => simulator.is_complete(),
            Some(MonteCarloStage::Backtest(_)) => false,
            None => true,
        }
    }

    fn progress(&self) -> f64 {
        match &self.stage {
            Some(MonteCarloStage::Backtest(engine)) => engine.progress() * 0.5,
            Some(MonteCarloStage::Simulating { simulator, .. }) => 0.5 + simulator.progress() * 0.5,
            None => 1.0,
        }
    }

    fn phase(&self) -> JobPhase {
        match &self.stage {
            Some(MonteCarloStage::Backtest(_)) => JobPhase::Backtesting,
            Some(MonteCarloStage::Simulating { .. }) => JobPhase::Simulating,
            None => JobPhase::Finalizing,
        }
    }

    fn message(&self) -> String {
        match &self.stage {
            Some(MonteCarloStage::Simulating { simulator, .. }) => format!(
                "simulation {} of {}",
                simulator.completed(),
                self.config.simulations
            ),
            _ => "building the trade list".to_string(),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<JobOutput, JobError> {
        while !self.is_finished() {
            self.step(StepBudget {
                ticks: usize::MAX,
                simulations: self.config.simulations,
            })?;
        }
        match self.stage.take() {
            Some(MonteCarloStage::Simulating { backtest, simulator }) => Ok(JobOutput::MonteCarlo {
                simulation: simulator.finish()?,
                backtest,
            }),
            _ => Err(JobError::ExecutionFailed(
                "monte carlo run ended without a simulation".to_string(),
            )),
        }
    }
}
