//! Per-run backtest pipeline.
//!
//! An engine owns every mutable component of one evaluation: clock, ledger,
//! correlation analyzer, regime detector, risk governor and generator. Nothing
//! is shared with other engines except the read-only candle slices it copies
//! from at construction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use core_sim::{
    Candle, CorrelationAnalyzer, CorrelationConfig, Direction, EquityPoint, GlobalClock, Ledger,
    LedgerConfig, PositionId, RngAlgorithm, RngState, SeededRng, Tick, Trade,
};
use strategy::{
    signal_for_history, size_for_intent, OrderIntent, Regime, RegimeDetector, RegimeDetectorConfig,
    RegimePeriod, RiskGovernor, RiskGovernorConfig, Signal, StrategyParams,
};

use crate::error::JobError;
use crate::loader::Timeframe;
use crate::logging::{InMemoryRunLogWriter, RunLogEvent, RunLogEventKind, RunLogWriter};
use crate::metrics::PerformanceMetrics;

/// Read-only candle series keyed by symbol.
pub type CandleSet = BTreeMap<String, Arc<[Candle]>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Upper bound of the adverse fill offset, drawn uniformly per fill.
    pub slippage_bps: f64,
    pub seed: i64,
    pub algorithm: RngAlgorithm,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 0.0,
            seed: 42,
            algorithm: RngAlgorithm::Mulberry32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BacktestSpec {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub strategy: StrategyParams,
    pub ledger: LedgerConfig,
    pub risk: RiskGovernorConfig,
    pub regime: RegimeDetectorConfig,
    pub correlation: CorrelationConfig,
    pub execution: ExecutionConfig,
}

impl Default for BacktestSpec {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timeframe: Timeframe::default(),
            start: None,
            end: None,
            strategy: StrategyParams::default(),
            ledger: LedgerConfig::default(),
            risk: RiskGovernorConfig::default(),
            regime: RegimeDetectorConfig::default(),
            correlation: CorrelationConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl BacktestSpec {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.symbols.is_empty() {
            return Err(JobError::ConfigInvalid("at least one symbol is required".to_string()));
        }
        let unique: BTreeSet<&String> = self.symbols.iter().collect();
        if unique.len() != self.symbols.len() || self.symbols.iter().any(String::is_empty) {
            return Err(JobError::ConfigInvalid("symbols must be unique and non-empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(JobError::ConfigInvalid(format!("start {start} is after end {end}")));
            }
        }
        if !self.ledger.is_valid() {
            return Err(JobError::ConfigInvalid("ledger config is invalid".to_string()));
        }
        if !self.correlation.is_valid() {
            return Err(JobError::ConfigInvalid("correlation config is invalid".to_string()));
        }
        if !self.execution.slippage_bps.is_finite() || self.execution.slippage_bps < 0.0 {
            return Err(JobError::ConfigInvalid("slippage must be finite and non-negative".to_string()));
        }
        self.strategy.validate()?;
        self.risk.validate()?;
        self.regime.validate()?;
        Ok(())
    }

    /// Bars each symbol needs before a signal or regime label can exist.
    pub fn min_bars(&self) -> usize {
        (self.strategy.slow_period + 1).max(self.regime.lookback_period + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub ticks: usize,
    pub progress: f64,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub bars: usize,
    pub params: StrategyParams,
    pub metrics: PerformanceMetrics,
    pub orders_accepted: usize,
    pub orders_blocked: usize,
    pub blocked_by: BTreeMap<String, usize>,
    pub regime_periods: BTreeMap<String, Vec<RegimePeriod>>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub decision_hash: String,
    pub rng_state: RngState,
}

#[derive(Debug, Default)]
struct SymbolState {
    last_signal: Option<Signal>,
    bars_held: BTreeMap<PositionId, usize>,
}

pub struct BacktestEngine {
    spec: BacktestSpec,
    clock: GlobalClock,
    ledger: Ledger,
    governor: RiskGovernor,
    correlation: CorrelationAnalyzer,
    detector: RegimeDetector,
    rng: SeededRng,
    decisions: InMemoryRunLogWriter,
    symbols: BTreeMap<String, SymbolState>,
    blocked_by: BTreeMap<String, usize>,
    last_timestamp: Option<i64>,
}

impl BacktestEngine {
    pub fn new(run_id: &str, spec: &BacktestSpec, candles: &CandleSet) -> Result<Self, JobError> {
        spec.validate()?;

        let mut clock = GlobalClock::new();
        let mut symbols = BTreeMap::new();
        for symbol in &spec.symbols {
            let series = candles.get(symbol).ok_or_else(|| JobError::DataNotFound {
                symbol: symbol.clone(),
                timeframe: spec.timeframe.as_str().to_string(),
            })?;
            clock.register(symbol.clone(), series.to_vec())?;
            symbols.insert(symbol.clone(), SymbolState::default());
        }

        Ok(Self {
            clock,
            ledger: Ledger::new(run_id, spec.ledger)?,
            governor: RiskGovernor::new(run_id, spec.risk.clone())?,
            correlation: CorrelationAnalyzer::new(spec.correlation),
            detector: RegimeDetector::new(spec.regime)?,
            rng: SeededRng::new(spec.execution.seed, spec.execution.algorithm),
            decisions: InMemoryRunLogWriter::new(),
            symbols,
            blocked_by: BTreeMap::new(),
            last_timestamp: None,
            spec: spec.clone(),
        })
    }

    pub fn progress(&self) -> f64 {
        self.clock.get_progress()
    }

    pub fn is_finished(&self) -> bool {
        self.clock.is_finished()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn decisions(&self) -> &[RunLogEvent] {
        self.decisions.events()
    }

    /// Advances at most `max_ticks` timestamps on the shared clock.
    pub fn step(&mut self, max_ticks: usize) -> Result<StepOutcome, JobError> {
        let mut ticks = 0;
        while ticks < max_ticks {
            let Some(tick) = self.clock.next_tick() else {
                break;
            };
            self.process_tick(&tick)?;
            ticks += 1;
        }

        Ok(StepOutcome {
            ticks,
            progress: self.clock.get_progress(),
            finished: self.clock.is_finished(),
        })
    }

    pub fn finish(mut self) -> Result<BacktestReport, JobError> {
        while !self.clock.is_finished() {
            self.step(usize::MAX)?;
        }

        if let Some(timestamp) = self.last_timestamp {
            for trade in self.ledger.close_all(timestamp)? {
                self.decisions.write(RunLogEvent::new(
                    timestamp,
                    RunLogEventKind::PositionClosed,
                    Some(&trade.symbol),
                    format!("{} end_of_data net {:.6}", trade.id, trade.net_profit()),
                ));
            }
            self.ledger.record_equity(timestamp);
        }

        let metrics = PerformanceMetrics::compute(
            self.spec.ledger.initial_balance,
            self.ledger.equity_curve(),
            self.ledger.closed_trades(),
            self.spec.timeframe.periods_per_year(),
        )?;

        let regime_periods = self
            .spec
            .symbols
            .iter()
            .map(|symbol| {
                let periods = self.detector.detect_periods(self.clock.history(symbol));
                (symbol.clone(), periods)
            })
            .collect();

        let decision_hash = content_hash(self.decisions.events())?;
        Ok(BacktestReport {
            symbols: self.spec.symbols.clone(),
            timeframe: self.spec.timeframe,
            bars: self.clock.total_bars(),
            params: self.spec.strategy,
            metrics,
            orders_accepted: self.decisions.count(RunLogEventKind::OrderAccepted),
            orders_blocked: self.decisions.count(RunLogEventKind::OrderBlocked),
            blocked_by: self.blocked_by,
            regime_periods,
            equity_curve: self.ledger.equity_curve().to_vec(),
            rng_state: self.rng.state(),
            decision_hash,
            trades: self.ledger.into_trades(),
        })
    }

    fn process_tick(&mut self, tick: &Tick) -> Result<(), JobError> {
        for event in &tick.events {
            self.ledger
                .update_symbol_price(&event.symbol, event.candle.close)?;
            if event.index > 0 {
                let previous = self.clock.history(&event.symbol)[event.index - 1].close;
                self.correlation
                    .add_return(&event.symbol, event.candle.close / previous - 1.0);
            }
        }
        if self.spec.symbols.len() > 1 {
            self.correlation.calculate_matrix(tick.timestamp);
        }

        for event in &tick.events {
            self.evaluate_symbol(&event.symbol, &event.candle, tick.timestamp)?;
        }

        self.ledger.record_equity(tick.timestamp);
        self.last_timestamp = Some(tick.timestamp);
        Ok(())
    }

    fn evaluate_symbol(&mut self, symbol: &str, candle: &Candle, timestamp: i64) -> Result<(), JobError> {
        let params = self.spec.strategy;
        let history = self.clock.history(symbol);
        let window_start = history.len().saturating_sub(params.slow_period);
        let closes: Vec<f64> = history[window_start..].iter().map(|bar| bar.close).collect();
        let signal = signal_for_history(&closes, &params);
        let regime = history
            .len()
            .checked_sub(1)
            .and_then(|last| self.detector.classify_at(history, last))
            .map(|sample| sample.regime);

        self.apply_exits(symbol, candle, signal, timestamp)?;

        let state = self.symbols.entry(symbol.to_string()).or_default();
        let crossed = signal != Signal::Hold && state.last_signal != Some(signal);
        state.last_signal = Some(signal);
        if crossed {
            self.try_enter(symbol, candle, signal, regime, timestamp)?;
        }
        Ok(())
    }

    fn apply_exits(&mut self, symbol: &str, candle: &Candle, signal: Signal, timestamp: i64) -> Result<(), JobError> {
        let params = self.spec.strategy;
        let open: Vec<(PositionId, Direction, f64)> = self
            .ledger
            .get_positions_by_symbol(symbol)
            .into_iter()
            .map(|position| (position.id, position.direction, position.entry_price))
            .collect();

        for (id, direction, entry_price) in open {
            let state = self.symbols.entry(symbol.to_string()).or_default();
            let bars = state.bars_held.entry(id).or_insert(0);
            *bars += 1;
            let bars = *bars;

            let move_pct = (candle.close / entry_price - 1.0) * direction.sign();
            let reversed = matches!(
                (direction, signal),
                (Direction::Long, Signal::Sell) | (Direction::Short, Signal::Buy)
            );
            let reason = if move_pct <= -params.stop_loss_pct {
                "stop_loss"
            } else if move_pct >= params.take_profit_pct {
                "take_profit"
            } else if bars >= params.max_holding_bars {
                "max_holding"
            } else if reversed {
                "signal_reversal"
            } else {
                continue;
            };

            let exit_side = match direction {
                Direction::Long => Direction::Short,
                Direction::Short => Direction::Long,
            };
            let price = self.fill_price(candle.close, exit_side);
            let trade = self.ledger.close_position(id, price, timestamp)?;
            if let Some(state) = self.symbols.get_mut(symbol) {
                state.bars_held.remove(&id);
            }
            self.decisions.write(RunLogEvent::new(
                timestamp,
                RunLogEventKind::PositionClosed,
                Some(symbol),
                format!("{id} {reason} net {:.6}", trade.net_profit()),
            ));
        }
        Ok(())
    }

    fn try_enter(
        &mut self,
        symbol: &str,
        candle: &Candle,
        signal: Signal,
        regime: Option<Regime>,
        timestamp: i64,
    ) -> Result<(), JobError> {
        let direction = match signal {
            Signal::Buy => Direction::Long,
            Signal::Sell => Direction::Short,
            Signal::Hold => return Ok(()),
        };
        let equity = self.ledger.get_equity();
        if !equity.is_finite() || equity <= 0.0 {
            self.record_block(symbol, timestamp, "equity exhausted", "EQUITY");
            return Ok(());
        }

        let price = self.fill_price(candle.close, direction);
        let size = size_for_intent(equity, price, self.spec.risk.max_risk_per_trade, regime)?;
        let intent = OrderIntent {
            symbol: symbol.to_string(),
            direction,
            price,
            size,
        };

        let decision = self
            .governor
            .validate_order(&self.ledger, &self.correlation, &intent, timestamp)?;
        if !decision.allowed {
            let limit = decision.violated.map_or("UNKNOWN", limit_key);
            self.record_block(symbol, timestamp, &decision.reason, limit);
            return Ok(());
        }

        let position = self
            .ledger
            .open_position(symbol, direction, price, size, timestamp)?;
        self.symbols
            .entry(symbol.to_string())
            .or_default()
            .bars_held
            .insert(position.id, 0);
        self.decisions.write(RunLogEvent::new(
            timestamp,
            RunLogEventKind::OrderAccepted,
            Some(symbol),
            format!(
                "{} {} {:.8} @ {:.8} regime {} risk {:.6}",
                position.id,
                direction.as_str(),
                size,
                price,
                regime.map_or("NONE", Regime::as_str),
                decision.risk_score
            ),
        ));
        Ok(())
    }

    fn record_block(&mut self, symbol: &str, timestamp: i64, reason: &str, limit: &str) {
        *self.blocked_by.entry(limit.to_string()).or_insert(0) += 1;
        self.decisions.write(RunLogEvent::new(
            timestamp,
            RunLogEventKind::OrderBlocked,
            Some(symbol),
            reason,
        ));
    }

    /// Adverse offset: buys fill above the reference, sells below.
    fn fill_price(&mut self, reference: f64, side: Direction) -> f64 {
        let offset = self.spec.execution.slippage_bps / 10_000.0 * self.rng.random();
        reference * (1.0 + offset * side.sign())
    }
}

fn limit_key(limit: strategy::RiskLimit) -> &'static str {
    match limit {
        strategy::RiskLimit::MaxTotalPositions => "MAX_TOTAL_POSITIONS",
        strategy::RiskLimit::MaxPositionsPerSymbol => "MAX_POSITIONS_PER_SYMBOL",
        strategy::RiskLimit::MaxTotalExposure => "MAX_TOTAL_EXPOSURE",
        strategy::RiskLimit::MaxDailyDrawdown => "MAX_DAILY_DRAWDOWN",
        strategy::RiskLimit::MaxCorrelatedExposure => "MAX_CORRELATED_EXPOSURE",
    }
}

/// SHA-256 hex digest of a value's JSON encoding.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, JobError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| JobError::ExecutionFailed(format!("hashing: {err}")))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
