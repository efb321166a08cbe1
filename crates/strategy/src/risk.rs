use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use core_sim::{utc_day_start, CorrelationAnalyzer, Direction, Ledger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RiskGovernorConfig {
    pub max_total_positions: usize,
    pub max_positions_per_symbol: usize,
    /// Fraction of current equity.
    pub max_total_exposure: f64,
    /// Fraction of the start-of-day balance.
    pub max_daily_drawdown: f64,
    pub max_correlated_exposure: f64,
    pub max_risk_per_trade: f64,
    pub correlation_threshold: f64,
    pub correlation_groups: Vec<Vec<String>>,
}

impl Default for RiskGovernorConfig {
    fn default() -> Self {
        Self {
            max_total_positions: 5,
            max_positions_per_symbol: 1,
            max_total_exposure: 1.0,
            max_daily_drawdown: 0.05,
            max_correlated_exposure: 0.5,
            max_risk_per_trade: 0.1,
            correlation_threshold: 0.7,
            correlation_groups: Vec::new(),
        }
    }
}

impl RiskGovernorConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.max_total_positions == 0 || self.max_positions_per_symbol == 0 {
            return Err(RiskError::InvalidConfig("position limits must be positive"));
        }
        let fractions = [
            self.max_total_exposure,
            self.max_daily_drawdown,
            self.max_correlated_exposure,
            self.max_risk_per_trade,
        ];
        if fractions.iter().any(|value| !value.is_finite() || *value <= 0.0) {
            return Err(RiskError::InvalidConfig("exposure and drawdown limits must be positive"));
        }
        if self.max_risk_per_trade > 1.0 {
            return Err(RiskError::InvalidConfig("max_risk_per_trade must lie in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return Err(RiskError::InvalidConfig("correlation threshold must lie in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub size: f64,
}

impl OrderIntent {
    pub fn notional(&self) -> f64 {
        (self.price * self.size).abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLimit {
    MaxTotalPositions,
    MaxPositionsPerSymbol,
    MaxTotalExposure,
    MaxDailyDrawdown,
    MaxCorrelatedExposure,
}

impl RiskLimit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxTotalPositions => "maxTotalPositions",
            Self::MaxPositionsPerSymbol => "maxPositionsPerSymbol",
            Self::MaxTotalExposure => "maxTotalExposure",
            Self::MaxDailyDrawdown => "maxDailyDrawdown",
            Self::MaxCorrelatedExposure => "maxCorrelatedExposure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
    pub risk_score: f64,
    pub violated: Option<RiskLimit>,
}

impl RiskDecision {
    fn allow(risk_score: f64) -> Self {
        Self {
            allowed: true,
            reason: "all risk limits satisfied".to_string(),
            risk_score,
            violated: None,
        }
    }

    fn block(limit: RiskLimit, detail: String) -> Self {
        Self {
            allowed: false,
            reason: format!("{} exceeded: {detail}", limit.as_str()),
            risk_score: 1.0,
            violated: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("governor for run {governor} was handed the ledger of run {ledger}")]
    IsolationViolation { governor: String, ledger: String },
    #[error("risk config is invalid: {0}")]
    InvalidConfig(&'static str),
    #[error("order intent is invalid: {0}")]
    InvalidIntent(&'static str),
}

/// Admission gate for one run's simulated orders.
///
/// Decisions are a pure function of the ledger, the analyzer's latest matrix
/// and the config, so replaying the same inputs replays the same decisions.
#[derive(Debug, Clone)]
pub struct RiskGovernor {
    run_id: String,
    config: RiskGovernorConfig,
}

impl RiskGovernor {
    pub fn new(run_id: impl Into<String>, config: RiskGovernorConfig) -> Result<Self, RiskError> {
        config.validate()?;
        Ok(Self {
            run_id: run_id.into(),
            config,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RiskGovernorConfig {
        &self.config
    }

    pub fn validate_order(
        &self,
        ledger: &Ledger,
        correlation: &CorrelationAnalyzer,
        intent: &OrderIntent,
        timestamp: i64,
    ) -> Result<RiskDecision, RiskError> {
        if ledger.run_id() != self.run_id {
            return Err(RiskError::IsolationViolation {
                governor: self.run_id.clone(),
                ledger: ledger.run_id().to_string(),
            });
        }
        if intent.symbol.is_empty() {
            return Err(RiskError::InvalidIntent("symbol is empty"));
        }
        if !intent.price.is_finite() || intent.price <= 0.0 {
            return Err(RiskError::InvalidIntent("price must be finite and positive"));
        }
        if !intent.size.is_finite() || intent.size <= 0.0 {
            return Err(RiskError::InvalidIntent("size must be finite and positive"));
        }

        let cfg = &self.config;
        let mut utilisation: f64 = 0.0;

        let total = ledger.open_count() + 1;
        if total > cfg.max_total_positions {
            return Ok(RiskDecision::block(
                RiskLimit::MaxTotalPositions,
                format!("{total} open positions against a limit of {}", cfg.max_total_positions),
            ));
        }
        utilisation = utilisation.max(total as f64 / cfg.max_total_positions as f64);

        let per_symbol = ledger.get_positions_by_symbol(&intent.symbol).len() + 1;
        if per_symbol > cfg.max_positions_per_symbol {
            return Ok(RiskDecision::block(
                RiskLimit::MaxPositionsPerSymbol,
                format!(
                    "{per_symbol} positions in {} against a limit of {}",
                    intent.symbol, cfg.max_positions_per_symbol
                ),
            ));
        }
        utilisation = utilisation.max(per_symbol as f64 / cfg.max_positions_per_symbol as f64);

        let equity = ledger.get_equity();
        if !equity.is_finite() || equity <= 0.0 {
            return Ok(RiskDecision::block(
                RiskLimit::MaxTotalExposure,
                format!("equity {equity} leaves no exposure budget"),
            ));
        }

        let exposure = (ledger.gross_exposure() + intent.notional()) / equity;
        if exposure > cfg.max_total_exposure {
            return Ok(RiskDecision::block(
                RiskLimit::MaxTotalExposure,
                format!("exposure {exposure:.4} against a limit of {}", cfg.max_total_exposure),
            ));
        }
        utilisation = utilisation.max(exposure / cfg.max_total_exposure);

        let drawdown = daily_drawdown(ledger, timestamp);
        if drawdown >= cfg.max_daily_drawdown {
            return Ok(RiskDecision::block(
                RiskLimit::MaxDailyDrawdown,
                format!("daily drawdown {drawdown:.4} against a limit of {}", cfg.max_daily_drawdown),
            ));
        }
        utilisation = utilisation.max(drawdown / cfg.max_daily_drawdown);

        let correlated: f64 = self
            .correlated_symbols(correlation, &intent.symbol)
            .iter()
            .map(|symbol| ledger.symbol_exposure(symbol))
            .sum::<f64>()
            + intent.notional();
        let correlated = correlated / equity;
        if correlated > cfg.max_correlated_exposure {
            return Ok(RiskDecision::block(
                RiskLimit::MaxCorrelatedExposure,
                format!(
                    "correlated exposure {correlated:.4} against a limit of {}",
                    cfg.max_correlated_exposure
                ),
            ));
        }
        utilisation = utilisation.max(correlated / cfg.max_correlated_exposure);

        Ok(RiskDecision::allow(utilisation.clamp(0.0, 1.0)))
    }

    /// The order's own symbol, every declared group peer, and every symbol
    /// whose latest correlation magnitude reaches the threshold.
    pub fn correlated_symbols(&self, correlation: &CorrelationAnalyzer, symbol: &str) -> BTreeSet<String> {
        let mut set = BTreeSet::from([symbol.to_string()]);

        for group in &self.config.correlation_groups {
            if group.iter().any(|member| member == symbol) {
                set.extend(group.iter().cloned());
            }
        }

        if let Some(matrix) = correlation.latest_matrix() {
            for other in &matrix.symbols {
                if let Some(rho) = matrix.get(symbol, other) {
                    if rho.abs() >= self.config.correlation_threshold {
                        set.insert(other.clone());
                    }
                }
            }
        }

        set
    }
}

/// Realized loss since the start of `timestamp`'s UTC day, as a fraction of
/// the balance at that start.
pub fn daily_drawdown(ledger: &Ledger, timestamp: i64) -> f64 {
    let day_start = utc_day_start(timestamp);
    let realized_today = ledger.realized_pnl_between(day_start, i64::MAX);
    let start_balance = ledger.balance() - realized_today;
    if start_balance <= 0.0 || realized_today >= 0.0 {
        return 0.0;
    }
    -realized_today / start_balance
}

#[cfg(test)]
mod tests {
    use super::{daily_drawdown, OrderIntent, RiskError, RiskGovernor, RiskGovernorConfig, RiskLimit};
    use core_sim::{CorrelationAnalyzer, CorrelationConfig, Direction, Ledger, LedgerConfig};

    const RUN: &str = "run-risk";

    fn ledger() -> Ledger {
        Ledger::new(
            RUN,
            LedgerConfig {
                initial_balance: 100_000.0,
                commission_bps: 0.0,
            },
        )
        .unwrap()
    }

    fn intent(symbol: &str, price: f64, size: f64) -> OrderIntent {
        OrderIntent {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            price,
            size,
        }
    }

    fn loose_config() -> RiskGovernorConfig {
        RiskGovernorConfig {
            max_total_positions: 10,
            max_positions_per_symbol: 5,
            max_total_exposure: 10.0,
            max_daily_drawdown: 0.5,
            max_correlated_exposure: 10.0,
            ..RiskGovernorConfig::default()
        }
    }

    #[test]
    fn multi_asset_limits_allow_first_three_and_block_the_rest() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_total_positions: 3,
                max_positions_per_symbol: 1,
                ..loose_config()
            },
        )
        .unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let mut ledger = ledger();

        let intents = [
            intent("BTCUSDT", 100.0, 1.0),
            intent("ETHUSDT", 100.0, 1.0),
            intent("SOLUSDT", 100.0, 1.0),
            intent("BTCUSDT", 100.0, 1.0),
            intent("ADAUSDT", 100.0, 1.0),
        ];

        let mut allowed = Vec::new();
        for (ts, order) in intents.iter().enumerate() {
            let decision = governor
                .validate_order(&ledger, &analyzer, order, ts as i64)
                .unwrap();
            if decision.allowed {
                ledger
                    .open_position(&order.symbol, order.direction, order.price, order.size, ts as i64)
                    .unwrap();
            }
            allowed.push((decision.allowed, decision.violated));
        }

        assert_eq!(
            allowed,
            vec![
                (true, None),
                (true, None),
                (true, None),
                (false, Some(RiskLimit::MaxTotalPositions)),
                (false, Some(RiskLimit::MaxTotalPositions)),
            ]
        );
    }

    #[test]
    fn per_symbol_limit_is_checked_after_total() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_positions_per_symbol: 1,
                ..loose_config()
            },
        )
        .unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let mut ledger = ledger();
        ledger.open_position("BTCUSDT", Direction::Long, 100.0, 1.0, 0).unwrap();

        let decision = governor
            .validate_order(&ledger, &analyzer, &intent("BTCUSDT", 100.0, 1.0), 1)
            .unwrap();

        assert!(!decision.allowed);
        assert_eq!(decision.violated, Some(RiskLimit::MaxPositionsPerSymbol));
        assert!(decision.reason.contains("maxPositionsPerSymbol"));
    }

    #[test]
    fn exposure_limit_counts_the_new_order() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_total_exposure: 0.5,
                ..loose_config()
            },
        )
        .unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let mut ledger = ledger();
        ledger.open_position("BTCUSDT", Direction::Long, 100.0, 300.0, 0).unwrap();

        let within = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 100.0, 100.0), 1)
            .unwrap();
        let beyond = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 100.0, 300.0), 1)
            .unwrap();

        assert!(within.allowed);
        assert!((within.risk_score - 0.8).abs() < 1e-9);
        assert_eq!(beyond.violated, Some(RiskLimit::MaxTotalExposure));
    }

    #[test]
    fn daily_drawdown_resets_on_the_next_utc_day() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_daily_drawdown: 0.05,
                ..loose_config()
            },
        )
        .unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let mut ledger = ledger();
        let position = ledger.open_position("BTCUSDT", Direction::Long, 100.0, 1_000.0, 1_000).unwrap();
        ledger.close_position(position.id, 94.0, 2_000).unwrap();

        assert!((daily_drawdown(&ledger, 3_000) - 0.06).abs() < 1e-9);

        let same_day = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 10.0, 1.0), 3_000)
            .unwrap();
        let next_day = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 10.0, 1.0), 86_400_000 + 1)
            .unwrap();

        assert_eq!(same_day.violated, Some(RiskLimit::MaxDailyDrawdown));
        assert!(next_day.allowed);
    }

    #[test]
    fn declared_groups_share_one_exposure_budget() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_correlated_exposure: 0.3,
                correlation_groups: vec![vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]],
                ..loose_config()
            },
        )
        .unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let mut ledger = ledger();
        ledger.open_position("BTCUSDT", Direction::Long, 100.0, 200.0, 0).unwrap();

        let grouped = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 100.0, 150.0), 1)
            .unwrap();
        let unrelated = governor
            .validate_order(&ledger, &analyzer, &intent("SOLUSDT", 100.0, 150.0), 1)
            .unwrap();

        assert_eq!(grouped.violated, Some(RiskLimit::MaxCorrelatedExposure));
        assert!(unrelated.allowed);
    }

    #[test]
    fn measured_correlation_joins_symbols_without_a_declared_group() {
        let governor = RiskGovernor::new(
            RUN,
            RiskGovernorConfig {
                max_correlated_exposure: 0.3,
                correlation_threshold: 0.9,
                ..loose_config()
            },
        )
        .unwrap();
        let mut analyzer = CorrelationAnalyzer::new(CorrelationConfig {
            period: 20,
            min_samples: 5,
        });
        for i in 0..10 {
            let sign = if i % 2 == 0 { 0.01 } else { -0.005 };
            let r = sign * (1.0 + i as f64 / 10.0);
            analyzer.add_return("BTCUSDT", r);
            analyzer.add_return("ETHUSDT", r * 2.0);
        }
        analyzer.calculate_matrix(0);
        let mut ledger = ledger();
        ledger.open_position("BTCUSDT", Direction::Long, 100.0, 200.0, 0).unwrap();

        let set = governor.correlated_symbols(&analyzer, "ETHUSDT");
        let decision = governor
            .validate_order(&ledger, &analyzer, &intent("ETHUSDT", 100.0, 150.0), 1)
            .unwrap();

        assert!(set.contains("BTCUSDT"));
        assert_eq!(decision.violated, Some(RiskLimit::MaxCorrelatedExposure));
    }

    #[test]
    fn refuses_a_ledger_from_another_run() {
        let governor = RiskGovernor::new("run-a", RiskGovernorConfig::default()).unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let other = Ledger::new("run-b", LedgerConfig::default()).unwrap();

        let error = governor
            .validate_order(&other, &analyzer, &intent("BTCUSDT", 100.0, 1.0), 0)
            .unwrap_err();

        assert_eq!(
            error,
            RiskError::IsolationViolation {
                governor: "run-a".to_string(),
                ledger: "run-b".to_string(),
            }
        );
    }

    #[test]
    fn identical_inputs_give_identical_decisions() {
        let governor = RiskGovernor::new(RUN, RiskGovernorConfig::default()).unwrap();
        let analyzer = CorrelationAnalyzer::new(CorrelationConfig::default());
        let ledger = ledger();
        let order = intent("BTCUSDT", 100.0, 10.0);

        let first = governor.validate_order(&ledger, &analyzer, &order, 5).unwrap();
        let second = governor.validate_order(&ledger, &analyzer, &order, 5).unwrap();

        assert_eq!(first, second);
        assert!(first.allowed);
        assert!((0.0..=1.0).contains(&first.risk_score));
    }

    #[test]
    fn risk_per_trade_is_bounded_to_a_whole_account() {
        let with_risk = |max_risk_per_trade| RiskGovernorConfig {
            max_risk_per_trade,
            ..RiskGovernorConfig::default()
        };

        assert!(with_risk(1.0).validate().is_ok());
        assert!(with_risk(0.02).validate().is_ok());
        for bad in [2.0, 1.000_001, 0.0, -0.1, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(with_risk(bad).validate(), Err(RiskError::InvalidConfig(_))),
                "{bad}"
            );
        }
        assert!(RiskGovernor::new(RUN, with_risk(2.0)).is_err());
    }
}
