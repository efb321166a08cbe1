pub mod regime;
pub mod risk;
pub mod signal;
pub mod sizing;

pub use regime::{Regime, RegimeDetector, RegimeDetectorConfig, RegimeFeatures, RegimePeriod, RegimeSample};
pub use risk::{OrderIntent, RiskDecision, RiskError, RiskGovernor, RiskGovernorConfig, RiskLimit};
pub use signal::{emit_signal, signal_for_history, Signal, StrategyError, StrategyParams};
pub use sizing::{regime_multiplier, size_for_intent};

#[cfg(test)]
mod tests {
    use crate::{RegimeDetectorConfig, RiskGovernorConfig, StrategyParams};

    #[test]
    fn risk_governor_defaults() {
        let config = RiskGovernorConfig::default();
        assert_eq!(config.max_total_positions, 5);
        assert_eq!(config.max_positions_per_symbol, 1);
        assert_eq!(config.max_total_exposure, 1.0);
        assert_eq!(config.max_daily_drawdown, 0.05);
        assert!(config.correlation_groups.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn regime_detector_defaults_are_valid() {
        let config = RegimeDetectorConfig::default();
        assert_eq!(config.lookback_period, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn strategy_params_defaults_are_valid() {
        assert!(StrategyParams::default().validate().is_ok());
    }
}
