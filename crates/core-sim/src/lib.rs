pub mod candle;
pub mod clock;
mod config;
pub mod correlation;
pub mod ledger;
pub mod monte_carlo;
pub mod rng;
mod state;
pub mod stats;

pub use candle::{Candle, Direction, Position, PositionId, PositionStatus, Trade};
pub use clock::{ClockError, ClockEvent, GlobalClock, Tick};
pub use config::{CorrelationConfig, LedgerConfig};
pub use correlation::{CorrelationAnalyzer, CorrelationMatrix};
pub use ledger::{Ledger, LedgerError};
pub use monte_carlo::{
    MonteCarloConfig, MonteCarloError, MonteCarloReport, MonteCarloSimulator, PercentileBand,
    ResamplingMethod,
};
pub use rng::{RngAlgorithm, RngError, RngState, SeededRng};
pub use state::{EquityPoint, LedgerSnapshot};

pub const MS_PER_DAY: i64 = 86_400_000;

/// Start of the UTC day containing `timestamp_ms`.
pub fn utc_day_start(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MS_PER_DAY) * MS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::{utc_day_start, CorrelationConfig, LedgerConfig, MonteCarloConfig, ResamplingMethod};

    #[test]
    fn ledger_config_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.initial_balance, 100_000.0);
        assert_eq!(config.commission_bps, 2.0);
        assert!(config.is_valid());
        assert!((config.commission_rate() - 0.0002).abs() < 1e-15);
    }

    #[test]
    fn correlation_config_defaults() {
        let config = CorrelationConfig::default();
        assert_eq!(config.period, 50);
        assert_eq!(config.min_samples, 10);
        assert!(config.is_valid());
    }

    #[test]
    fn monte_carlo_config_defaults() {
        let config = MonteCarloConfig::default();
        assert_eq!(config.simulations, 1_000);
        assert_eq!(config.method, ResamplingMethod::BlockBootstrap);
        assert_eq!(config.confidence_level, 0.95);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn configs_deserialize_with_defaults() {
        let config: LedgerConfig = serde_json::from_str(r#"{"commissionBps": 5.0}"#).unwrap();
        assert_eq!(config.initial_balance, 100_000.0);
        assert_eq!(config.commission_bps, 5.0);

        let config: MonteCarloConfig =
            serde_json::from_str(r#"{"method": "TRADE_RESAMPLING", "seed": -3}"#).unwrap();
        assert_eq!(config.method, ResamplingMethod::TradeResampling);
        assert_eq!(config.seed, -3);
        assert_eq!(config.simulations, 1_000);
    }

    #[test]
    fn day_start_floors_negative_timestamps() {
        assert_eq!(utc_day_start(86_400_000 + 5), 86_400_000);
        assert_eq!(utc_day_start(-1), -86_400_000);
    }
}
