use crate::regime::Regime;
use crate::signal::{is_fraction, StrategyError};

pub fn regime_multiplier(regime: Regime) -> f64 {
    match regime {
        Regime::TrendingUp | Regime::TrendingDown | Regime::Ranging => 1.0,
        Regime::Breakout | Regime::Mixed => 0.75,
        Regime::HighVolatility => 0.5,
    }
}

/// Units to buy or sell so the order's notional is
/// `equity * max_risk_per_trade * regime_multiplier(regime)`.
pub fn size_for_intent(
    equity: f64,
    price: f64,
    max_risk_per_trade: f64,
    regime: Option<Regime>,
) -> Result<f64, StrategyError> {
    if !equity.is_finite() || equity <= 0.0 {
        return Err(StrategyError::InvalidEquity);
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(StrategyError::NonPositivePrice);
    }
    if !is_fraction(max_risk_per_trade) && max_risk_per_trade != 1.0 {
        return Err(StrategyError::InvalidFraction("max_risk_per_trade"));
    }

    let multiplier = regime.map_or(1.0, regime_multiplier);
    let size = equity * max_risk_per_trade * multiplier / price;

    if !size.is_finite() || size <= 0.0 {
        return Err(StrategyError::InvalidPositionSize);
    }

    Ok(size)
}
