//! Causal market-regime classification.
//!
//! Every feature for bar `i` is computed from the trailing window ending at
//! `i`, so a label never changes when later bars are edited or appended.

use serde::{Deserialize, Serialize};

use core_sim::stats::{mean, std_dev};
use core_sim::Candle;

use crate::signal::StrategyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
    Breakout,
    Mixed,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrendingUp => "TRENDING_UP",
            Self::TrendingDown => "TRENDING_DOWN",
            Self::Ranging => "RANGING",
            Self::HighVolatility => "HIGH_VOLATILITY",
            Self::Breakout => "BREAKOUT",
            Self::Mixed => "MIXED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeDetectorConfig {
    pub lookback_period: usize,
    pub volatility_threshold: f64,
    pub trend_threshold: f64,
    pub range_threshold: f64,
    pub min_regime_duration: usize,
    pub volume_surge_ratio: f64,
}

impl Default for RegimeDetectorConfig {
    fn default() -> Self {
        Self {
            lookback_period: 20,
            volatility_threshold: 0.02,
            trend_threshold: 0.6,
            range_threshold: 0.25,
            min_regime_duration: 3,
            volume_surge_ratio: 2.0,
        }
    }
}

impl RegimeDetectorConfig {
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.lookback_period < 3 {
            return Err(StrategyError::InvalidRegimeConfig("lookback_period must be at least 3"));
        }
        if !self.volatility_threshold.is_finite() || self.volatility_threshold <= 0.0 {
            return Err(StrategyError::InvalidRegimeConfig("volatility_threshold must be positive"));
        }
        if !(0.0..=1.0).contains(&self.trend_threshold) || self.trend_threshold == 0.0 {
            return Err(StrategyError::InvalidRegimeConfig("trend_threshold must lie in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.range_threshold) {
            return Err(StrategyError::InvalidRegimeConfig("range_threshold must lie in [0, 1]"));
        }
        if self.range_threshold >= self.trend_threshold {
            return Err(StrategyError::InvalidRegimeConfig(
                "range_threshold must be below trend_threshold",
            ));
        }
        if self.min_regime_duration == 0 {
            return Err(StrategyError::InvalidRegimeConfig("min_regime_duration must be positive"));
        }
        if !self.volume_surge_ratio.is_finite() || self.volume_surge_ratio <= 1.0 {
            return Err(StrategyError::InvalidRegimeConfig(
                "volume_surge_ratio must be greater than 1",
            ));
        }
        Ok(())
    }
}

/// Window statistics behind one classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeFeatures {
    pub volatility: f64,
    pub efficiency: f64,
    pub net_return: f64,
    pub mean_return: f64,
    pub amplitude_ratio: f64,
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeSample {
    pub index: usize,
    pub timestamp: i64,
    pub regime: Regime,
    pub confidence: f64,
    pub features: RegimeFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimePeriod {
    pub regime: Regime,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub confidence: f64,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct RegimeDetector {
    config: RegimeDetectorConfig,
}

impl RegimeDetector {
    pub fn new(config: RegimeDetectorConfig) -> Result<Self, StrategyError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RegimeDetectorConfig {
        &self.config
    }

    /// `None` for `index < lookback_period`. From there on the label covers
    /// the `lookback_period` bars ending at `index`, inclusive.
    pub fn classify_at(&self, candles: &[Candle], index: usize) -> Option<RegimeSample> {
        let lookback = self.config.lookback_period;
        if index >= candles.len() || index < lookback {
            return None;
        }

        let window = &candles[index + 1 - lookback..=index];
        let features = window_features(window)?;
        let (regime, confidence) = self.label(&features);

        Some(RegimeSample {
            index,
            timestamp: candles[index].timestamp,
            regime,
            confidence,
            features,
        })
    }

    pub fn classify_series(&self, candles: &[Candle]) -> Vec<RegimeSample> {
        (0..candles.len())
            .filter_map(|index| self.classify_at(candles, index))
            .collect()
    }

    /// Runs of equal labels lasting at least `min_regime_duration` samples.
    pub fn detect_periods(&self, candles: &[Candle]) -> Vec<RegimePeriod> {
        let samples = self.classify_series(candles);
        let mut periods = Vec::new();
        let mut start = 0;

        while start < samples.len() {
            let regime = samples[start].regime;
            let mut end = start;
            while end + 1 < samples.len()
                && samples[end + 1].regime == regime
                && samples[end + 1].index == samples[end].index + 1
            {
                end += 1;
            }

            let run = &samples[start..=end];
            if run.len() >= self.config.min_regime_duration {
                let confidences: Vec<f64> = run.iter().map(|sample| sample.confidence).collect();
                periods.push(RegimePeriod {
                    regime,
                    start_timestamp: run[0].timestamp,
                    end_timestamp: run[run.len() - 1].timestamp,
                    confidence: mean(&confidences).unwrap_or(0.0),
                    samples: run.len(),
                });
            }
            start = end + 1;
        }

        periods
    }

    fn label(&self, features: &RegimeFeatures) -> (Regime, f64) {
        let cfg = &self.config;
        let vol_threshold = cfg.volatility_threshold;

        if features.volatility > vol_threshold {
            let excess = (features.volatility - vol_threshold) / vol_threshold;
            return (Regime::HighVolatility, confidence(excess));
        }

        if features.efficiency >= cfg.trend_threshold {
            let excess = (features.efficiency - cfg.trend_threshold) / cfg.trend_threshold;
            let regime = if features.net_return > 0.0 {
                Some(Regime::TrendingUp)
            } else if features.net_return < 0.0 {
                Some(Regime::TrendingDown)
            } else {
                None
            };
            if let Some(regime) = regime {
                return (regime, confidence(excess));
            }
        }

        if features.efficiency <= cfg.range_threshold && features.volatility <= vol_threshold / 2.0 {
            let excess = if cfg.range_threshold > 0.0 {
                (cfg.range_threshold - features.efficiency) / cfg.range_threshold
            } else {
                0.0
            };
            return (Regime::Ranging, confidence(excess));
        }

        let surge = features.volume_ratio.max(features.amplitude_ratio);
        if surge >= cfg.volume_surge_ratio && features.mean_return.abs() >= vol_threshold / 10.0 {
            let excess = (surge - cfg.volume_surge_ratio) / cfg.volume_surge_ratio;
            return (Regime::Breakout, confidence(excess));
        }

        let penalty = 0.25 * (features.volatility / vol_threshold).tanh();
        (Regime::Mixed, (0.5 - penalty).clamp(0.0, 1.0))
    }
}

fn confidence(excess: f64) -> f64 {
    (0.5 + 0.5 * excess.max(0.0).tanh()).clamp(0.0, 1.0)
}

fn window_features(window: &[Candle]) -> Option<RegimeFeatures> {
    let first = window.first()?;
    let last = window.last()?;
    if first.close <= 0.0 {
        return None;
    }

    let returns: Vec<f64> = window
        .windows(2)
        .map(|pair| pair[1].close / pair[0].close - 1.0)
        .collect();
    let path: f64 = window
        .windows(2)
        .map(|pair| (pair[1].close - pair[0].close).abs())
        .sum();
    let displacement = last.close - first.close;

    let ranges: Vec<f64> = window.iter().map(Candle::range).collect();
    let volumes: Vec<f64> = window.iter().map(|candle| candle.volume).collect();

    let features = RegimeFeatures {
        volatility: std_dev(&returns)?,
        efficiency: if path > 0.0 { displacement.abs() / path } else { 0.0 },
        net_return: last.close / first.close - 1.0,
        mean_return: mean(&returns)?,
        amplitude_ratio: ratio_to_mean(last.range(), &ranges),
        volume_ratio: ratio_to_mean(last.volume, &volumes),
    };

    let finite = [
        features.volatility,
        features.efficiency,
        features.net_return,
        features.mean_return,
        features.amplitude_ratio,
        features.volume_ratio,
    ]
    .iter()
    .all(|value| value.is_finite());
    finite.then_some(features)
}

fn ratio_to_mean(value: f64, values: &[f64]) -> f64 {
    match mean(values) {
        Some(avg) if avg > 0.0 => value / avg,
        _ => 1.0,
    }
}
