use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    pub initial_balance: f64,
    pub commission_bps: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_balance: 100_000.0,
            commission_bps: 2.0,
        }
    }
}

impl LedgerConfig {
    pub fn is_valid(&self) -> bool {
        self.initial_balance.is_finite()
            && self.initial_balance > 0.0
            && self.commission_bps.is_finite()
            && self.commission_bps >= 0.0
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_bps / 10_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorrelationConfig {
    pub period: usize,
    pub min_samples: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            period: 50,
            min_samples: 10,
        }
    }
}

impl CorrelationConfig {
    pub fn is_valid(&self) -> bool {
        self.period >= 2 && self.min_samples >= 2 && self.min_samples <= self.period
    }
}
