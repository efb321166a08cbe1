use serde::{Deserialize, Serialize};

/// Point-in-time view of one ledger's books.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub timestamp: i64,
    pub equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
}
