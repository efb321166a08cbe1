use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,
    pub open_timestamp: i64,
    pub status: PositionStatus,
}

impl Position {
    pub fn notional_at(&self, price: f64) -> f64 {
        (price * self.size).abs()
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.direction.sign()
    }
}

/// A completed round trip. `profit` is gross of `commission`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub open_timestamp: i64,
    pub close_timestamp: i64,
    pub profit: f64,
    pub commission: f64,
}

impl Trade {
    pub fn net_profit(&self) -> f64 {
        self.profit - self.commission
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, Position, PositionId, PositionStatus};

    fn position(direction: Direction) -> Position {
        Position {
            id: PositionId(1),
            symbol: "BTCUSDT".to_string(),
            direction,
            entry_price: 100.0,
            size: 2.0,
            open_timestamp: 0,
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn pnl_follows_direction() {
        assert_eq!(position(Direction::Long).pnl_at(110.0), 20.0);
        assert_eq!(position(Direction::Short).pnl_at(110.0), -20.0);
    }

    #[test]
    fn direction_serializes_in_upper_case() {
        let json = serde_json::to_string(&Direction::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
    }
}
