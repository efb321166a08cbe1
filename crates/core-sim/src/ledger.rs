use std::collections::BTreeMap;

use thiserror::Error;

use crate::candle::{Direction, Position, PositionId, PositionStatus, Trade};
use crate::config::LedgerConfig;
use crate::state::{EquityPoint, LedgerSnapshot};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("ledger config is invalid: {0:?}")]
    InvalidConfig(LedgerConfig),
    #[error("price must be finite and positive, got {0}")]
    InvalidPrice(f64),
    #[error("size must be finite and positive, got {0}")]
    InvalidSize(f64),
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("position {0} is not open in this ledger")]
    UnknownPosition(PositionId),
}

/// Position and equity books for exactly one run.
#[derive(Debug, Clone)]
pub struct Ledger {
    run_id: String,
    config: LedgerConfig,
    next_id: u64,
    open: BTreeMap<PositionId, Position>,
    closed: Vec<Position>,
    trades: Vec<Trade>,
    marks: BTreeMap<String, f64>,
    realized_pnl: f64,
    equity_curve: Vec<EquityPoint>,
}

impl Ledger {
    pub fn new(run_id: impl Into<String>, config: LedgerConfig) -> Result<Self, LedgerError> {
        if !config.is_valid() {
            return Err(LedgerError::InvalidConfig(config));
        }

        Ok(Self {
            run_id: run_id.into(),
            config,
            next_id: 0,
            open: BTreeMap::new(),
            closed: Vec::new(),
            trades: Vec::new(),
            marks: BTreeMap::new(),
            realized_pnl: 0.0,
            equity_curve: Vec::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn open_position(
        &mut self,
        symbol: &str,
        direction: Direction,
        price: f64,
        size: f64,
        timestamp: i64,
    ) -> Result<Position, LedgerError> {
        if symbol.is_empty() {
            return Err(LedgerError::EmptySymbol);
        }
        validate_price(price)?;
        if !size.is_finite() || size <= 0.0 {
            return Err(LedgerError::InvalidSize(size));
        }

        self.next_id += 1;
        let position = Position {
            id: PositionId(self.next_id),
            symbol: symbol.to_string(),
            direction,
            entry_price: price,
            size,
            open_timestamp: timestamp,
            status: PositionStatus::Open,
        };
        self.marks.entry(position.symbol.clone()).or_insert(price);
        self.open.insert(position.id, position.clone());
        Ok(position)
    }

    pub fn close_position(
        &mut self,
        id: PositionId,
        price: f64,
        timestamp: i64,
    ) -> Result<Trade, LedgerError> {
        validate_price(price)?;
        let mut position = self
            .open
            .remove(&id)
            .ok_or(LedgerError::UnknownPosition(id))?;

        let profit = position.pnl_at(price);
        let commission = (position.notional_at(position.entry_price) + position.notional_at(price))
            * self.config.commission_rate();
        let trade = Trade {
            id: position.id,
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price: price,
            size: position.size,
            open_timestamp: position.open_timestamp,
            close_timestamp: timestamp,
            profit,
            commission,
        };

        self.realized_pnl += trade.net_profit();
        position.status = PositionStatus::Closed;
        self.closed.push(position);
        self.trades.push(trade.clone());
        Ok(trade)
    }

    /// Closes every open position at its symbol's last mark, in id order.
    pub fn close_all(&mut self, timestamp: i64) -> Result<Vec<Trade>, LedgerError> {
        let ids: Vec<PositionId> = self.open.keys().copied().collect();
        let mut trades = Vec::with_capacity(ids.len());
        for id in ids {
            let price = self.mark_for(id)?;
            trades.push(self.close_position(id, price, timestamp)?);
        }
        Ok(trades)
    }

    pub fn update_symbol_price(&mut self, symbol: &str, price: f64) -> Result<(), LedgerError> {
        validate_price(price)?;
        self.marks.insert(symbol.to_string(), price);
        Ok(())
    }

    pub fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.marks.get(symbol).copied()
    }

    pub fn balance(&self) -> f64 {
        self.config.initial_balance + self.realized_pnl
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.open
            .values()
            .map(|position| position.pnl_at(self.mark_or_entry(position)))
            .sum()
    }

    pub fn get_equity(&self) -> f64 {
        self.balance() + self.unrealized_pnl()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.open
            .values()
            .map(|position| position.notional_at(self.mark_or_entry(position)))
            .sum()
    }

    pub fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.open
            .values()
            .filter(|position| position.symbol == symbol)
            .map(|position| position.notional_at(self.mark_or_entry(position)))
            .sum()
    }

    /// Net realized P&L of trades closed in `[from, to)`.
    pub fn realized_pnl_between(&self, from: i64, to: i64) -> f64 {
        self.trades
            .iter()
            .filter(|trade| trade.close_timestamp >= from && trade.close_timestamp < to)
            .map(Trade::net_profit)
            .sum()
    }

    pub fn get_open_positions(&self) -> Vec<&Position> {
        self.open.values().collect()
    }

    pub fn get_positions_by_symbol(&self, symbol: &str) -> Vec<&Position> {
        self.open
            .values()
            .filter(|position| position.symbol == symbol)
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn closed_trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<Trade> {
        self.trades
    }

    /// Appends to the equity curve; a repeated timestamp overwrites its point.
    pub fn record_equity(&mut self, timestamp: i64) -> EquityPoint {
        let point = EquityPoint {
            timestamp,
            equity: self.get_equity(),
        };
        match self.equity_curve.last_mut() {
            Some(last) if last.timestamp == timestamp => *last = point,
            _ => self.equity_curve.push(point),
        }
        point
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn snapshot(&self, timestamp: i64) -> LedgerSnapshot {
        LedgerSnapshot {
            timestamp,
            equity: self.get_equity(),
            balance: self.balance(),
            unrealized_pnl: self.unrealized_pnl(),
            realized_pnl: self.realized_pnl,
            open_positions: self.open.len(),
        }
    }

    fn mark_or_entry(&self, position: &Position) -> f64 {
        self.marks
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.entry_price)
    }

    fn mark_for(&self, id: PositionId) -> Result<f64, LedgerError> {
        self.open
            .get(&id)
            .map(|position| self.mark_or_entry(position))
            .ok_or(LedgerError::UnknownPosition(id))
    }
}

fn validate_price(price: f64) -> Result<(), LedgerError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(LedgerError::InvalidPrice(price));
    }
    Ok(())
}
