use thiserror::Error;

use crate::candle::Candle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("symbol {0} is already registered")]
    DuplicateSymbol(String),
    #[error("symbol {symbol} has a non-increasing timestamp at index {index}")]
    NonMonotonic { symbol: String, index: usize },
    #[error("streams cannot be registered after the clock has started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockEvent {
    pub symbol: String,
    pub index: usize,
    pub candle: Candle,
}

/// Every bar sharing one timestamp, in registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub timestamp: i64,
    pub events: Vec<ClockEvent>,
}

#[derive(Debug, Clone)]
struct Stream {
    symbol: String,
    candles: Vec<Candle>,
    cursor: usize,
}

impl Stream {
    fn head_timestamp(&self) -> Option<i64> {
        self.candles.get(self.cursor).map(|candle| candle.timestamp)
    }
}

/// Merges per-symbol streams into one chronological axis.
#[derive(Debug, Clone, Default)]
pub struct GlobalClock {
    streams: Vec<Stream>,
    current_time: Option<i64>,
    started: bool,
    released: usize,
    total: usize,
}

impl GlobalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, symbol: impl Into<String>, candles: Vec<Candle>) -> Result<(), ClockError> {
        let symbol = symbol.into();
        if self.started {
            return Err(ClockError::AlreadyStarted);
        }
        if self.streams.iter().any(|stream| stream.symbol == symbol) {
            return Err(ClockError::DuplicateSymbol(symbol));
        }
        if let Some(index) = candles
            .windows(2)
            .position(|pair| pair[1].timestamp <= pair[0].timestamp)
        {
            return Err(ClockError::NonMonotonic {
                symbol,
                index: index + 1,
            });
        }

        self.total += candles.len();
        self.streams.push(Stream {
            symbol,
            candles,
            cursor: 0,
        });
        Ok(())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|stream| stream.symbol.as_str())
    }

    pub fn current_time(&self) -> Option<i64> {
        self.current_time
    }

    pub fn next_timestamp(&self) -> Option<i64> {
        self.streams.iter().filter_map(Stream::head_timestamp).min()
    }

    pub fn is_finished(&self) -> bool {
        self.released == self.total
    }

    pub fn total_bars(&self) -> usize {
        self.total
    }

    pub fn released_bars(&self) -> usize {
        self.released
    }

    pub fn next_tick(&mut self) -> Option<Tick> {
        self.started = true;
        let timestamp = self.next_timestamp()?;
        let mut events = Vec::new();

        for stream in &mut self.streams {
            if stream.head_timestamp() == Some(timestamp) {
                events.push(ClockEvent {
                    symbol: stream.symbol.clone(),
                    index: stream.cursor,
                    candle: stream.candles[stream.cursor],
                });
                stream.cursor += 1;
            }
        }

        self.released += events.len();
        self.current_time = Some(timestamp);
        Some(Tick { timestamp, events })
    }

    /// Releases every unseen bar stamped at or before `timestamp`.
    pub fn advance_to(&mut self, timestamp: i64) -> Vec<ClockEvent> {
        self.started = true;
        let mut events = Vec::new();
        while self.next_timestamp().is_some_and(|next| next <= timestamp) {
            if let Some(tick) = self.next_tick() {
                events.extend(tick.events);
            }
        }

        if self.current_time.map_or(true, |current| current < timestamp) {
            self.current_time = Some(timestamp);
        }
        events
    }

    pub fn get_progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.released as f64 / self.total as f64
    }

    /// Bars released so far for `symbol`; never includes future bars.
    pub fn history(&self, symbol: &str) -> &[Candle] {
        self.streams
            .iter()
            .find(|stream| stream.symbol == symbol)
            .map(|stream| &stream.candles[..stream.cursor])
            .unwrap_or(&[])
    }
}
