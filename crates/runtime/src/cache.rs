//! Process-wide read-only candle cache shared by every run.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use core_sim::Candle;

use crate::loader::{CandleSource, LoadError, Timeframe};

pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

type CacheKey = (String, Timeframe);

#[derive(Debug)]
struct Entry {
    candles: Arc<[Candle]>,
    hits: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    bytes: usize,
    clock: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Series are handed out as `Arc<[Candle]>` so callers can never mutate the
/// cached copy. Eviction drops the least frequently used series first and
/// breaks ties by least recent use.
pub struct CandleCache {
    source: Arc<dyn CandleSource>,
    max_bytes: usize,
    state: Mutex<CacheState>,
    hits: Mutex<(u64, u64)>,
}

impl CandleCache {
    pub fn new(source: Arc<dyn CandleSource>, max_bytes: usize) -> Self {
        Self {
            source,
            max_bytes,
            state: Mutex::new(CacheState::default()),
            hits: Mutex::new((0, 0)),
        }
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Result<Arc<[Candle]>, LoadError> {
        let key = (symbol.to_string(), timeframe);
        {
            let mut state = self.state.lock();
            state.clock += 1;
            let now = state.clock;
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.hits += 1;
                entry.last_used = now;
                self.hits.lock().0 += 1;
                return Ok(Arc::clone(&entry.candles));
            }
        }

        self.hits.lock().1 += 1;
        let (candles, _) = self.source.load(symbol, timeframe)?;
        let candles: Arc<[Candle]> = candles.into();
        self.insert(key, Arc::clone(&candles));
        Ok(candles)
    }

    /// Copy of the cached series restricted to `[start, end]`; either bound may
    /// be open.
    pub fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Candle>, LoadError> {
        let candles = self.get(symbol, timeframe)?;
        Ok(candles
            .iter()
            .filter(|candle| start.map_or(true, |start| candle.timestamp >= start))
            .filter(|candle| end.map_or(true, |end| candle.timestamp <= end))
            .copied()
            .collect())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let (hits, misses) = *self.hits.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            hits,
            misses,
        }
    }

    pub fn contains(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.state
            .lock()
            .entries
            .contains_key(&(symbol.to_string(), timeframe))
    }

    fn insert(&self, key: CacheKey, candles: Arc<[Candle]>) {
        let size = series_bytes(&candles);
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&key) {
            if Arc::ptr_eq(&existing.candles, &candles) {
                return;
            }
        }

        while state.bytes + size > self.max_bytes && !state.entries.is_empty() {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.hits, entry.last_used))
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else { break };
            if let Some(evicted) = state.entries.remove(&victim) {
                state.bytes -= series_bytes(&evicted.candles);
                debug!(symbol = %victim.0, timeframe = %victim.1, "evicted candle series");
            }
        }

        state.clock += 1;
        let now = state.clock;
        if let Some(previous) = state.entries.insert(
            key,
            Entry {
                candles,
                hits: 0,
                last_used: now,
            },
        ) {
            state.bytes -= series_bytes(&previous.candles);
        }
        state.bytes += size;
    }
}

fn series_bytes(candles: &[Candle]) -> usize {
    mem::size_of_val(candles)
}
