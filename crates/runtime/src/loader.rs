//! Candle files and the sources that serve them.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use core_sim::Candle;

/// Integer timestamps at or above this are milliseconds, below are seconds.
const MILLISECOND_CUTOFF: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn spacing_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    pub fn periods_per_year(self) -> f64 {
        365.0 * 86_400_000.0 / self.spacing_ms() as f64
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::H1
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no candles for {symbol} at {timeframe}")]
    NotFound { symbol: String, timeframe: Timeframe },
    #[error("reading candle file: {0}")]
    Io(#[from] io::Error),
    #[error("candle file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("candle {index}: timestamp {value:?} is not an integer or RFC 3339 string")]
    BadTimestamp { index: usize, value: String },
    #[error("candle {index}: {reason}")]
    InvalidCandle { index: usize, reason: &'static str },
    #[error("candle {index}: timestamp does not increase")]
    NonIncreasing { index: usize },
}

/// A gap wider than the timeframe's spacing. Flagged, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleGap {
    pub after_timestamp: i64,
    pub missing_bars: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub count: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub gaps: Vec<CandleGap>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    timestamp: RawTimestamp,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Integer(i64),
    Text(String),
}

fn normalize_timestamp(index: usize, raw: RawTimestamp) -> Result<i64, LoadError> {
    match raw {
        RawTimestamp::Integer(value) if value >= MILLISECOND_CUTOFF => Ok(value),
        RawTimestamp::Integer(value) => value
            .checked_mul(1_000)
            .ok_or(LoadError::BadTimestamp {
                index,
                value: value.to_string(),
            }),
        RawTimestamp::Text(text) => OffsetDateTime::parse(&text, &Rfc3339)
            .map(|parsed| (parsed.unix_timestamp_nanos() / 1_000_000) as i64)
            .map_err(|_| LoadError::BadTimestamp { index, value: text }),
    }
}

fn validate(index: usize, candle: &Candle) -> Result<(), LoadError> {
    let prices = [candle.open, candle.high, candle.low, candle.close];
    if prices.iter().any(|price| !price.is_finite() || *price <= 0.0) {
        return Err(LoadError::InvalidCandle {
            index,
            reason: "prices must be finite and positive",
        });
    }
    if candle.high < candle.low {
        return Err(LoadError::InvalidCandle {
            index,
            reason: "high is below low",
        });
    }
    if !candle.volume.is_finite() || candle.volume < 0.0 {
        return Err(LoadError::InvalidCandle {
            index,
            reason: "volume must be finite and non-negative",
        });
    }
    Ok(())
}

/// Parses a JSON candle array, normalizing timestamps to milliseconds.
pub fn parse_candles(bytes: &[u8], timeframe: Timeframe) -> Result<(Vec<Candle>, LoadReport), LoadError> {
    let raw: Vec<RawCandle> = serde_json::from_slice(bytes)?;
    let mut candles = Vec::with_capacity(raw.len());
    let mut gaps = Vec::new();

    for (index, row) in raw.into_iter().enumerate() {
        let candle = Candle {
            timestamp: normalize_timestamp(index, row.timestamp)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        };
        validate(index, &candle)?;

        if let Some(previous) = candles.last().map(|last: &Candle| last.timestamp) {
            if candle.timestamp <= previous {
                return Err(LoadError::NonIncreasing { index });
            }
            let step = candle.timestamp - previous;
            if step > timeframe.spacing_ms() {
                gaps.push(CandleGap {
                    after_timestamp: previous,
                    missing_bars: step / timeframe.spacing_ms() - 1,
                });
            }
        }
        candles.push(candle);
    }

    let report = LoadReport {
        count: candles.len(),
        first_timestamp: candles.first().map(|candle| candle.timestamp),
        last_timestamp: candles.last().map(|candle| candle.timestamp),
        gaps,
    };
    Ok((candles, report))
}

pub trait CandleSource: Send + Sync {
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<(Vec<Candle>, LoadReport), LoadError>;
}

/// Reads `{dir}/{SYMBOL}_{timeframe}.json`.
#[derive(Debug, Clone)]
pub struct FileCandleSource {
    dir: PathBuf,
}

impl FileCandleSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!("{symbol}_{timeframe}.json"))
    }
}

impl CandleSource for FileCandleSource {
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<(Vec<Candle>, LoadReport), LoadError> {
        let path = self.path_for(symbol, timeframe);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    symbol: symbol.to_string(),
                    timeframe,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let (candles, report) = parse_candles(&bytes, timeframe)?;
        if !report.gaps.is_empty() {
            warn!(
                symbol,
                %timeframe,
                gaps = report.gaps.len(),
                "candle file has gaps"
            );
        }
        debug!(symbol, %timeframe, count = report.count, path = %path.display(), "loaded candles");
        Ok((candles, report))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCandleSource {
    series: HashMap<(String, Timeframe), Vec<Candle>>,
}

impl MemoryCandleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, timeframe: Timeframe, candles: Vec<Candle>) {
        self.series.insert((symbol.into(), timeframe), candles);
    }

    pub fn with(mut self, symbol: impl Into<String>, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        self.insert(symbol, timeframe, candles);
        self
    }
}

impl CandleSource for MemoryCandleSource {
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<(Vec<Candle>, LoadReport), LoadError> {
        let candles = self
            .series
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| LoadError::NotFound {
                symbol: symbol.to_string(),
                timeframe,
            })?;

        for (index, candle) in candles.iter().enumerate() {
            validate(index, candle)?;
            if index > 0 && candle.timestamp <= candles[index - 1].timestamp {
                return Err(LoadError::NonIncreasing { index });
            }
        }

        let report = LoadReport {
            count: candles.len(),
            first_timestamp: candles.first().map(|candle| candle.timestamp),
            last_timestamp: candles.last().map(|candle| candle.timestamp),
            gaps: Vec::new(),
        };
        Ok((candles.clone(), report))
    }
}
