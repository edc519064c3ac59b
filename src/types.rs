// =============================================================================
// Shared types used across the Meridian feed engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::interval::Interval;

/// A single OHLCV candle. `open_time` is UTC epoch milliseconds and uniquely
/// identifies the candle within its series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Overwrite the price/volume fields from `other` while keeping
    /// `open_time` — an in-place refinement of the still-open bar.
    pub fn refine_from(&mut self, other: &Candle) {
        self.open = other.open;
        self.high = other.high;
        self.low = other.low;
        self.close = other.close;
        self.volume = other.volume;
    }
}

/// Identifies one logical candle stream: an instrument plus its nominal
/// interval. Determines both the stream subscription and the persisted table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub symbol: String,
    pub interval: Interval,
}

impl Series {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }

    /// Table name for the persisted partition, e.g. `BTC_USDT_SWAP_1m`.
    /// Non-alphanumeric characters in the symbol are folded to underscores.
    pub fn table_name(&self) -> String {
        let sym: String = self
            .symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}_{}", sym, self.interval)
    }
}

impl std::fmt::Display for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// A maximal contiguous span of absent time buckets in a persisted series.
/// Both endpoints are missing buckets, inclusive. Recomputed on every
/// reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingInterval {
    pub since: i64,
    pub until: i64,
}

/// Lifecycle of one stream connector. Any I/O error routes back to
/// `Connecting` via the connector's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Stopping,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}
