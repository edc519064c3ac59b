// =============================================================================
// Nominal interval encoding — "<quantity><unit>" with unit in {m, h, d}
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// The fixed duration one candle of a series represents, parsed from encodings
/// like `1m`, `15m`, `4h`, `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    quantity: u32,
    unit: IntervalUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
}

impl Interval {
    pub fn new(quantity: u32, unit: IntervalUnit) -> Result<Self, FeedError> {
        if quantity == 0 {
            return Err(FeedError::Interval("interval quantity must be non-zero".into()));
        }
        Ok(Self { quantity, unit })
    }

    /// Nominal duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        let unit_ms: i64 = match self.unit {
            IntervalUnit::Minute => 60_000,
            IntervalUnit::Hour => 3_600_000,
            IntervalUnit::Day => 86_400_000,
        };
        i64::from(self.quantity) * unit_ms
    }

    /// The `bar` parameter the exchange REST API expects. Hours and days are
    /// uppercased on the wire (`1h` → `1H`), minutes stay lowercase.
    pub fn exchange_bar(&self) -> String {
        match self.unit {
            IntervalUnit::Minute => format!("{}m", self.quantity),
            IntervalUnit::Hour => format!("{}H", self.quantity),
            IntervalUnit::Day => format!("{}D", self.quantity),
        }
    }

    /// WebSocket channel name for the candle subscription, e.g. `candle1m`.
    pub fn channel(&self) -> String {
        format!("candle{}", self.exchange_bar())
    }
}

impl std::str::FromStr for Interval {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 2 {
            return Err(FeedError::Interval(format!("invalid interval encoding: {s:?}")));
        }
        let Some((idx, unit_ch)) = s.char_indices().last() else {
            return Err(FeedError::Interval(format!("invalid interval encoding: {s:?}")));
        };
        let quantity: u32 = s[..idx]
            .parse()
            .map_err(|_| FeedError::Interval(format!("invalid interval quantity: {s:?}")))?;
        let unit = match unit_ch {
            'm' => IntervalUnit::Minute,
            'h' | 'H' => IntervalUnit::Hour,
            'd' | 'D' => IntervalUnit::Day,
            other => {
                return Err(FeedError::Interval(format!("unknown interval unit: {other:?}")))
            }
        };
        Interval::new(quantity, unit)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            IntervalUnit::Minute => "m",
            IntervalUnit::Hour => "h",
            IntervalUnit::Day => "d",
        };
        write!(f, "{}{}", self.quantity, unit)
    }
}

impl Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
