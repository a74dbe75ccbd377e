//! Market data inputs: price ticks, indicator updates and the combined snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price/volume tick from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: Decimal,
    /// Traded volume for the current bar
    #[serde(default)]
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Externally computed indicator values for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// Momentum oscillator (RSI-style, 0-100)
    #[serde(default)]
    pub oscillator: Option<Decimal>,

    /// Trailing average volume used as the contraction reference
    #[serde(default)]
    pub average_volume: Option<Decimal>,

    /// Price levels expected to act as support
    #[serde(default)]
    pub support_levels: Vec<Decimal>,
}

/// Indicator update addressed to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorUpdate {
    pub instrument: String,
    #[serde(flatten)]
    pub indicators: Indicators,
}

/// Everything the entry logic looks at for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub price: Decimal,
    pub volume: u64,
    pub oscillator: Option<Decimal>,
    pub average_volume: Option<Decimal>,
    pub support_levels: Vec<Decimal>,
    pub as_of: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Combine the latest tick with the latest indicator values.
    pub fn from_tick(tick: &Tick, indicators: &Indicators) -> Self {
        Self {
            price: tick.price,
            volume: tick.volume,
            oscillator: indicators.oscillator,
            average_volume: indicators.average_volume,
            support_levels: indicators.support_levels.clone(),
            as_of: tick.timestamp,
        }
    }
}
