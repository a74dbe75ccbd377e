//! Exit records and the rebuy restrictions derived from them.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Why a position was liquidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop_loss" => Some(ExitReason::StopLoss),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed full liquidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub instrument: String,
    pub reason: ExitReason,
    /// Volume-weighted price over all exit fills
    pub price: Decimal,
    pub quantity: u64,
    /// Average cost of the position that was closed
    pub average_cost: Decimal,
    /// Number of stages that had filled
    pub stages: u8,
    pub exited_at: DateTime<Utc>,
}

impl ExitEvent {
    /// Realized return in percent.
    pub fn return_pct(&self) -> Decimal {
        if self.average_cost.is_zero() {
            return Decimal::ZERO;
        }
        (self.price - self.average_cost) / self.average_cost * dec!(100)
    }

    pub fn realized_pnl(&self) -> Decimal {
        (self.price - self.average_cost) * Decimal::from(self.quantity)
    }
}

/// Restriction history entry: an exit plus the window it blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionEntry {
    pub event: ExitEvent,
    /// Market-local date of the exit
    pub exit_date: NaiveDate,
    /// Last market date on which re-entry is blocked
    pub restricted_until: NaiveDate,
}

impl RestrictionEntry {
    pub fn covers(&self, as_of: NaiveDate) -> bool {
        self.exit_date <= as_of && as_of <= self.restricted_until
    }
}
