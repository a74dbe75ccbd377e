//! Performance statistics over realized exits.

mod calculator;

pub use calculator::{ExitCalculator, ExitStatistics};
