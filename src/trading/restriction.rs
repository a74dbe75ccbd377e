//! Rebuy restriction registry.
//!
//! Every full exit blocks re-entry into the same instrument for a number of
//! trading days that depends on the exit reason. History is append-only; the
//! runtime persists each entry as it is recorded and reloads it on start.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use tracing::info;

use super::config::{MarketConfig, RestrictionConfig};
use crate::models::{ExitEvent, RestrictionEntry};

/// Advance `date` by `days` trading days, skipping weekends.
pub fn add_trading_days(date: NaiveDate, days: u32) -> NaiveDate {
    let mut current = date;
    let mut remaining = days;
    while remaining > 0 {
        current += Duration::days(1);
        if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            remaining -= 1;
        }
    }
    current
}

/// Per-instrument exit history and the re-entry windows it implies.
#[derive(Debug, Clone)]
pub struct RebuyRestrictionRegistry {
    config: RestrictionConfig,
    market: MarketConfig,
    history: HashMap<String, Vec<RestrictionEntry>>,
}

impl RebuyRestrictionRegistry {
    pub fn new(config: RestrictionConfig, market: MarketConfig) -> Self {
        Self {
            config,
            market,
            history: HashMap::new(),
        }
    }

    /// Seed from persisted history.
    pub fn load(&mut self, entries: impl IntoIterator<Item = RestrictionEntry>) {
        for entry in entries {
            self.history
                .entry(entry.event.instrument.clone())
                .or_default()
                .push(entry);
        }
    }

    /// Record a completed exit and return the restriction it creates.
    pub fn record_exit(&mut self, event: ExitEvent) -> RestrictionEntry {
        let exit_date = self.market.market_date(event.exited_at);
        let window = self.config.window(event.reason);
        let restricted_until = add_trading_days(exit_date, window);

        info!(
            instrument = %event.instrument,
            reason = %event.reason,
            exit_date = %exit_date,
            until = %restricted_until,
            "Rebuy restriction recorded"
        );

        let entry = RestrictionEntry {
            event,
            exit_date,
            restricted_until,
        };
        self.history
            .entry(entry.event.instrument.clone())
            .or_default()
            .push(entry.clone());
        entry
    }

    /// Whether re-entry is blocked on market date `as_of`.
    pub fn is_restricted(&self, instrument: &str, as_of: NaiveDate) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.history
            .get(instrument)
            .map_or(false, |entries| entries.iter().any(|e| e.covers(as_of)))
    }

    /// Same check for a timestamp, resolved to the market date.
    pub fn is_restricted_at(&self, instrument: &str, at: DateTime<Utc>) -> bool {
        self.is_restricted(instrument, self.market.market_date(at))
    }

    /// Latest restriction end date on record.
    pub fn restricted_until(&self, instrument: &str) -> Option<NaiveDate> {
        self.history
            .get(instrument)?
            .iter()
            .map(|e| e.restricted_until)
            .max()
    }

    pub fn history(&self, instrument: &str) -> &[RestrictionEntry] {
        self.history
            .get(instrument)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn market(&self) -> &MarketConfig {
        &self.market
    }
}
