//! Instrument model for symbols under observation after a sharp multi-day rise.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// An instrument the controller is watching for a pullback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedInstrument {
    /// Exchange symbol
    pub instrument: String,

    /// Highest price seen since discovery
    pub peak_price: Decimal,

    /// Price the rise started from, implied by the discovery rise rate
    pub base_price: Decimal,

    /// Rise from base to peak in percent
    pub rise_rate: Decimal,

    /// Consecutive up days, extended by each later market day that sets a new peak
    pub rise_days: u32,

    /// When the instrument was first registered
    pub discovered_at: DateTime<Utc>,

    /// When the peak last moved
    pub peak_at: DateTime<Utc>,
}

impl TrackedInstrument {
    /// Register an instrument at its observed peak.
    pub fn new(
        instrument: impl Into<String>,
        peak_price: Decimal,
        rise_rate: Decimal,
        rise_days: u32,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        let growth = Decimal::ONE + rise_rate / dec!(100);
        let base_price = if growth > Decimal::ZERO {
            peak_price / growth
        } else {
            peak_price
        };

        Self {
            instrument: instrument.into(),
            peak_price,
            base_price,
            rise_rate,
            rise_days,
            discovered_at,
            peak_at: discovered_at,
        }
    }

    /// Percentage drop of `price` below the peak.
    pub fn drop_from_peak(&self, price: Decimal) -> Decimal {
        if self.peak_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.peak_price - price) / self.peak_price * dec!(100)
    }

    /// Raise the peak on a new high and re-derive the rise rate.
    ///
    /// A new high on a later market day than the previous peak adds a rise
    /// day; several highs within one day count once. `offset` is the
    /// exchange's UTC offset. Returns `true` when the peak moved.
    pub fn observe_high(&mut self, price: Decimal, at: DateTime<Utc>, offset: FixedOffset) -> bool {
        if price <= self.peak_price {
            return false;
        }

        let day = |ts: DateTime<Utc>| ts.with_timezone(&offset).date_naive();
        if day(at) > day(self.peak_at) {
            self.rise_days += 1;
        }

        self.peak_price = price;
        self.peak_at = self.peak_at.max(at);
        if self.base_price > Decimal::ZERO {
            self.rise_rate = (self.peak_price - self.base_price) / self.base_price * dec!(100);
        }
        true
    }

    /// Whether tracking has run longer than `timeout_days` without an entry.
    pub fn tracking_expired(&self, now: DateTime<Utc>, timeout_days: i64) -> bool {
        now - self.discovered_at > Duration::days(timeout_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn instrument() -> TrackedInstrument {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 0, 30, 0).unwrap();
        TrackedInstrument::new("005930", dec!(1000), dec!(40), 2, at)
    }

    #[test]
    fn test_drop_from_peak() {
        let inst = instrument();
        assert_eq!(inst.drop_from_peak(dec!(750)), dec!(25));
        assert_eq!(inst.drop_from_peak(dec!(1000)), dec!(0));
    }

    #[test]
    fn test_new_high_recomputes_rise_rate() {
        let mut inst = instrument();

        let later = inst.discovered_at + Duration::hours(1);
        assert!(!inst.observe_high(dec!(990), later, kst()));
        assert!(inst.observe_high(dec!(1100), later, kst()));
        assert_eq!(inst.peak_price, dec!(1100));
        assert_eq!(inst.peak_at, later);
        // base ~714.29, so 1100 is a 54% rise
        assert_eq!(inst.rise_rate.round_dp(2), dec!(54.00));
    }

    #[test]
    fn test_new_high_on_a_later_day_extends_rise_streak() {
        let mut inst = instrument();
        assert_eq!(inst.rise_days, 2);

        // same KST day as discovery
        assert!(inst.observe_high(dec!(1010), inst.discovered_at + Duration::hours(3), kst()));
        assert_eq!(inst.rise_days, 2);

        let next_day = inst.discovered_at + Duration::days(1);
        assert!(inst.observe_high(dec!(1050), next_day, kst()));
        assert_eq!(inst.rise_days, 3);
        assert!(inst.observe_high(dec!(1060), next_day + Duration::hours(2), kst()));
        assert_eq!(inst.rise_days, 3);

        // a lower price on a later day is not a rise day
        assert!(!inst.observe_high(dec!(1000), next_day + Duration::days(1), kst()));
        assert_eq!(inst.rise_days, 3);
    }

    #[test]
    fn test_tracking_timeout() {
        let inst = instrument();
        let later = inst.discovered_at + Duration::days(8);
        assert!(inst.tracking_expired(later, 7));
        assert!(!inst.tracking_expired(inst.discovered_at + Duration::days(3), 7));
    }
}
