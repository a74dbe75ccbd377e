//! Controller configuration.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{ExitReason, Stage};

/// Full configuration for the lifecycle controller and its runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub market: MarketConfig,
    pub stages: StageConfig,
    pub support: SupportConfig,
    pub exit: ExitConfig,
    pub restriction: RestrictionConfig,
    pub runtime: RuntimeConfig,
}

impl ControllerConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the controller cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        self.market.offset().context("market.utc_offset_hours out of range")?;

        let s = &self.stages;
        let total: Decimal = s.allocations.iter().copied().sum();
        if total != Decimal::ONE {
            bail!("stage allocations must sum to 1, got {}", total);
        }
        if s.allocations.iter().any(|a| *a < Decimal::ZERO) {
            bail!("stage allocations must not be negative");
        }
        if s.base_amount <= Decimal::ZERO {
            bail!("base_amount must be positive");
        }
        if s.drop_bands.is_empty() {
            bail!("at least one drop band is required");
        }
        for band in &s.drop_bands {
            if band.drop_min < Decimal::ZERO || band.drop_max < band.drop_min {
                bail!(
                    "invalid drop band {}-{} for rise {}-{}",
                    band.drop_min,
                    band.drop_max,
                    band.rise_min,
                    band.rise_max
                );
            }
        }
        if s.stage_band_fractions.iter().any(|f| *f < Decimal::ZERO || *f > Decimal::ONE) {
            bail!("stage_band_fractions must lie within [0, 1]");
        }
        if s.required_conditions.iter().any(|c| *c > 3) {
            bail!("required_conditions cannot exceed the three support checks");
        }

        let e = &self.exit;
        if e.stop_loss_pct >= Decimal::ZERO {
            bail!("stop_loss_pct must be negative, got {}", e.stop_loss_pct);
        }
        if e.trailing_trigger_pct <= Decimal::ZERO || e.trailing_retracement_pct <= Decimal::ZERO {
            bail!("trailing trigger and retracement must be positive");
        }

        if self.runtime.heartbeat_secs == 0 {
            bail!("heartbeat_secs must be at least 1");
        }

        Ok(())
    }
}

/// Exchange calendar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Exchange local time offset from UTC
    pub utc_offset_hours: i32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 9, // KST
        }
    }
}

impl MarketConfig {
    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
    }

    /// Exchange-local calendar date of a timestamp.
    pub fn market_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self.offset() {
            Some(offset) => ts.with_timezone(&offset).date_naive(),
            None => ts.date_naive(),
        }
    }
}

/// Pullback depth band for a given size of prior rise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropBand {
    pub rise_min: Decimal,
    pub rise_max: Decimal,
    pub drop_min: Decimal,
    pub drop_max: Decimal,
}

impl DropBand {
    pub fn width(&self) -> Decimal {
        self.drop_max - self.drop_min
    }
}

/// Position ratio applied below a rise-rate ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiseRateRatio {
    pub below: Decimal,
    pub ratio: Decimal,
}

/// Stage entry rules and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Capital committed to one instrument across all stages
    pub base_amount: Decimal,

    /// Share of `base_amount` per stage; must sum to 1
    pub allocations: [Decimal; 3],

    /// Skip a stage whose order value would fall below this
    pub min_stage_amount: Decimal,

    /// Rise-rate to drop-band matrix, first match wins
    pub drop_bands: Vec<DropBand>,

    /// Where each stage's drop threshold sits inside the band (0 = min, 1 = max)
    pub stage_band_fractions: [Decimal; 3],

    /// Support conditions needed per stage
    pub required_conditions: [u8; 3],

    /// Size multiplier by consecutive rise days (index 0 = day 1); longer streaks are vetoed
    pub rise_day_multipliers: Vec<Decimal>,

    /// Size ratio by rise rate, first ceiling above the rate wins
    pub rise_rate_ratios: Vec<RiseRateRatio>,

    /// Ratio when the rise rate clears every ceiling
    pub rise_rate_floor_ratio: Decimal,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            base_amount: dec!(1000000),
            allocations: [dec!(0.5), dec!(0.3), dec!(0.2)],
            min_stage_amount: dec!(50000),
            drop_bands: vec![
                DropBand { rise_min: dec!(0), rise_max: dec!(30), drop_min: dec!(10), drop_max: dec!(20) },
                DropBand { rise_min: dec!(30), rise_max: dec!(50), drop_min: dec!(20), drop_max: dec!(30) },
                DropBand { rise_min: dec!(50), rise_max: dec!(100), drop_min: dec!(25), drop_max: dec!(35) },
                DropBand { rise_min: dec!(100), rise_max: dec!(10000), drop_min: dec!(30), drop_max: dec!(40) },
            ],
            stage_band_fractions: [dec!(0), dec!(0.5), dec!(0.9)],
            required_conditions: [1, 2, 2],
            rise_day_multipliers: vec![dec!(1.0), dec!(1.0), dec!(0.8), dec!(0.5)],
            rise_rate_ratios: vec![
                RiseRateRatio { below: dec!(50), ratio: dec!(1.0) },
                RiseRateRatio { below: dec!(70), ratio: dec!(0.8) },
                RiseRateRatio { below: dec!(100), ratio: dec!(0.5) },
            ],
            rise_rate_floor_ratio: dec!(0.3),
        }
    }
}

impl StageConfig {
    /// Drop band for a rise rate; rates outside the matrix use the last row.
    pub fn band_for(&self, rise_rate: Decimal) -> Option<&DropBand> {
        self.drop_bands
            .iter()
            .find(|b| b.rise_min <= rise_rate && rise_rate <= b.rise_max)
            .or_else(|| self.drop_bands.last())
    }

    /// Minimum drop that triggers `stage` within `band`.
    pub fn threshold(&self, band: &DropBand, stage: Stage) -> Decimal {
        band.drop_min + band.width() * self.stage_band_fractions[stage.index()]
    }

    pub fn allocation(&self, stage: Stage) -> Decimal {
        self.allocations[stage.index()]
    }

    pub fn required(&self, stage: Stage) -> u8 {
        self.required_conditions[stage.index()]
    }

    /// Multiplier for a rise streak, `None` when the streak vetoes entry.
    pub fn rise_day_multiplier(&self, rise_days: u32) -> Option<Decimal> {
        let idx = rise_days.max(1) as usize - 1;
        self.rise_day_multipliers
            .get(idx)
            .copied()
            .filter(|m| *m > Decimal::ZERO)
    }

    pub fn rise_rate_ratio(&self, rise_rate: Decimal) -> Decimal {
        self.rise_rate_ratios
            .iter()
            .find(|r| rise_rate < r.below)
            .map(|r| r.ratio)
            .unwrap_or(self.rise_rate_floor_ratio)
    }
}

/// Support condition thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportConfig {
    /// Oversold when the oscillator is at or below this
    pub oscillator_threshold: Decimal,

    /// Contracted when volume is at or below this fraction of the trailing average
    pub volume_contraction_ratio: Decimal,

    /// Near support within this percent of a level
    pub support_tolerance_pct: Decimal,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            oscillator_threshold: dec!(30),
            volume_contraction_ratio: dec!(0.5),
            support_tolerance_pct: dec!(1.0),
        }
    }
}

/// Exit thresholds, all in percent of average cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub stop_loss_pct: Decimal,
    pub trailing_trigger_pct: Decimal,
    pub trailing_retracement_pct: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(-2.0),           // -2% hard stop
            trailing_trigger_pct: dec!(2.0),     // arm at +2%
            trailing_retracement_pct: dec!(1.0), // 1pt give-back
        }
    }
}

/// Rebuy cooldown windows in trading days.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionConfig {
    pub enabled: bool,
    pub stop_loss_days: u32,
    pub trailing_stop_days: u32,
    pub manual_days: u32,
}

impl Default for RestrictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_loss_days: 5,
            trailing_stop_days: 5,
            manual_days: 5,
        }
    }
}

impl RestrictionConfig {
    pub fn window(&self, reason: ExitReason) -> u32 {
        match reason {
            ExitReason::StopLoss => self.stop_loss_days,
            ExitReason::TrailingStop => self.trailing_stop_days,
            ExitReason::Manual => self.manual_days,
        }
    }
}

/// Timing for the event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Suspend new entries when the last tick is older than this
    pub staleness_secs: i64,

    /// Query order status when no fill arrived within this
    pub fill_timeout_secs: i64,

    pub heartbeat_secs: u64,

    /// Drop an instrument that never produced an entry after this many days
    pub tracking_timeout_days: i64,

    /// Give up retrying an entry submission after this long
    pub entry_retry_max_secs: u64,

    pub entry_retry_initial_ms: u64,

    /// Per-instrument inbox size
    pub inbox_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 60,
            fill_timeout_secs: 30,
            heartbeat_secs: 5,
            tracking_timeout_days: 7,
            entry_retry_max_secs: 10,
            entry_retry_initial_ms: 200,
            inbox_capacity: 256,
        }
    }
}
