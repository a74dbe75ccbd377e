//! Stage order sizing: capital split across stages, scaled by rise streak and rise rate.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::config::StageConfig;
use crate::models::{Stage, TrackedInstrument};

/// Sized stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSize {
    pub quantity: u64,
    /// quantity x price
    pub amount: Decimal,
    pub multiplier: Decimal,
}

/// Why a stage could not be sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRejection {
    /// Rise streak is too long to buy into at all
    RiseStreakVeto { rise_days: u32 },
    /// Order would be smaller than the minimum stage amount
    BelowMinimum { amount: Decimal },
}

/// Calculator for stage quantities.
#[derive(Debug, Clone)]
pub struct StageSizer {
    config: StageConfig,
}

impl StageSizer {
    pub fn new(config: StageConfig) -> Self {
        Self { config }
    }

    /// Combined size multiplier, `None` when the rise streak vetoes entry.
    pub fn multiplier(&self, instrument: &TrackedInstrument) -> Option<Decimal> {
        let day = self.config.rise_day_multiplier(instrument.rise_days)?;
        Some(day * self.config.rise_rate_ratio(instrument.rise_rate))
    }

    /// Whole-share quantity for `stage` at `price`.
    ///
    /// quantity = floor(base_amount x allocation x multiplier / price)
    pub fn size(
        &self,
        stage: Stage,
        instrument: &TrackedInstrument,
        price: Decimal,
    ) -> Result<StageSize, SizeRejection> {
        let multiplier = self
            .multiplier(instrument)
            .ok_or(SizeRejection::RiseStreakVeto {
                rise_days: instrument.rise_days,
            })?;

        if price <= Decimal::ZERO {
            return Err(SizeRejection::BelowMinimum {
                amount: Decimal::ZERO,
            });
        }

        let budget = self.config.base_amount * self.config.allocation(stage) * multiplier;
        let quantity = (budget / price).floor().to_u64().unwrap_or(0);
        let amount = Decimal::from(quantity) * price;

        if quantity == 0 || amount < self.config.min_stage_amount {
            return Err(SizeRejection::BelowMinimum { amount });
        }

        Ok(StageSize {
            quantity,
            amount,
            multiplier,
        })
    }
}
