//! Support condition scoring for pullback entries.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::config::SupportConfig;
use crate::models::MarketSnapshot;

/// Which support conditions a snapshot satisfies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupportScore {
    pub oversold: bool,
    pub volume_contracted: bool,
    pub near_support: bool,
}

impl SupportScore {
    pub fn satisfied(&self) -> u8 {
        u8::from(self.oversold) + u8::from(self.volume_contracted) + u8::from(self.near_support)
    }
}

/// Stateless evaluator of the three support checks.
#[derive(Debug, Clone)]
pub struct SupportConditionEvaluator {
    config: SupportConfig,
}

impl SupportConditionEvaluator {
    pub fn new(config: SupportConfig) -> Self {
        Self { config }
    }

    /// Score a snapshot. Missing indicator inputs count as unsatisfied.
    pub fn score(&self, snapshot: &MarketSnapshot) -> SupportScore {
        SupportScore {
            oversold: self.is_oversold(snapshot),
            volume_contracted: self.is_volume_contracted(snapshot),
            near_support: self.is_near_support(snapshot),
        }
    }

    fn is_oversold(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot
            .oscillator
            .map_or(false, |osc| osc <= self.config.oscillator_threshold)
    }

    fn is_volume_contracted(&self, snapshot: &MarketSnapshot) -> bool {
        match snapshot.average_volume {
            Some(avg) if avg > Decimal::ZERO => {
                Decimal::from(snapshot.volume) <= avg * self.config.volume_contraction_ratio
            }
            _ => false,
        }
    }

    fn is_near_support(&self, snapshot: &MarketSnapshot) -> bool {
        snapshot
            .support_levels
            .iter()
            .filter(|level| **level > Decimal::ZERO)
            .any(|level| {
                let distance = (snapshot.price - *level).abs() / *level * dec!(100);
                distance <= self.config.support_tolerance_pct
            })
    }
}
