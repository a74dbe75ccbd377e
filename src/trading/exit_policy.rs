//! Exit rules: hard stop-loss and a trailing stop that arms on profit.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use super::config::ExitConfig;
use crate::models::{ExitReason, Position};

/// Outcome of one exit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    StopLoss,
    TrailingStop,
    Hold,
}

impl ExitDecision {
    pub fn reason(&self) -> Option<ExitReason> {
        match self {
            ExitDecision::StopLoss => Some(ExitReason::StopLoss),
            ExitDecision::TrailingStop => Some(ExitReason::TrailingStop),
            ExitDecision::Hold => None,
        }
    }
}

/// Evaluates exits against the position's average cost.
#[derive(Debug, Clone)]
pub struct ExitPolicyEvaluator {
    config: ExitConfig,
}

impl ExitPolicyEvaluator {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Evaluate `price` against the position, updating its trailing state.
    ///
    /// Stop-loss is checked before trailing and applies whether or not the
    /// trailing stop is armed.
    pub fn evaluate(&self, position: &mut Position, price: Decimal) -> ExitDecision {
        if position.average_cost <= Decimal::ZERO {
            return ExitDecision::Hold;
        }

        let profit = position.profit_rate(price);
        if profit <= self.config.stop_loss_pct {
            warn!(
                instrument = %position.instrument,
                profit = %profit.round_dp(2),
                stop = %self.config.stop_loss_pct,
                "Stop loss triggered"
            );
            return ExitDecision::StopLoss;
        }

        if !position.trailing_armed && profit >= self.config.trailing_trigger_pct {
            position.trailing_armed = true;
            position.high_water = price;
            info!(
                instrument = %position.instrument,
                profit = %profit.round_dp(2),
                high = %price,
                "Trailing stop armed"
            );
        } else if price > position.high_water {
            position.high_water = price;
        }

        if position.trailing_armed {
            let retracement = (position.high_water - price) / position.average_cost * dec!(100);
            if retracement > self.config.trailing_retracement_pct {
                info!(
                    instrument = %position.instrument,
                    high = %position.high_water,
                    price = %price,
                    retracement = %retracement.round_dp(3),
                    "Trailing stop triggered"
                );
                return ExitDecision::TrailingStop;
            }
            debug!(
                instrument = %position.instrument,
                retracement = %retracement.round_dp(3),
                "Trailing stop holding"
            );
        }

        ExitDecision::Hold
    }
}
