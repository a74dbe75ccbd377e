//! Stage buy planning: decides whether the next stage of a pullback entry fires.

use std::fmt;

use rust_decimal::Decimal;
use tracing::debug;

use super::config::StageConfig;
use super::restriction::RebuyRestrictionRegistry;
use super::sizing::{SizeRejection, StageSizer};
use super::support::{SupportConditionEvaluator, SupportScore};
use crate::models::{MarketSnapshot, Position, Stage, TrackedInstrument};

/// Planner verdict for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageDecision {
    Enter {
        stage: Stage,
        quantity: u64,
        limit_price: Decimal,
    },
    NoAction(NoActionReason),
}

/// Why no stage fired.
#[derive(Debug, Clone, PartialEq)]
pub enum NoActionReason {
    Restricted,
    RiseStreakVeto { rise_days: u32 },
    AllStagesFilled,
    NoDropBand,
    DropOutsideBand { drop: Decimal, min: Decimal, max: Decimal },
    DropBelowThreshold { drop: Decimal, threshold: Decimal },
    InsufficientSupport { satisfied: u8, required: u8 },
    BelowMinimumAmount { amount: Decimal },
}

impl fmt::Display for NoActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restricted => write!(f, "rebuy restricted"),
            Self::RiseStreakVeto { rise_days } => write!(f, "rise streak of {rise_days} days"),
            Self::AllStagesFilled => write!(f, "all stages filled"),
            Self::NoDropBand => write!(f, "no drop band configured"),
            Self::DropOutsideBand { drop, min, max } => {
                write!(f, "drop {:.2}% outside band {}-{}%", drop, min, max)
            }
            Self::DropBelowThreshold { drop, threshold } => {
                write!(f, "drop {:.2}% below {}%", drop, threshold)
            }
            Self::InsufficientSupport { satisfied, required } => {
                write!(f, "support {satisfied}/{required}")
            }
            Self::BelowMinimumAmount { amount } => write!(f, "order amount {} below minimum", amount),
        }
    }
}

/// Pure stage-entry rules.
#[derive(Debug, Clone)]
pub struct StageBuyPlanner {
    config: StageConfig,
    support: SupportConditionEvaluator,
    sizer: StageSizer,
}

impl StageBuyPlanner {
    pub fn new(config: StageConfig, support: SupportConditionEvaluator) -> Self {
        let sizer = StageSizer::new(config.clone());
        Self {
            config,
            support,
            sizer,
        }
    }

    pub fn support(&self) -> &SupportConditionEvaluator {
        &self.support
    }

    /// Decide whether the lowest unfilled stage should be bought now.
    ///
    /// `as_of` for the restriction check is the snapshot's market date,
    /// resolved by the caller.
    pub fn evaluate_stage(
        &self,
        instrument: &TrackedInstrument,
        position: Option<&Position>,
        snapshot: &MarketSnapshot,
        restrictions: &RebuyRestrictionRegistry,
    ) -> StageDecision {
        let stage = match position {
            None => Stage::First,
            Some(pos) => match pos.next_stage() {
                Some(stage) => stage,
                None => return StageDecision::NoAction(NoActionReason::AllStagesFilled),
            },
        };

        if stage == Stage::First
            && restrictions.is_restricted_at(&instrument.instrument, snapshot.as_of)
        {
            return StageDecision::NoAction(NoActionReason::Restricted);
        }

        if self.sizer.multiplier(instrument).is_none() {
            return StageDecision::NoAction(NoActionReason::RiseStreakVeto {
                rise_days: instrument.rise_days,
            });
        }

        let Some(band) = self.config.band_for(instrument.rise_rate) else {
            return StageDecision::NoAction(NoActionReason::NoDropBand);
        };

        let drop = instrument.drop_from_peak(snapshot.price);
        let threshold = self.config.threshold(band, stage);

        if stage == Stage::First {
            if drop < band.drop_min || drop > band.drop_max {
                return StageDecision::NoAction(NoActionReason::DropOutsideBand {
                    drop,
                    min: band.drop_min,
                    max: band.drop_max,
                });
            }
        } else if drop < threshold {
            return StageDecision::NoAction(NoActionReason::DropBelowThreshold { drop, threshold });
        }

        let score: SupportScore = self.support.score(snapshot);
        let required = self.config.required(stage);
        if score.satisfied() < required {
            return StageDecision::NoAction(NoActionReason::InsufficientSupport {
                satisfied: score.satisfied(),
                required,
            });
        }

        match self.sizer.size(stage, instrument, snapshot.price) {
            Ok(size) => {
                debug!(
                    instrument = %instrument.instrument,
                    stage = stage.number(),
                    drop = %drop.round_dp(2),
                    support = score.satisfied(),
                    quantity = size.quantity,
                    "Stage conditions met"
                );
                StageDecision::Enter {
                    stage,
                    quantity: size.quantity,
                    limit_price: snapshot.price,
                }
            }
            Err(SizeRejection::RiseStreakVeto { rise_days }) => {
                StageDecision::NoAction(NoActionReason::RiseStreakVeto { rise_days })
            }
            Err(SizeRejection::BelowMinimum { amount }) => {
                StageDecision::NoAction(NoActionReason::BelowMinimumAmount { amount })
            }
        }
    }
}
