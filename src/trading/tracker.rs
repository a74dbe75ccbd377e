//! Position bookkeeping: stage fills in, full liquidation out.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::error::LifecycleError;
use crate::models::{Position, StageFill};

/// Result of applying a stage fill.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Fill recorded; carries the updated position
    Applied(Position),
    /// Execution seen before; position unchanged
    Duplicate(Position),
}

impl FillOutcome {
    pub fn position(&self) -> &Position {
        match self {
            FillOutcome::Applied(p) | FillOutcome::Duplicate(p) => p,
        }
    }
}

/// Owns the open positions, keyed by instrument.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    positions: HashMap<String, Position>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-install a persisted position.
    pub fn restore(&mut self, position: Position) {
        self.positions.insert(position.instrument.clone(), position);
    }

    pub fn get(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn get_mut(&mut self, instrument: &str) -> Option<&mut Position> {
        self.positions.get_mut(instrument)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Apply a stage fill.
    ///
    /// A stage order may fill in pieces: a piece with an unseen execution id
    /// is merged into the stage, a known execution id is a duplicate. Without
    /// execution ids only an exact repeat of the recorded fill is accepted as
    /// a duplicate. A different order filling an already filled stage, or a
    /// stage skipping ahead, is an error.
    pub fn apply_fill(
        &mut self,
        instrument: &str,
        fill: StageFill,
    ) -> Result<FillOutcome, LifecycleError> {
        if fill.quantity == 0 || fill.price <= Decimal::ZERO {
            return Err(LifecycleError::InvalidFill {
                instrument: instrument.to_string(),
                quantity: fill.quantity,
                price: fill.price.to_string(),
            });
        }

        match self.positions.get_mut(instrument) {
            None => {
                if fill.stage.number() != 1 {
                    return Err(LifecycleError::StageOutOfOrder {
                        instrument: instrument.to_string(),
                        stage: fill.stage,
                        expected: 1,
                    });
                }

                info!(
                    instrument = %instrument,
                    price = %fill.price,
                    quantity = fill.quantity,
                    "Position opened"
                );
                let position = Position::open(instrument, fill);
                self.positions.insert(instrument.to_string(), position.clone());
                Ok(FillOutcome::Applied(position))
            }
            Some(position) => {
                if let Some(existing) = position.fill_for(fill.stage) {
                    if existing.order_id != fill.order_id {
                        return Err(LifecycleError::StageAlreadyFilled {
                            instrument: instrument.to_string(),
                            stage: fill.stage,
                            existing: existing.order_id.clone(),
                            incoming: fill.order_id,
                        });
                    }

                    let seen = fill.executions.iter().filter(|e| existing.has_execution(e)).count();
                    let duplicate = if fill.executions.is_empty() {
                        existing.quantity == fill.quantity && existing.price == fill.price
                    } else {
                        seen == fill.executions.len()
                    };
                    if duplicate {
                        debug!(
                            instrument = %instrument,
                            stage = fill.stage.number(),
                            order_id = %fill.order_id,
                            "Duplicate stage fill ignored"
                        );
                        return Ok(FillOutcome::Duplicate(position.clone()));
                    }
                    if fill.executions.is_empty() || seen > 0 {
                        return Err(LifecycleError::AmbiguousFill {
                            instrument: instrument.to_string(),
                            stage: fill.stage,
                            order_id: fill.order_id,
                        });
                    }

                    let stage = fill.stage.number();
                    let piece = fill.quantity;
                    position.merge_fill(fill);
                    info!(
                        instrument = %instrument,
                        stage = stage,
                        piece = piece,
                        quantity = position.quantity,
                        average_cost = %position.average_cost.round_dp(4),
                        "Partial stage fill merged"
                    );
                    return Ok(FillOutcome::Applied(position.clone()));
                }

                let expected = position.stages_filled() + 1;
                if fill.stage.number() != expected {
                    return Err(LifecycleError::StageOutOfOrder {
                        instrument: instrument.to_string(),
                        stage: fill.stage,
                        expected,
                    });
                }

                let stage = fill.stage.number();
                position.add_fill(fill);
                info!(
                    instrument = %instrument,
                    stage = stage,
                    quantity = position.quantity,
                    average_cost = %position.average_cost.round_dp(4),
                    "Stage added to position"
                );
                Ok(FillOutcome::Applied(position.clone()))
            }
        }
    }

    /// Close the whole position.
    ///
    /// `quantity` must equal the aggregate held; anything else is a fatal
    /// invariant violation and the position is left untouched.
    pub fn apply_liquidation(
        &mut self,
        instrument: &str,
        price: Decimal,
        quantity: u64,
    ) -> Result<Position, LifecycleError> {
        let held = self
            .positions
            .get(instrument)
            .map(|p| p.quantity)
            .ok_or_else(|| LifecycleError::NoOpenPosition {
                instrument: instrument.to_string(),
            })?;

        if held != quantity {
            return Err(LifecycleError::LiquidationMismatch {
                instrument: instrument.to_string(),
                held,
                liquidated: quantity,
            });
        }

        let closed = self
            .positions
            .remove(instrument)
            .ok_or_else(|| LifecycleError::NoOpenPosition {
                instrument: instrument.to_string(),
            })?;

        info!(
            instrument = %instrument,
            price = %price,
            quantity = quantity,
            pnl = %closed.unrealized_pnl(price).round_dp(2),
            "Position liquidated"
        );
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fill(stage: Stage, price: Decimal, quantity: u64, order_id: &str) -> StageFill {
        StageFill {
            stage,
            price,
            quantity,
            order_id: order_id.to_string(),
            filled_at: Utc::now(),
            executions: Vec::new(),
        }
    }

    #[test]
    fn test_duplicate_fill_is_noop() {
        let mut tracker = PositionTracker::new();
        tracker
            .apply_fill("005930", fill(Stage::First, dec!(750), 666, "a"))
            .unwrap();

        let outcome = tracker
            .apply_fill("005930", fill(Stage::First, dec!(750), 666, "a"))
            .unwrap();
        assert!(matches!(outcome, FillOutcome::Duplicate(_)));
        assert_eq!(outcome.position().quantity, 666);
        assert_eq!(tracker.get("005930").unwrap().fills.len(), 1);
    }

    fn piece(price: Decimal, quantity: u64, execution_id: &str) -> StageFill {
        StageFill {
            executions: vec![execution_id.to_string()],
            ..fill(Stage::First, price, quantity, "a")
        }
    }

    #[test]
    fn test_partial_pieces_of_one_order_merge() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill("005930", piece(dec!(750), 400, "e1")).unwrap();

        let outcome = tracker.apply_fill("005930", piece(dec!(748), 266, "e2")).unwrap();
        assert!(matches!(outcome, FillOutcome::Applied(_)));
        let pos = outcome.position();
        assert_eq!(pos.quantity, 666);
        assert_eq!(pos.stages_filled(), 1);
        assert_eq!(
            pos.average_cost,
            (dec!(750) * dec!(400) + dec!(748) * dec!(266)) / dec!(666)
        );

        // replayed execution
        let outcome = tracker.apply_fill("005930", piece(dec!(748), 266, "e2")).unwrap();
        assert!(matches!(outcome, FillOutcome::Duplicate(_)));
        assert_eq!(tracker.get("005930").unwrap().quantity, 666);
    }

    #[test]
    fn test_unidentified_second_piece_is_ambiguous() {
        let mut tracker = PositionTracker::new();
        tracker
            .apply_fill("005930", fill(Stage::First, dec!(750), 400, "a"))
            .unwrap();

        let err = tracker
            .apply_fill("005930", fill(Stage::First, dec!(750), 266, "a"))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AmbiguousFill { .. }));
        assert_eq!(tracker.get("005930").unwrap().quantity, 400);
    }

    #[test]
    fn test_second_order_for_filled_stage_is_rejected() {
        let mut tracker = PositionTracker::new();
        tracker
            .apply_fill("005930", fill(Stage::First, dec!(750), 666, "a"))
            .unwrap();

        let err = tracker
            .apply_fill("005930", fill(Stage::First, dec!(745), 100, "b"))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::StageAlreadyFilled { .. }));
        assert_eq!(tracker.get("005930").unwrap().quantity, 666);
    }

    #[test]
    fn test_out_of_order_stage() {
        let mut tracker = PositionTracker::new();
        let err = tracker
            .apply_fill("005930", fill(Stage::Second, dec!(700), 100, "a"))
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::StageOutOfOrder {
                instrument: "005930".to_string(),
                stage: Stage::Second,
                expected: 1
            }
        );
    }

    #[test]
    fn test_average_cost_over_stages() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill("005930", fill(Stage::First, dec!(750), 666, "a")).unwrap();
        tracker.apply_fill("005930", fill(Stage::Second, dec!(740), 405, "b")).unwrap();
        let outcome = tracker
            .apply_fill("005930", fill(Stage::Third, dec!(705), 283, "c"))
            .unwrap();

        let pos = outcome.position();
        let expected = (dec!(750) * dec!(666) + dec!(740) * dec!(405) + dec!(705) * dec!(283))
            / dec!(1354);
        assert_eq!(pos.quantity, 1354);
        assert_eq!(pos.average_cost, expected);
    }

    #[test]
    fn test_liquidation_requires_full_quantity() {
        let mut tracker = PositionTracker::new();
        tracker.apply_fill("005930", fill(Stage::First, dec!(750), 666, "a")).unwrap();

        let err = tracker.apply_liquidation("005930", dec!(735), 600).unwrap_err();
        assert!(matches!(err, LifecycleError::LiquidationMismatch { held: 666, liquidated: 600, .. }));
        assert!(tracker.get("005930").is_some());

        let closed = tracker.apply_liquidation("005930", dec!(735), 666).unwrap();
        assert_eq!(closed.quantity, 666);
        assert!(tracker.get("005930").is_none());
    }

    #[test]
    fn test_liquidation_without_position() {
        let mut tracker = PositionTracker::new();
        let err = tracker.apply_liquidation("005930", dec!(735), 1).unwrap_err();
        assert!(matches!(err, LifecycleError::NoOpenPosition { .. }));
    }
}
