//! Invariant violations raised while applying fills and liquidations.

use thiserror::Error;

use crate::models::Stage;

/// Broken lifecycle invariant. Never coerced; the controller freezes the
/// instrument and alerts when one surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// A second, different order reported a fill for an already filled stage
    #[error("{instrument}: {stage} already filled by order {existing}, got fill from {incoming}")]
    StageAlreadyFilled {
        instrument: String,
        stage: Stage,
        existing: String,
        incoming: String,
    },

    /// A stage filled before the stage below it
    #[error("{instrument}: {stage} filled out of order, expected stage {expected}")]
    StageOutOfOrder {
        instrument: String,
        stage: Stage,
        expected: u8,
    },

    /// Fill with zero quantity or non-positive price
    #[error("{instrument}: invalid fill {quantity} @ {price}")]
    InvalidFill {
        instrument: String,
        quantity: u64,
        price: String,
    },

    /// Liquidation for an instrument with no open position
    #[error("{instrument}: liquidation without an open position")]
    NoOpenPosition { instrument: String },

    /// Liquidation quantity differs from the position held
    #[error("{instrument}: liquidation of {liquidated} does not match held quantity {held}")]
    LiquidationMismatch {
        instrument: String,
        held: u64,
        liquidated: u64,
    },

    /// Exit fills exceed the position being liquidated
    #[error("{instrument}: exit fills total {filled}, exceeding held quantity {held}")]
    ExitOverfill {
        instrument: String,
        held: u64,
        filled: u64,
    },

    /// Another fill for a stage order that carries no execution id and does
    /// not repeat the recorded fill, so it cannot be told apart from a replay
    #[error("{instrument}: cannot tell fill for {stage} of order {order_id} from a duplicate")]
    AmbiguousFill {
        instrument: String,
        stage: Stage,
        order_id: String,
    },

    /// Entry fills exceed the quantity ordered
    #[error("{instrument}: order {order_id} filled {filled} of {ordered} ordered")]
    EntryOverfill {
        instrument: String,
        order_id: String,
        ordered: u64,
        filled: u64,
    },

    /// Status query reports fewer shares than the fills already applied
    #[error("{instrument}: order {order_id} reported {reported} filled, {recorded} already recorded")]
    StatusMismatch {
        instrument: String,
        order_id: String,
        reported: u64,
        recorded: u64,
    },

    /// Execution report that the controller never asked for
    #[error("{instrument}: unexpected fill for order {order_id}")]
    UnexpectedFill { instrument: String, order_id: String },
}
