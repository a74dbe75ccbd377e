//! Data models for tracked instruments, staged positions, orders and exits.

mod exit;
mod instrument;
mod market;
mod order;
mod position;

pub use exit::{ExitEvent, ExitReason, RestrictionEntry};
pub use instrument::TrackedInstrument;
pub use market::{IndicatorUpdate, Indicators, MarketSnapshot, Tick};
pub use order::{
    FillEvent, FillLeg, OrderAck, OrderIntent, OrderPrice, OrderPurpose, OrderSide, OrderState,
    OrderStatusReport,
};
pub use position::{Position, PositionStatus, Stage, StageFill};
