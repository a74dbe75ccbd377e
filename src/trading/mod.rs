//! Trading logic: stage planning, support scoring, exits, rebuy restrictions
//! and the lifecycle controller that ties them together.

mod config;
mod controller;
mod error;
mod exit_policy;
mod planner;
mod restriction;
mod sizing;
mod support;
mod tracker;

pub use config::{
    ControllerConfig, DropBand, ExitConfig, MarketConfig, RestrictionConfig, RiseRateRatio,
    RuntimeConfig, StageConfig, SupportConfig,
};
pub use controller::{
    Command, ControlEvent, LifecycleState, LifecycleView, OrderLogStatus, PositionController,
    RestoredLifecycle,
};
pub use error::LifecycleError;
pub use exit_policy::{ExitDecision, ExitPolicyEvaluator};
pub use planner::{NoActionReason, StageBuyPlanner, StageDecision};
pub use restriction::{add_trading_days, RebuyRestrictionRegistry};
pub use sizing::{SizeRejection, StageSize, StageSizer};
pub use support::{SupportConditionEvaluator, SupportScore};
pub use tracker::{FillOutcome, PositionTracker};
