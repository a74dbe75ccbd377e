//! Position lifecycle controller.
//!
//! Drives each instrument through
//! `Idle -> Tracking -> PartiallyEntered(n) -> ExitPending -> Cooldown -> Idle`.
//! The controller is synchronous and owns all lifecycle state; every handler
//! returns the [`Command`]s the runtime must carry out (order submission,
//! persistence, alerts). Broken invariants freeze the instrument until an
//! operator releases it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Offset, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::config::ControllerConfig;
use super::error::LifecycleError;
use super::exit_policy::ExitPolicyEvaluator;
use super::planner::{StageBuyPlanner, StageDecision};
use super::restriction::RebuyRestrictionRegistry;
use super::support::SupportConditionEvaluator;
use super::tracker::{FillOutcome, PositionTracker};
use crate::models::{
    ExitEvent, ExitReason, FillEvent, FillLeg, IndicatorUpdate, Indicators, MarketSnapshot,
    OrderIntent, OrderPrice, OrderPurpose, OrderSide, OrderState, OrderStatusReport, Position,
    RestrictionEntry, Stage, StageFill, Tick, TrackedInstrument,
};

/// Lifecycle state of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Idle,
    Tracking,
    PartiallyEntered(u8),
    ExitPending,
    Cooldown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Tracking => write!(f, "tracking"),
            LifecycleState::PartiallyEntered(n) => write!(f, "entered({n})"),
            LifecycleState::ExitPending => write!(f, "exit_pending"),
            LifecycleState::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// Order log status transitions reported to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLogStatus {
    Accepted,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

impl OrderLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderLogStatus::Accepted => "accepted",
            OrderLogStatus::Filled => "filled",
            OrderLogStatus::PartiallyFilled => "partially_filled",
            OrderLogStatus::Rejected => "rejected",
            OrderLogStatus::Cancelled => "cancelled",
        }
    }
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(OrderIntent),
    QueryOrder { instrument: String, order_id: String },
    SaveInstrument(TrackedInstrument),
    RemoveInstrument { instrument: String },
    SavePosition(Position),
    DeletePosition { instrument: String },
    RecordExit(RestrictionEntry),
    OrderUpdate {
        order_id: String,
        status: OrderLogStatus,
        detail: Option<String>,
    },
    Freeze { instrument: String, reason: String },
    Unfreeze { instrument: String },
    Alert { instrument: String, message: String },
}

/// Inbound event for the controller.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Track(TrackedInstrument),
    Untrack { instrument: String },
    Tick(Tick),
    Indicators(IndicatorUpdate),
    Fill(FillEvent),
    Accepted { instrument: String, order_id: String },
    Rejected { instrument: String, order_id: String, reason: String },
    OrderStatus(OrderStatusReport),
    Liquidate { instrument: String },
    Release { instrument: String },
    Heartbeat { now: DateTime<Utc> },
}

impl ControlEvent {
    /// Instrument the event is addressed to; `None` for broadcasts.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            ControlEvent::Track(i) => Some(&i.instrument),
            ControlEvent::Tick(t) => Some(&t.instrument),
            ControlEvent::Indicators(u) => Some(&u.instrument),
            ControlEvent::Fill(f) => Some(&f.instrument),
            ControlEvent::OrderStatus(r) => Some(&r.instrument),
            ControlEvent::Untrack { instrument }
            | ControlEvent::Accepted { instrument, .. }
            | ControlEvent::Rejected { instrument, .. }
            | ControlEvent::Liquidate { instrument }
            | ControlEvent::Release { instrument } => Some(instrument),
            ControlEvent::Heartbeat { .. } => None,
        }
    }
}

/// Persisted lifecycle handed back on restart.
#[derive(Debug, Clone)]
pub struct RestoredLifecycle {
    pub instrument: TrackedInstrument,
    pub position: Option<Position>,
    pub frozen: Option<String>,
    /// Orders that had not reached a final status, with submission time
    pub open_orders: Vec<(OrderIntent, DateTime<Utc>)>,
}

/// Read-only view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleView {
    pub instrument: String,
    pub state: LifecycleState,
    pub frozen: Option<String>,
    pub stale: bool,
    pub peak_price: Decimal,
    pub rise_rate: Decimal,
    pub last_price: Option<Decimal>,
    pub position: Option<Position>,
    pub pending_order: Option<String>,
    pub restricted_until: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
struct PendingOrder {
    intent: OrderIntent,
    submitted_at: DateTime<Utc>,
    last_check: DateTime<Utc>,
    accepted: bool,
    /// Entry orders only: shares and notional filled so far
    filled: u64,
    notional: Decimal,
}

impl PendingOrder {
    fn new(intent: OrderIntent, now: DateTime<Utc>) -> Self {
        Self {
            intent,
            submitted_at: now,
            last_check: now,
            accepted: false,
            filled: 0,
            notional: Decimal::ZERO,
        }
    }

    fn timed_out(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        now - self.last_check > Duration::seconds(timeout_secs)
    }
}

enum ExitProgress {
    Duplicate,
    Overfilled { held: u64, filled: u64 },
    Complete,
    Partial { order_done: bool },
}

/// Liquidation in progress. May span several orders when a remainder has to
/// be force-liquidated.
#[derive(Debug, Clone)]
struct PendingExit {
    reason: ExitReason,
    order: Option<PendingOrder>,
    order_ids: HashSet<String>,
    /// Quantity filled against the current order
    order_filled: u64,
    filled: u64,
    notional: Decimal,
    executions: HashSet<String>,
}

impl PendingExit {
    fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            order: None,
            order_ids: HashSet::new(),
            order_filled: 0,
            filled: 0,
            notional: Decimal::ZERO,
            executions: HashSet::new(),
        }
    }

    fn submit(&mut self, intent: OrderIntent, now: DateTime<Utc>) {
        self.order_ids.insert(intent.order_id.clone());
        self.order_filled = 0;
        self.order = Some(PendingOrder::new(intent, now));
    }

    fn is_current(&self, order_id: &str) -> bool {
        self.order
            .as_ref()
            .map_or(false, |o| o.intent.order_id == order_id)
    }

    fn record(&mut self, fill: &FillEvent, held: u64) -> ExitProgress {
        if let Some(exec) = &fill.execution_id {
            if !self.executions.insert(exec.clone()) {
                return ExitProgress::Duplicate;
            }
        }

        self.filled += fill.quantity;
        self.notional += fill.price * Decimal::from(fill.quantity);
        if self.is_current(&fill.order_id) {
            self.order_filled += fill.quantity;
        }

        if self.filled > held {
            return ExitProgress::Overfilled {
                held,
                filled: self.filled,
            };
        }
        if self.filled == held {
            return ExitProgress::Complete;
        }

        let order_done = self
            .order
            .as_ref()
            .map_or(false, |o| self.order_filled >= o.intent.quantity);
        ExitProgress::Partial { order_done }
    }

    fn average_price(&self) -> Decimal {
        if self.filled == 0 {
            return Decimal::ZERO;
        }
        self.notional / Decimal::from(self.filled)
    }
}

#[derive(Debug, Clone)]
struct Lifecycle {
    instrument: TrackedInstrument,
    state: LifecycleState,
    last_tick: Option<Tick>,
    indicators: Indicators,
    stale: bool,
    pending_entry: Option<PendingOrder>,
    entry_retry_after: Option<DateTime<Utc>>,
    pending_exit: Option<PendingExit>,
    frozen: Option<String>,
}

impl Lifecycle {
    fn new(instrument: TrackedInstrument, state: LifecycleState) -> Self {
        Self {
            instrument,
            state,
            last_tick: None,
            indicators: Indicators::default(),
            stale: false,
            pending_entry: None,
            entry_retry_after: None,
            pending_exit: None,
            frozen: None,
        }
    }

    fn id(&self) -> &str {
        &self.instrument.instrument
    }

    fn last_price(&self) -> Option<Decimal> {
        self.last_tick.as_ref().map(|t| t.price)
    }

    fn pending_entry_is(&self, order_id: &str) -> bool {
        self.pending_entry
            .as_ref()
            .map_or(false, |p| p.intent.order_id == order_id)
    }
}

/// Staged position lifecycle controller.
pub struct PositionController {
    config: ControllerConfig,
    planner: StageBuyPlanner,
    exits: ExitPolicyEvaluator,
    tracker: PositionTracker,
    restrictions: RebuyRestrictionRegistry,
    lifecycles: HashMap<String, Lifecycle>,
    clock: Option<DateTime<Utc>>,
}

impl PositionController {
    pub fn new(config: ControllerConfig) -> Self {
        let support = SupportConditionEvaluator::new(config.support.clone());
        let planner = StageBuyPlanner::new(config.stages.clone(), support);
        let exits = ExitPolicyEvaluator::new(config.exit.clone());
        let restrictions =
            RebuyRestrictionRegistry::new(config.restriction.clone(), config.market.clone());

        Self {
            config,
            planner,
            exits,
            tracker: PositionTracker::new(),
            restrictions,
            lifecycles: HashMap::new(),
            clock: None,
        }
    }

    /// Dispatch one inbound event.
    pub fn handle(&mut self, event: ControlEvent) -> Vec<Command> {
        match event {
            ControlEvent::Track(instrument) => self.track(instrument),
            ControlEvent::Untrack { instrument } => self.untrack(&instrument),
            ControlEvent::Tick(tick) => self.on_tick(tick),
            ControlEvent::Indicators(update) => self.on_indicators(update),
            ControlEvent::Fill(fill) => self.on_fill(fill),
            ControlEvent::Accepted {
                instrument,
                order_id,
            } => self.on_accepted(&instrument, &order_id),
            ControlEvent::Rejected {
                instrument,
                order_id,
                reason,
            } => self.on_reject(&instrument, &order_id, &reason),
            ControlEvent::OrderStatus(report) => self.on_order_status(report),
            ControlEvent::Liquidate { instrument } => self.liquidate(&instrument),
            ControlEvent::Release { instrument } => self.release(&instrument),
            ControlEvent::Heartbeat { now } => self.on_heartbeat(now),
        }
    }

    // ==================== Registration ====================

    /// Start tracking an instrument. Restricted instruments are refused.
    pub fn track(&mut self, instrument: TrackedInstrument) -> Vec<Command> {
        self.advance_clock(instrument.discovered_at);
        let id = instrument.instrument.clone();

        if instrument.peak_price <= Decimal::ZERO {
            warn!(instrument = %id, "Registration without a positive peak price ignored");
            return Vec::new();
        }

        if let Some(lc) = self.lifecycles.get_mut(&id) {
            if lc.state == LifecycleState::Tracking && lc.pending_entry.is_none() {
                debug!(instrument = %id, "Tracked instrument refreshed");
                lc.instrument = instrument.clone();
                return vec![Command::SaveInstrument(instrument)];
            }
            debug!(instrument = %id, state = %lc.state, "Registration ignored, lifecycle active");
            return Vec::new();
        }

        if self.restrictions.is_restricted_at(&id, self.now()) {
            info!(
                instrument = %id,
                until = ?self.restrictions.restricted_until(&id),
                "Registration refused, rebuy restricted"
            );
            return Vec::new();
        }

        info!(
            instrument = %id,
            peak = %instrument.peak_price,
            rise_rate = %instrument.rise_rate.round_dp(2),
            rise_days = instrument.rise_days,
            "Tracking instrument"
        );
        self.lifecycles.insert(
            id,
            Lifecycle::new(instrument.clone(), LifecycleState::Tracking),
        );
        vec![Command::SaveInstrument(instrument)]
    }

    /// Stop tracking an instrument that has no position or order in flight.
    pub fn untrack(&mut self, instrument: &str) -> Vec<Command> {
        match self.lifecycles.get(instrument) {
            Some(lc) if lc.state == LifecycleState::Tracking && lc.pending_entry.is_none() => {
                self.lifecycles.remove(instrument);
                info!(instrument = %instrument, "Stopped tracking");
                vec![Command::RemoveInstrument {
                    instrument: instrument.to_string(),
                }]
            }
            Some(lc) => {
                warn!(instrument = %instrument, state = %lc.state, "Cannot untrack an active lifecycle");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Re-install a lifecycle from persistence.
    pub fn restore(&mut self, restored: RestoredLifecycle) {
        let id = restored.instrument.instrument.clone();
        let mut lc = Lifecycle::new(restored.instrument, LifecycleState::Tracking);
        lc.frozen = restored.frozen;

        if let Some(position) = restored.position {
            lc.state = LifecycleState::PartiallyEntered(position.stages_filled());
            self.tracker.restore(position);
        }

        for (intent, submitted_at) in restored.open_orders {
            match intent.purpose {
                OrderPurpose::Entry(stage) => {
                    let mut order = PendingOrder::new(intent, submitted_at);
                    order.accepted = true;
                    if let Some(fill) = self
                        .tracker
                        .get(&id)
                        .and_then(|p| p.fill_for(stage))
                        .filter(|f| f.order_id == order.intent.order_id)
                    {
                        order.filled = fill.quantity;
                        order.notional = fill.notional();
                    }
                    lc.pending_entry = Some(order);
                }
                OrderPurpose::Exit(reason) if self.tracker.get(&id).is_some() => {
                    let mut exit = PendingExit::new(reason);
                    exit.submit(intent, submitted_at);
                    lc.pending_exit = Some(exit);
                    lc.state = LifecycleState::ExitPending;
                }
                OrderPurpose::Exit(_) => {
                    warn!(instrument = %id, order_id = %intent.order_id, "Open exit order without a position");
                }
            }
        }

        if lc.state == LifecycleState::Tracking
            && lc.pending_entry.is_none()
            && self.restrictions.is_restricted_at(&id, self.now())
        {
            lc.state = LifecycleState::Cooldown;
        }

        info!(instrument = %id, state = %lc.state, frozen = lc.frozen.is_some(), "Lifecycle restored");
        self.lifecycles.insert(id, lc);
    }

    /// Seed the restriction registry from persisted history.
    pub fn load_restrictions(&mut self, entries: Vec<RestrictionEntry>) {
        self.restrictions.load(entries);
    }

    // ==================== Market Data ====================

    pub fn on_tick(&mut self, tick: Tick) -> Vec<Command> {
        self.advance_clock(tick.timestamp);
        if tick.price <= Decimal::ZERO {
            warn!(instrument = %tick.instrument, price = %tick.price, "Non-positive tick price ignored");
            return Vec::new();
        }

        let Some(mut lc) = self.lifecycles.remove(&tick.instrument) else {
            trace!(instrument = %tick.instrument, "Tick for unmanaged instrument");
            return Vec::new();
        };

        let now = tick.timestamp;
        lc.last_tick = Some(tick);
        if lc.stale {
            info!(instrument = %lc.id(), "Market data resumed");
            lc.stale = false;
        }

        let mut out = Vec::new();
        self.evaluate(&mut lc, now, &mut out);
        self.settle(lc);
        out
    }

    pub fn on_indicators(&mut self, update: IndicatorUpdate) -> Vec<Command> {
        if let Some(lc) = self.lifecycles.get_mut(&update.instrument) {
            lc.indicators = update.indicators;
        }
        Vec::new()
    }

    // ==================== Order Events ====================

    pub fn on_fill(&mut self, fill: FillEvent) -> Vec<Command> {
        self.advance_clock(fill.timestamp);
        let mut out = Vec::new();

        let mut lc = match self.lifecycles.remove(&fill.instrument) {
            Some(lc) => lc,
            None => match fill.leg {
                FillLeg::Stage(_) => {
                    warn!(
                        instrument = %fill.instrument,
                        order_id = %fill.order_id,
                        "Stage fill for unmanaged instrument, adopting position"
                    );
                    out.push(Command::Alert {
                        instrument: fill.instrument.clone(),
                        message: format!("adopted untracked fill from order {}", fill.order_id),
                    });
                    let instrument = TrackedInstrument::new(
                        &fill.instrument,
                        fill.price,
                        Decimal::ZERO,
                        1,
                        fill.timestamp,
                    );
                    out.push(Command::SaveInstrument(instrument.clone()));
                    Lifecycle::new(instrument, LifecycleState::Tracking)
                }
                FillLeg::Exit => {
                    error!(
                        instrument = %fill.instrument,
                        order_id = %fill.order_id,
                        "Exit fill for unmanaged instrument"
                    );
                    out.push(Command::Alert {
                        instrument: fill.instrument.clone(),
                        message: format!("exit fill from unknown order {}", fill.order_id),
                    });
                    return out;
                }
            },
        };

        match fill.leg {
            FillLeg::Stage(stage) if self.completed_stage_order(&lc, stage, &fill.order_id) => {
                debug!(
                    instrument = %fill.instrument,
                    order_id = %fill.order_id,
                    "Late fill for a completed stage order ignored"
                );
            }
            FillLeg::Stage(stage) => {
                let stage_fill = StageFill {
                    stage,
                    price: fill.price,
                    quantity: fill.quantity,
                    order_id: fill.order_id,
                    filled_at: fill.timestamp,
                    executions: fill.execution_id.into_iter().collect(),
                };
                self.apply_stage_fill(&mut lc, stage_fill, &mut out);
            }
            FillLeg::Exit => self.apply_exit_fill(&mut lc, fill, &mut out),
        }

        self.settle(lc);
        out
    }

    pub fn on_accepted(&mut self, instrument: &str, order_id: &str) -> Vec<Command> {
        let Some(lc) = self.lifecycles.get_mut(instrument) else {
            return Vec::new();
        };

        let mut matched = false;
        if let Some(order) = lc
            .pending_entry
            .as_mut()
            .filter(|o| o.intent.order_id == order_id)
        {
            order.accepted = true;
            matched = true;
        }
        if let Some(order) = lc
            .pending_exit
            .as_mut()
            .and_then(|e| e.order.as_mut())
            .filter(|o| o.intent.order_id == order_id)
        {
            order.accepted = true;
            matched = true;
        }

        if !matched {
            return Vec::new();
        }
        debug!(instrument = %instrument, order_id = %order_id, "Order accepted");
        vec![Command::OrderUpdate {
            order_id: order_id.to_string(),
            status: OrderLogStatus::Accepted,
            detail: None,
        }]
    }

    pub fn on_reject(&mut self, instrument: &str, order_id: &str, reason: &str) -> Vec<Command> {
        let now = self.now();
        let Some(mut lc) = self.lifecycles.remove(instrument) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if lc.pending_entry_is(order_id) {
            lc.pending_entry = None;
            lc.entry_retry_after =
                Some(now + Duration::seconds(self.config.runtime.fill_timeout_secs));
            warn!(instrument = %instrument, order_id = %order_id, reason = %reason, "Stage entry rejected");
            out.push(Command::OrderUpdate {
                order_id: order_id.to_string(),
                status: OrderLogStatus::Rejected,
                detail: Some(reason.to_string()),
            });
        } else if let Some(exit) = lc
            .pending_exit
            .as_mut()
            .filter(|e| e.is_current(order_id))
        {
            exit.order = None;
            error!(
                instrument = %instrument,
                order_id = %order_id,
                reason = %reason,
                "Liquidation order failed, will resubmit"
            );
            out.push(Command::OrderUpdate {
                order_id: order_id.to_string(),
                status: OrderLogStatus::Rejected,
                detail: Some(reason.to_string()),
            });
            out.push(Command::Alert {
                instrument: instrument.to_string(),
                message: format!("exit order {order_id} failed: {reason}"),
            });
        } else {
            debug!(instrument = %instrument, order_id = %order_id, "Rejection for unknown order");
        }

        self.settle(lc);
        out
    }

    /// Reconcile an order whose fill did not arrive in time.
    pub fn on_order_status(&mut self, report: OrderStatusReport) -> Vec<Command> {
        let now = self.now();
        let Some(mut lc) = self.lifecycles.remove(&report.instrument) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        if lc.pending_entry_is(&report.order_id) {
            self.reconcile_entry(&mut lc, report, now, &mut out);
        } else if lc
            .pending_exit
            .as_ref()
            .map_or(false, |e| e.is_current(&report.order_id))
        {
            self.reconcile_exit(&mut lc, report, now, &mut out);
        } else {
            debug!(instrument = %report.instrument, order_id = %report.order_id, "Status for unknown order");
        }

        self.settle(lc);
        out
    }

    // ==================== Operator Actions ====================

    /// Liquidate an open position at market regardless of exit rules.
    pub fn liquidate(&mut self, instrument: &str) -> Vec<Command> {
        let now = self.now();
        let Some(mut lc) = self.lifecycles.remove(instrument) else {
            warn!(instrument = %instrument, "Manual liquidation for unmanaged instrument");
            return Vec::new();
        };
        let mut out = Vec::new();

        match lc.state {
            LifecycleState::PartiallyEntered(_) => {
                let price = lc
                    .last_price()
                    .or_else(|| self.tracker.get(instrument).map(|p| p.average_cost))
                    .unwrap_or_default();
                info!(instrument = %instrument, "Manual liquidation requested");
                self.start_exit(&mut lc, ExitReason::Manual, price, now, &mut out);
            }
            state => warn!(instrument = %instrument, state = %state, "Nothing to liquidate"),
        }

        self.settle(lc);
        out
    }

    /// Clear the frozen marker after an operator has reconciled the instrument.
    pub fn release(&mut self, instrument: &str) -> Vec<Command> {
        let Some(lc) = self.lifecycles.get_mut(instrument) else {
            return Vec::new();
        };
        let Some(reason) = lc.frozen.take() else {
            return Vec::new();
        };

        if lc.pending_exit.is_none() {
            lc.state = match self.tracker.get(instrument) {
                Some(p) => LifecycleState::PartiallyEntered(p.stages_filled()),
                None if lc.state == LifecycleState::Cooldown => LifecycleState::Cooldown,
                None => LifecycleState::Tracking,
            };
        }

        info!(instrument = %instrument, reason = %reason, state = %lc.state, "Instrument released");
        vec![Command::Unfreeze {
            instrument: instrument.to_string(),
        }]
    }

    // ==================== Heartbeat ====================

    /// Periodic check for stale data, order timeouts, tracking timeouts and
    /// cooldown expiry. Exits keep being evaluated on the last known price.
    pub fn on_heartbeat(&mut self, now: DateTime<Utc>) -> Vec<Command> {
        self.advance_clock(now);
        let ids: Vec<String> = self.lifecycles.keys().cloned().collect();
        let mut out = Vec::new();

        for id in ids {
            let Some(mut lc) = self.lifecycles.remove(&id) else {
                continue;
            };
            self.heartbeat_one(&mut lc, now, &mut out);
            self.settle(lc);
        }

        out
    }

    fn heartbeat_one(&mut self, lc: &mut Lifecycle, now: DateTime<Utc>, out: &mut Vec<Command>) {
        let staleness = self.config.runtime.staleness_secs;
        let fill_timeout = self.config.runtime.fill_timeout_secs;
        let tracking_timeout = self.config.runtime.tracking_timeout_days;

        if let Some(tick) = &lc.last_tick {
            let stale = now - tick.timestamp > Duration::seconds(staleness);
            if stale && !lc.stale {
                warn!(
                    instrument = %lc.id(),
                    last_tick = %tick.timestamp,
                    "Market data stale, entries suspended"
                );
            }
            lc.stale = stale;
        }

        if lc.state == LifecycleState::Tracking
            && lc.pending_entry.is_none()
            && lc.instrument.tracking_expired(now, tracking_timeout)
        {
            info!(instrument = %lc.id(), "Tracking abandoned without entry");
            lc.state = LifecycleState::Idle;
            out.push(Command::RemoveInstrument {
                instrument: lc.id().to_string(),
            });
            return;
        }

        let id = lc.id().to_string();
        if let Some(order) = lc.pending_entry.as_mut() {
            if order.timed_out(now, fill_timeout) {
                order.last_check = now;
                warn!(
                    instrument = %id,
                    order_id = %order.intent.order_id,
                    accepted = order.accepted,
                    waiting_secs = (now - order.submitted_at).num_seconds(),
                    "Entry order unconfirmed, querying status"
                );
                out.push(Command::QueryOrder {
                    instrument: id.clone(),
                    order_id: order.intent.order_id.clone(),
                });
            }
        }
        if let Some(order) = lc.pending_exit.as_mut().and_then(|e| e.order.as_mut()) {
            if order.timed_out(now, fill_timeout) {
                order.last_check = now;
                warn!(
                    instrument = %id,
                    order_id = %order.intent.order_id,
                    waiting_secs = (now - order.submitted_at).num_seconds(),
                    "Liquidation unconfirmed, querying status"
                );
                out.push(Command::QueryOrder {
                    instrument: id.clone(),
                    order_id: order.intent.order_id.clone(),
                });
            }
        }

        self.evaluate(lc, now, out);
    }

    // ==================== Queries ====================

    pub fn state(&self, instrument: &str) -> LifecycleState {
        self.lifecycles
            .get(instrument)
            .map_or(LifecycleState::Idle, |lc| lc.state)
    }

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.tracker.get(instrument)
    }

    pub fn is_frozen(&self, instrument: &str) -> bool {
        self.lifecycles
            .get(instrument)
            .map_or(false, |lc| lc.frozen.is_some())
    }

    pub fn restrictions(&self) -> &RebuyRestrictionRegistry {
        &self.restrictions
    }

    pub fn is_empty(&self) -> bool {
        self.lifecycles.is_empty()
    }

    pub fn view(&self, instrument: &str) -> Option<LifecycleView> {
        let lc = self.lifecycles.get(instrument)?;
        let pending_order = lc
            .pending_exit
            .as_ref()
            .and_then(|e| e.order.as_ref())
            .or(lc.pending_entry.as_ref())
            .map(|o| o.intent.order_id.clone());

        Some(LifecycleView {
            instrument: instrument.to_string(),
            state: lc.state,
            frozen: lc.frozen.clone(),
            stale: lc.stale,
            peak_price: lc.instrument.peak_price,
            rise_rate: lc.instrument.rise_rate,
            last_price: lc.last_price(),
            position: self.tracker.get(instrument).cloned(),
            pending_order,
            restricted_until: self.restrictions.restricted_until(instrument),
        })
    }

    pub fn views(&self) -> Vec<LifecycleView> {
        let mut ids: Vec<&String> = self.lifecycles.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.view(id)).collect()
    }

    // ==================== Internals ====================

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn advance_clock(&mut self, ts: DateTime<Utc>) {
        self.clock = Some(self.clock.map_or(ts, |c| c.max(ts)));
    }

    /// Put the lifecycle back unless it has returned to Idle.
    fn settle(&mut self, lc: Lifecycle) {
        if lc.state != LifecycleState::Idle {
            self.lifecycles.insert(lc.id().to_string(), lc);
        }
    }

    fn evaluate(&mut self, lc: &mut Lifecycle, now: DateTime<Utc>, out: &mut Vec<Command>) {
        if lc.state == LifecycleState::Cooldown {
            self.check_cooldown(lc, now, out);
            return;
        }

        let Some(price) = lc.last_price() else {
            return;
        };

        match lc.state {
            LifecycleState::Tracking => {
                let offset = self.config.market.offset().unwrap_or_else(|| Utc.fix());
                if lc.pending_entry.is_none() && lc.instrument.observe_high(price, now, offset) {
                    debug!(
                        instrument = %lc.id(),
                        peak = %price,
                        rise_rate = %lc.instrument.rise_rate.round_dp(2),
                        rise_days = lc.instrument.rise_days,
                        "New peak"
                    );
                    out.push(Command::SaveInstrument(lc.instrument.clone()));
                }
                self.try_enter(lc, now, out);
            }
            LifecycleState::PartiallyEntered(_) => {
                if !self.check_exit(lc, price, now, out) {
                    self.try_enter(lc, now, out);
                }
            }
            LifecycleState::ExitPending => self.resubmit_exit(lc, price, now, out),
            LifecycleState::Idle | LifecycleState::Cooldown => {}
        }
    }

    fn try_enter(&mut self, lc: &mut Lifecycle, now: DateTime<Utc>, out: &mut Vec<Command>) {
        if lc.frozen.is_some() || lc.pending_entry.is_some() || lc.stale {
            return;
        }
        if lc.entry_retry_after.map_or(false, |t| now < t) {
            return;
        }
        let Some(tick) = lc.last_tick.as_ref() else {
            return;
        };

        let snapshot = MarketSnapshot::from_tick(tick, &lc.indicators);
        let decision = self.planner.evaluate_stage(
            &lc.instrument,
            self.tracker.get(lc.id()),
            &snapshot,
            &self.restrictions,
        );

        match decision {
            StageDecision::Enter {
                stage,
                quantity,
                limit_price,
            } => {
                let intent = entry_intent(lc.id(), stage, quantity, limit_price, now);
                info!(
                    instrument = %lc.id(),
                    stage = stage.number(),
                    quantity = quantity,
                    price = %limit_price,
                    order_id = %intent.order_id,
                    "Stage entry submitted"
                );
                lc.entry_retry_after = None;
                lc.pending_entry = Some(PendingOrder::new(intent.clone(), now));
                out.push(Command::Submit(intent));
            }
            StageDecision::NoAction(reason) => {
                trace!(instrument = %lc.id(), reason = %reason, "No stage entry");
            }
        }
    }

    /// Returns `true` when an exit fired (or would have, on a frozen instrument).
    fn check_exit(
        &mut self,
        lc: &mut Lifecycle,
        price: Decimal,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) -> bool {
        let Some(position) = self.tracker.get_mut(lc.id()) else {
            return false;
        };

        let (was_armed, was_high) = (position.trailing_armed, position.high_water);
        let decision = self.exits.evaluate(position, price);
        if position.trailing_armed != was_armed || position.high_water != was_high {
            out.push(Command::SavePosition(position.clone()));
        }

        match decision.reason() {
            Some(reason) => {
                self.start_exit(lc, reason, price, now, out);
                true
            }
            None => false,
        }
    }

    fn start_exit(
        &mut self,
        lc: &mut Lifecycle,
        reason: ExitReason,
        price: Decimal,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        if let Some(frozen) = &lc.frozen {
            if reason != ExitReason::Manual {
                warn!(
                    instrument = %lc.id(),
                    reason = %reason,
                    frozen = %frozen,
                    "Exit signal on frozen instrument, no order sent"
                );
                return;
            }
        }

        let Some(quantity) = self.tracker.get(lc.id()).map(|p| p.quantity) else {
            return;
        };

        let intent = exit_intent(lc.id(), quantity, reason, price, now);
        info!(
            instrument = %lc.id(),
            reason = %reason,
            quantity = quantity,
            price = %price,
            order_id = %intent.order_id,
            "Liquidation submitted"
        );

        let mut exit = PendingExit::new(reason);
        exit.submit(intent.clone(), now);
        lc.pending_exit = Some(exit);
        lc.state = LifecycleState::ExitPending;
        out.push(Command::Submit(intent));
    }

    /// Submit a new liquidation order for whatever is still held.
    fn resubmit_exit(
        &mut self,
        lc: &mut Lifecycle,
        price: Decimal,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        let held = self.tracker.get(lc.id()).map_or(0, |p| p.quantity);
        let frozen = lc.frozen.is_some();
        let id = lc.id().to_string();

        let Some(exit) = lc.pending_exit.as_mut() else {
            return;
        };
        if exit.order.is_some() || (frozen && exit.reason != ExitReason::Manual) {
            return;
        }

        let remaining = held.saturating_sub(exit.filled);
        if remaining == 0 {
            return;
        }

        let intent = exit_intent(&id, remaining, exit.reason, price, now);
        warn!(
            instrument = %id,
            reason = %exit.reason,
            remaining = remaining,
            order_id = %intent.order_id,
            "Liquidating remaining quantity"
        );
        exit.submit(intent.clone(), now);
        out.push(Command::Submit(intent));
    }

    fn check_cooldown(&mut self, lc: &mut Lifecycle, now: DateTime<Utc>, out: &mut Vec<Command>) {
        if self.restrictions.is_restricted_at(lc.id(), now) {
            return;
        }
        info!(instrument = %lc.id(), "Rebuy restriction lapsed, lifecycle complete");
        lc.state = LifecycleState::Idle;
        out.push(Command::RemoveInstrument {
            instrument: lc.id().to_string(),
        });
    }

    fn apply_stage_fill(&mut self, lc: &mut Lifecycle, fill: StageFill, out: &mut Vec<Command>) {
        let id = lc.id().to_string();
        let order_id = fill.order_id.clone();
        let (quantity, notional, at) = (fill.quantity, fill.notional(), fill.filled_at);

        match self.tracker.apply_fill(&id, fill) {
            Ok(FillOutcome::Applied(position)) => {
                match lc.state {
                    LifecycleState::ExitPending => {}
                    LifecycleState::Tracking | LifecycleState::PartiallyEntered(_) => {
                        lc.state = LifecycleState::PartiallyEntered(position.stages_filled());
                    }
                    LifecycleState::Cooldown | LifecycleState::Idle => {
                        warn!(instrument = %id, state = %lc.state, "Stage fill after lifecycle closed");
                        out.push(Command::Alert {
                            instrument: id.clone(),
                            message: "stage fill arrived after the position was closed".to_string(),
                        });
                        lc.state = LifecycleState::PartiallyEntered(position.stages_filled());
                    }
                }
                out.push(Command::SavePosition(position));
                self.record_entry_progress(lc, &order_id, quantity, notional, at, out);
            }
            Ok(FillOutcome::Duplicate(_)) => {
                debug!(instrument = %id, order_id = %order_id, "Duplicate stage execution ignored");
            }
            Err(e) => self.freeze(lc, &e, out),
        }
    }

    /// The stage was filled by this order and the order is no longer working,
    /// so every execution of it has already been counted.
    fn completed_stage_order(&self, lc: &Lifecycle, stage: Stage, order_id: &str) -> bool {
        !lc.pending_entry_is(order_id)
            && self
                .tracker
                .get(lc.id())
                .and_then(|p| p.fill_for(stage))
                .map_or(false, |f| f.order_id == order_id)
    }

    /// Count an applied piece against the pending entry order. The order stays
    /// pending until its full quantity has filled.
    fn record_entry_progress(
        &mut self,
        lc: &mut Lifecycle,
        order_id: &str,
        quantity: u64,
        notional: Decimal,
        at: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        let Some(pending) = lc
            .pending_entry
            .as_mut()
            .filter(|o| o.intent.order_id == order_id)
        else {
            return;
        };

        pending.filled += quantity;
        pending.notional += notional;
        pending.last_check = pending.last_check.max(at);
        let (ordered, filled) = (pending.intent.quantity, pending.filled);

        if filled < ordered {
            info!(
                instrument = %lc.id(),
                order_id = %order_id,
                filled = filled,
                ordered = ordered,
                "Stage entry partially filled"
            );
            return;
        }

        lc.pending_entry = None;
        out.push(Command::OrderUpdate {
            order_id: order_id.to_string(),
            status: OrderLogStatus::Filled,
            detail: None,
        });
        if filled > ordered {
            let err = LifecycleError::EntryOverfill {
                instrument: lc.id().to_string(),
                order_id: order_id.to_string(),
                ordered,
                filled,
            };
            self.freeze(lc, &err, out);
        }
    }

    fn apply_exit_fill(&mut self, lc: &mut Lifecycle, fill: FillEvent, out: &mut Vec<Command>) {
        let known = lc
            .pending_exit
            .as_ref()
            .map_or(false, |e| e.order_ids.contains(&fill.order_id));
        if !known {
            let err = LifecycleError::UnexpectedFill {
                instrument: fill.instrument.clone(),
                order_id: fill.order_id.clone(),
            };
            self.freeze(lc, &err, out);
            return;
        }

        let held = self.tracker.get(lc.id()).map_or(0, |p| p.quantity);
        let Some(exit) = lc.pending_exit.as_mut() else {
            return;
        };

        match exit.record(&fill, held) {
            ExitProgress::Duplicate => {
                debug!(instrument = %fill.instrument, execution_id = ?fill.execution_id, "Duplicate exit execution ignored");
            }
            ExitProgress::Overfilled { held, filled } => {
                let err = LifecycleError::ExitOverfill {
                    instrument: fill.instrument.clone(),
                    held,
                    filled,
                };
                self.freeze(lc, &err, out);
            }
            ExitProgress::Complete => self.complete_exit(lc, fill.timestamp, out),
            ExitProgress::Partial { order_done } => {
                info!(
                    instrument = %fill.instrument,
                    filled = exit.filled,
                    held = held,
                    "Partial exit fill"
                );
                if order_done {
                    exit.order = None;
                    out.push(Command::OrderUpdate {
                        order_id: fill.order_id.clone(),
                        status: OrderLogStatus::Filled,
                        detail: None,
                    });
                    let price = lc.last_price().unwrap_or(fill.price);
                    self.resubmit_exit(lc, price, fill.timestamp, out);
                }
            }
        }
    }

    fn complete_exit(&mut self, lc: &mut Lifecycle, at: DateTime<Utc>, out: &mut Vec<Command>) {
        let Some(exit) = lc.pending_exit.take() else {
            return;
        };
        let id = lc.id().to_string();
        let price = exit.average_price();

        match self.tracker.apply_liquidation(&id, price, exit.filled) {
            Ok(closed) => {
                if let Some(order) = &exit.order {
                    out.push(Command::OrderUpdate {
                        order_id: order.intent.order_id.clone(),
                        status: OrderLogStatus::Filled,
                        detail: None,
                    });
                }

                let event = ExitEvent {
                    instrument: id.clone(),
                    reason: exit.reason,
                    price,
                    quantity: exit.filled,
                    average_cost: closed.average_cost,
                    stages: closed.stages_filled(),
                    exited_at: at,
                };
                info!(
                    instrument = %id,
                    reason = %event.reason,
                    price = %price.round_dp(2),
                    quantity = event.quantity,
                    return_pct = %event.return_pct().round_dp(3),
                    "Exit complete"
                );

                let entry = self.restrictions.record_exit(event);
                out.push(Command::DeletePosition {
                    instrument: id.clone(),
                });
                out.push(Command::RecordExit(entry));
                lc.state = LifecycleState::Cooldown;
                self.check_cooldown(lc, at, out);
            }
            Err(e) => {
                lc.pending_exit = Some(exit);
                self.freeze(lc, &e, out);
            }
        }
    }

    fn reconcile_entry(
        &mut self,
        lc: &mut Lifecycle,
        report: OrderStatusReport,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        if !report.state.is_final() {
            if let Some(pending) = lc.pending_entry.as_mut() {
                pending.last_check = now;
                debug!(instrument = %report.instrument, order_id = %report.order_id, "Entry order still working");
            }
            return;
        }

        let Some(pending) = lc.pending_entry.take() else {
            return;
        };
        let intent = pending.intent;

        if report.filled_quantity < pending.filled {
            let err = LifecycleError::StatusMismatch {
                instrument: report.instrument.clone(),
                order_id: report.order_id.clone(),
                reported: report.filled_quantity,
                recorded: pending.filled,
            };
            self.freeze(lc, &err, out);
            return;
        }

        if report.filled_quantity > 0 {
            out.push(Command::OrderUpdate {
                order_id: intent.order_id.clone(),
                status: if report.state == OrderState::Filled {
                    OrderLogStatus::Filled
                } else {
                    OrderLogStatus::PartiallyFilled
                },
                detail: None,
            });

            let missing = report.filled_quantity - pending.filled;
            if missing == 0 {
                debug!(instrument = %report.instrument, order_id = %report.order_id, "Entry order closed, fills already recorded");
                return;
            }
            let OrderPurpose::Entry(stage) = intent.purpose else {
                return;
            };

            // Price the unseen remainder so the stage cost matches the
            // broker's average over the whole order.
            let fallback = intent.price.limit().unwrap_or(intent.reference_price);
            let price = match report.average_price {
                Some(average) => {
                    let residual = average * Decimal::from(report.filled_quantity) - pending.notional;
                    if residual > Decimal::ZERO {
                        residual / Decimal::from(missing)
                    } else {
                        average
                    }
                }
                None => fallback,
            };
            info!(
                instrument = %report.instrument,
                order_id = %report.order_id,
                quantity = missing,
                "Entry fill recovered from status query"
            );
            let fill = StageFill {
                stage,
                price,
                quantity: missing,
                executions: vec![format!("status:{}:{}", intent.order_id, report.filled_quantity)],
                order_id: intent.order_id,
                filled_at: now,
            };
            self.apply_stage_fill(lc, fill, out);
        } else {
            warn!(
                instrument = %report.instrument,
                order_id = %report.order_id,
                state = ?report.state,
                "Entry order closed without fill"
            );
            lc.entry_retry_after =
                Some(now + Duration::seconds(self.config.runtime.fill_timeout_secs));
            out.push(Command::OrderUpdate {
                order_id: intent.order_id,
                status: if report.state == OrderState::Rejected {
                    OrderLogStatus::Rejected
                } else {
                    OrderLogStatus::Cancelled
                },
                detail: None,
            });
        }
    }

    fn reconcile_exit(
        &mut self,
        lc: &mut Lifecycle,
        report: OrderStatusReport,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        let (missing, price) = {
            let Some(exit) = lc.pending_exit.as_mut() else {
                return;
            };
            let Some(order) = exit.order.as_mut() else {
                return;
            };

            if !report.state.is_final() {
                order.last_check = now;
                debug!(instrument = %report.instrument, order_id = %report.order_id, "Liquidation still working");
                return;
            }

            let missing = report.filled_quantity.saturating_sub(exit.order_filled);
            let price = report.average_price.unwrap_or(order.intent.reference_price);
            (missing, price)
        };

        if missing > 0 {
            info!(
                instrument = %report.instrument,
                order_id = %report.order_id,
                quantity = missing,
                "Exit fill recovered from status query"
            );
            let fill = FillEvent {
                instrument: report.instrument.clone(),
                leg: FillLeg::Exit,
                price,
                quantity: missing,
                order_id: report.order_id.clone(),
                execution_id: None,
                timestamp: now,
            };
            self.apply_exit_fill(lc, fill, out);
        }

        // Order is final; anything still held is liquidated with a new order.
        let still_current = lc
            .pending_exit
            .as_ref()
            .map_or(false, |e| e.is_current(&report.order_id));
        if still_current && lc.frozen.is_none() {
            if let Some(exit) = lc.pending_exit.as_mut() {
                exit.order = None;
            }
            if report.filled_quantity == 0 {
                error!(
                    instrument = %report.instrument,
                    order_id = %report.order_id,
                    state = ?report.state,
                    "Liquidation closed without fill"
                );
                out.push(Command::Alert {
                    instrument: report.instrument.clone(),
                    message: format!("exit order {} closed unfilled", report.order_id),
                });
            }
            out.push(Command::OrderUpdate {
                order_id: report.order_id.clone(),
                status: if report.filled_quantity > 0 {
                    OrderLogStatus::PartiallyFilled
                } else if report.state == OrderState::Rejected {
                    OrderLogStatus::Rejected
                } else {
                    OrderLogStatus::Cancelled
                },
                detail: None,
            });
            let last = lc.last_price().unwrap_or(price);
            self.resubmit_exit(lc, last, now, out);
        }
    }

    fn freeze(&self, lc: &mut Lifecycle, err: &LifecycleError, out: &mut Vec<Command>) {
        let reason = err.to_string();
        error!(instrument = %lc.id(), error = %reason, "Invariant violation, instrument frozen");
        lc.frozen = Some(reason.clone());
        out.push(Command::Freeze {
            instrument: lc.id().to_string(),
            reason: reason.clone(),
        });
        out.push(Command::Alert {
            instrument: lc.id().to_string(),
            message: reason,
        });
    }
}

fn entry_intent(
    instrument: &str,
    stage: Stage,
    quantity: u64,
    limit_price: Decimal,
    now: DateTime<Utc>,
) -> OrderIntent {
    OrderIntent {
        order_id: OrderIntent::new_order_id(),
        instrument: instrument.to_string(),
        side: OrderSide::Buy,
        quantity,
        price: OrderPrice::Limit(limit_price),
        urgent: false,
        purpose: OrderPurpose::Entry(stage),
        reference_price: limit_price,
        created_at: now,
    }
}

fn exit_intent(
    instrument: &str,
    quantity: u64,
    reason: ExitReason,
    reference_price: Decimal,
    now: DateTime<Utc>,
) -> OrderIntent {
    OrderIntent {
        order_id: OrderIntent::new_order_id(),
        instrument: instrument.to_string(),
        side: OrderSide::Sell,
        quantity,
        price: OrderPrice::Market,
        urgent: true,
        purpose: OrderPurpose::Exit(reason),
        reference_price,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use crate::trading::config::{MarketConfig, RestrictionConfig};

    fn t0() -> DateTime<Utc> {
        // Monday 10:00 KST
        Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minutes)
    }

    fn controller() -> PositionController {
        PositionController::new(ControllerConfig::default())
    }

    fn instrument() -> TrackedInstrument {
        TrackedInstrument::new("005930", dec!(1000), dec!(40), 1, t0())
    }

    fn tick(price: Decimal, ts: DateTime<Utc>) -> ControlEvent {
        ControlEvent::Tick(Tick {
            instrument: "005930".to_string(),
            price,
            volume: 5000,
            timestamp: ts,
        })
    }

    fn oversold() -> ControlEvent {
        ControlEvent::Indicators(IndicatorUpdate {
            instrument: "005930".to_string(),
            indicators: Indicators {
                oscillator: Some(dec!(28)),
                ..Indicators::default()
            },
        })
    }

    fn submits(cmds: &[Command]) -> Vec<OrderIntent> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::Submit(intent) => Some(intent.clone()),
                _ => None,
            })
            .collect()
    }

    fn recorded_exit(cmds: &[Command]) -> Option<RestrictionEntry> {
        cmds.iter().find_map(|c| match c {
            Command::RecordExit(entry) => Some(entry.clone()),
            _ => None,
        })
    }

    fn stage_fill(intent: &OrderIntent, ts: DateTime<Utc>) -> ControlEvent {
        let OrderPurpose::Entry(stage) = intent.purpose else {
            panic!("not an entry order");
        };
        ControlEvent::Fill(FillEvent {
            instrument: intent.instrument.clone(),
            leg: FillLeg::Stage(stage),
            price: intent.reference_price,
            quantity: intent.quantity,
            order_id: intent.order_id.clone(),
            execution_id: None,
            timestamp: ts,
        })
    }

    fn exit_fill(
        intent: &OrderIntent,
        price: Decimal,
        quantity: u64,
        execution_id: &str,
        ts: DateTime<Utc>,
    ) -> ControlEvent {
        ControlEvent::Fill(FillEvent {
            instrument: intent.instrument.clone(),
            leg: FillLeg::Exit,
            price,
            quantity,
            order_id: intent.order_id.clone(),
            execution_id: Some(execution_id.to_string()),
            timestamp: ts,
        })
    }

    /// Track, enter stage 1 at 750 and fill it.
    fn stage_piece(
        intent: &OrderIntent,
        quantity: u64,
        execution_id: Option<&str>,
        ts: DateTime<Utc>,
    ) -> ControlEvent {
        let OrderPurpose::Entry(stage) = intent.purpose else {
            panic!("not an entry order");
        };
        ControlEvent::Fill(FillEvent {
            instrument: intent.instrument.clone(),
            leg: FillLeg::Stage(stage),
            price: intent.reference_price,
            quantity,
            order_id: intent.order_id.clone(),
            execution_id: execution_id.map(str::to_string),
            timestamp: ts,
        })
    }

    fn saved_positions(cmds: &[Command]) -> Vec<Position> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::SavePosition(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn entered(c: &mut PositionController) -> OrderIntent {
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let intent = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);
        c.handle(stage_fill(&intent, at(2)));
        intent
    }

    #[test]
    fn test_first_stage_entry_and_fill() {
        let mut c = controller();
        let cmds = c.handle(ControlEvent::Track(instrument()));
        assert!(matches!(cmds.as_slice(), [Command::SaveInstrument(_)]));
        assert_eq!(c.state("005930"), LifecycleState::Tracking);

        c.handle(oversold());
        let intents = submits(&c.handle(tick(dec!(750), at(1))));
        assert_eq!(intents.len(), 1);
        let intent = &intents[0];
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.quantity, 666);
        assert_eq!(intent.price, OrderPrice::Limit(dec!(750)));
        assert!(!intent.urgent);
        assert_eq!(intent.purpose, OrderPurpose::Entry(Stage::First));

        // one entry in flight at a time
        assert!(submits(&c.handle(tick(dec!(750), at(2)))).is_empty());

        let cmds = c.handle(stage_fill(intent, at(3)));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::SavePosition(p) if p.quantity == 666 && p.average_cost == dec!(750)
        )));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::OrderUpdate { status: OrderLogStatus::Filled, .. }
        )));
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(1));
    }

    #[test]
    fn test_trailing_stop_exit_and_cooldown() {
        let mut c = controller();
        entered(&mut c);

        let cmds = c.handle(tick(dec!(772.5), at(10)));
        assert!(submits(&cmds).is_empty());
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::SavePosition(p) if p.trailing_armed)));

        let intents = submits(&c.handle(tick(dec!(764.8), at(11))));
        assert_eq!(intents.len(), 1);
        let exit = &intents[0];
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.quantity, 666);
        assert_eq!(exit.price, OrderPrice::Market);
        assert!(exit.urgent);
        assert_eq!(exit.purpose, OrderPurpose::Exit(ExitReason::TrailingStop));
        assert_eq!(c.state("005930"), LifecycleState::ExitPending);

        // further triggers while the exit is in flight send nothing
        assert!(submits(&c.handle(tick(dec!(735), at(12)))).is_empty());

        let cmds = c.handle(exit_fill(exit, dec!(764.8), 666, "x1", at(12)));
        let entry = recorded_exit(&cmds).unwrap();
        assert_eq!(entry.event.reason, ExitReason::TrailingStop);
        assert_eq!(entry.event.quantity, 666);
        assert_eq!(entry.restricted_until, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::DeletePosition { .. })));
        assert_eq!(c.state("005930"), LifecycleState::Cooldown);
        assert!(c.position("005930").is_none());

        // re-registration refused inside the window
        assert!(c.handle(ControlEvent::Track(instrument())).is_empty());

        let after = Utc.with_ymd_and_hms(2024, 3, 12, 1, 0, 0).unwrap();
        let cmds = c.handle(tick(dec!(800), after));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::RemoveInstrument { .. })));
        assert_eq!(c.state("005930"), LifecycleState::Idle);

        let mut fresh = instrument();
        fresh.discovered_at = after;
        let cmds = c.handle(ControlEvent::Track(fresh));
        assert!(matches!(cmds.as_slice(), [Command::SaveInstrument(_)]));
        assert_eq!(c.state("005930"), LifecycleState::Tracking);
    }

    #[test]
    fn test_stop_loss_with_partial_exit_fills() {
        let mut c = controller();
        entered(&mut c);

        let exit = submits(&c.handle(tick(dec!(735), at(5)))).remove(0);
        assert_eq!(exit.purpose, OrderPurpose::Exit(ExitReason::StopLoss));

        let cmds = c.handle(exit_fill(&exit, dec!(735), 400, "x1", at(6)));
        assert!(recorded_exit(&cmds).is_none());
        assert_eq!(c.state("005930"), LifecycleState::ExitPending);

        // replayed execution
        assert!(c.handle(exit_fill(&exit, dec!(735), 400, "x1", at(6))).is_empty());

        let cmds = c.handle(exit_fill(&exit, dec!(734), 266, "x2", at(7)));
        let entry = recorded_exit(&cmds).unwrap();
        let vwap = (dec!(735) * dec!(400) + dec!(734) * dec!(266)) / dec!(666);
        assert_eq!(entry.event.price, vwap);
        assert_eq!(entry.event.quantity, 666);
        assert_eq!(entry.event.average_cost, dec!(750));
        assert_eq!(c.state("005930"), LifecycleState::Cooldown);
    }

    #[test]
    fn test_remainder_liquidated_after_partial_cancel() {
        let mut c = controller();
        entered(&mut c);

        let exit = submits(&c.handle(tick(dec!(735), at(5)))).remove(0);
        c.handle(exit_fill(&exit, dec!(735), 400, "x1", at(6)));

        let cmds = c.handle(ControlEvent::OrderStatus(OrderStatusReport {
            instrument: "005930".to_string(),
            order_id: exit.order_id.clone(),
            state: OrderState::Cancelled,
            filled_quantity: 400,
            average_price: Some(dec!(735)),
        }));
        let remainder = submits(&cmds);
        assert_eq!(remainder.len(), 1);
        assert_eq!(remainder[0].quantity, 266);
        assert!(remainder[0].urgent);
        assert_ne!(remainder[0].order_id, exit.order_id);

        let cmds = c.handle(exit_fill(&remainder[0], dec!(733), 266, "x2", at(8)));
        assert!(recorded_exit(&cmds).is_some());
        assert_eq!(c.state("005930"), LifecycleState::Cooldown);
    }

    #[test]
    fn test_exit_reject_alerts_and_resubmits() {
        let mut c = controller();
        entered(&mut c);

        let exit = submits(&c.handle(tick(dec!(735), at(5)))).remove(0);
        let cmds = c.handle(ControlEvent::Rejected {
            instrument: "005930".to_string(),
            order_id: exit.order_id.clone(),
            reason: "market closed".to_string(),
        });
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Alert { .. })));
        assert!(submits(&cmds).is_empty());
        assert_eq!(c.state("005930"), LifecycleState::ExitPending);

        let retry = submits(&c.handle(tick(dec!(733), at(6))));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].quantity, 666);
        assert_ne!(retry[0].order_id, exit.order_id);
    }

    #[test]
    fn test_duplicate_stage_fill_is_ignored() {
        let mut c = controller();
        let entry = entered(&mut c);

        assert!(c.handle(stage_fill(&entry, at(3))).is_empty());
        assert_eq!(c.position("005930").unwrap().quantity, 666);
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(1));
    }

    #[test]
    fn test_stage_order_filled_in_pieces() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);
        assert_eq!(entry.quantity, 666);

        let cmds = c.handle(stage_piece(&entry, 400, Some("e1"), at(2)));
        assert!(saved_positions(&cmds).iter().any(|p| p.quantity == 400));
        assert!(!cmds.iter().any(|cmd| matches!(cmd, Command::OrderUpdate { .. })));
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(1));
        assert_eq!(c.view("005930").unwrap().pending_order.as_deref(), Some(entry.order_id.as_str()));

        // the rest of the order is still working, no second entry
        assert!(submits(&c.handle(tick(dec!(750), at(3)))).is_empty());

        let cmds = c.handle(stage_piece(&entry, 266, Some("e2"), at(4)));
        assert!(saved_positions(&cmds).iter().any(|p| p.quantity == 666 && p.fills.len() == 1));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::OrderUpdate { status: OrderLogStatus::Filled, .. }
        )));
        assert!(c.view("005930").unwrap().pending_order.is_none());

        // replay of a counted piece
        assert!(c.handle(stage_piece(&entry, 266, Some("e2"), at(4))).is_empty());
        assert!(!c.is_frozen("005930"));

        let exit = submits(&c.handle(tick(dec!(735), at(5)))).remove(0);
        assert_eq!(exit.purpose, OrderPurpose::Exit(ExitReason::StopLoss));
        assert_eq!(exit.quantity, 666);
    }

    #[test]
    fn test_unidentified_stage_pieces_freeze() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);

        c.handle(stage_piece(&entry, 400, None, at(2)));
        assert!(!c.is_frozen("005930"));

        let cmds = c.handle(stage_piece(&entry, 266, None, at(3)));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Freeze { .. })));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Alert { .. })));
        assert!(c.is_frozen("005930"));
        assert_eq!(c.position("005930").unwrap().quantity, 400);
    }

    #[test]
    fn test_partial_entry_completed_by_status_query() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);
        c.handle(stage_piece(&entry, 400, Some("e1"), at(1) + Duration::seconds(5)));

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(40),
        });
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::QueryOrder { .. })));

        let cmds = c.handle(ControlEvent::OrderStatus(OrderStatusReport {
            instrument: "005930".to_string(),
            order_id: entry.order_id.clone(),
            state: OrderState::Filled,
            filled_quantity: 666,
            average_price: Some(dec!(749)),
        }));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::OrderUpdate { status: OrderLogStatus::Filled, .. }
        )));

        let pos = c.position("005930").unwrap();
        assert_eq!(pos.quantity, 666);
        assert_eq!(pos.average_cost.round_dp(4), dec!(749));
        assert!(c.view("005930").unwrap().pending_order.is_none());
        assert!(!c.is_frozen("005930"));

        // a late report of the unseen remainder is already counted
        assert!(c.handle(stage_piece(&entry, 266, None, at(2))).is_empty());
        assert_eq!(c.position("005930").unwrap().quantity, 666);
    }

    #[test]
    fn test_status_below_recorded_fills_freezes() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);
        c.handle(stage_piece(&entry, 400, Some("e1"), at(1) + Duration::seconds(5)));

        let cmds = c.handle(ControlEvent::OrderStatus(OrderStatusReport {
            instrument: "005930".to_string(),
            order_id: entry.order_id.clone(),
            state: OrderState::Cancelled,
            filled_quantity: 300,
            average_price: Some(dec!(750)),
        }));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Freeze { .. })));
        assert_eq!(c.position("005930").unwrap().quantity, 400);
    }

    #[test]
    fn test_entry_overfill_freezes() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);

        c.handle(stage_piece(&entry, 600, Some("e1"), at(2)));
        let cmds = c.handle(stage_piece(&entry, 100, Some("e2"), at(3)));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Freeze { .. })));
        assert!(c.is_frozen("005930"));
        assert_eq!(c.position("005930").unwrap().quantity, 700);
    }

    #[test]
    fn test_high_water_persisted_after_arming() {
        let mut c = controller();
        entered(&mut c);

        let mut cmds = c.handle(tick(dec!(772.5), at(10)));
        cmds.extend(c.handle(tick(dec!(780), at(11))));
        cmds.extend(c.handle(tick(dec!(800), at(12))));
        assert!(submits(&cmds).is_empty());

        let saved = saved_positions(&cmds);
        let highs: Vec<Decimal> = saved.iter().map(|p| p.high_water).collect();
        assert_eq!(highs, vec![dec!(772.5), dec!(780), dec!(800)]);
        assert!(saved.iter().all(|p| p.trailing_armed));

        // a pullback inside the retracement moves nothing
        assert!(saved_positions(&c.handle(tick(dec!(795), at(13)))).is_empty());
    }

    #[test]
    fn test_three_stages_then_liquidation() {
        let mut config = ControllerConfig::default();
        config.exit.stop_loss_pct = dec!(-10);
        let mut c = PositionController::new(config);
        let first = entered(&mut c);

        c.handle(ControlEvent::Indicators(IndicatorUpdate {
            instrument: "005930".to_string(),
            indicators: Indicators {
                oscillator: Some(dec!(25)),
                average_volume: Some(dec!(20000)),
                ..Indicators::default()
            },
        }));

        let second = submits(&c.handle(tick(dec!(740), at(3)))).remove(0);
        assert_eq!(second.purpose, OrderPurpose::Entry(Stage::Second));
        c.handle(stage_fill(&second, at(4)));
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(2));

        let third = submits(&c.handle(tick(dec!(705), at(5)))).remove(0);
        assert_eq!(third.purpose, OrderPurpose::Entry(Stage::Third));
        c.handle(stage_fill(&third, at(6)));
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(3));

        // all stages filled, nothing further to buy
        assert!(submits(&c.handle(tick(dec!(700), at(7)))).is_empty());

        let total = first.quantity + second.quantity + third.quantity;
        let cost = first.reference_price * Decimal::from(first.quantity)
            + second.reference_price * Decimal::from(second.quantity)
            + third.reference_price * Decimal::from(third.quantity);
        let average_cost = cost / Decimal::from(total);
        assert_eq!(c.position("005930").unwrap().average_cost, average_cost);

        let exit = submits(&c.handle(ControlEvent::Liquidate {
            instrument: "005930".to_string(),
        }))
        .remove(0);
        assert_eq!(exit.quantity, total);
        assert_eq!(exit.purpose, OrderPurpose::Exit(ExitReason::Manual));

        let cmds = c.handle(exit_fill(&exit, dec!(700), total, "x1", at(8)));
        let entry = recorded_exit(&cmds).unwrap();
        assert_eq!(entry.event.quantity, total);
        assert_eq!(entry.event.average_cost, average_cost);
        assert_eq!(entry.event.stages, 3);
        assert_eq!(c.state("005930"), LifecycleState::Cooldown);
    }

    #[test]
    fn test_conflicting_stage_fill_freezes_until_release() {
        let mut c = controller();
        entered(&mut c);

        let cmds = c.handle(ControlEvent::Fill(FillEvent {
            instrument: "005930".to_string(),
            leg: FillLeg::Stage(Stage::First),
            price: dec!(748),
            quantity: 100,
            order_id: "foreign".to_string(),
            execution_id: None,
            timestamp: at(3),
        }));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Freeze { .. })));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Alert { .. })));
        assert!(c.is_frozen("005930"));
        assert_eq!(c.position("005930").unwrap().quantity, 666);

        // frozen: stop loss signal sends nothing
        assert!(submits(&c.handle(tick(dec!(735), at(4)))).is_empty());

        let cmds = c.handle(ControlEvent::Release {
            instrument: "005930".to_string(),
        });
        assert!(matches!(cmds.as_slice(), [Command::Unfreeze { .. }]));
        assert_eq!(submits(&c.handle(tick(dec!(734), at(5)))).len(), 1);
    }

    #[test]
    fn test_stale_data_suspends_entries() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));

        // no support conditions yet
        assert!(submits(&c.handle(tick(dec!(750), at(1)))).is_empty());
        c.handle(oversold());

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(120),
        });
        assert!(submits(&cmds).is_empty());
        assert!(c.view("005930").unwrap().stale);

        assert_eq!(submits(&c.handle(tick(dec!(750), at(4)))).len(), 1);
        assert!(!c.view("005930").unwrap().stale);
    }

    #[test]
    fn test_heartbeat_reevaluates_fresh_data() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        assert!(submits(&c.handle(tick(dec!(750), at(1)))).is_empty());
        c.handle(oversold());

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(5),
        });
        assert_eq!(submits(&cmds).len(), 1);
    }

    #[test]
    fn test_fill_timeout_queries_status_and_recovers() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);

        let quiet = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(10),
        });
        assert!(quiet.is_empty());

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(31),
        });
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::QueryOrder { order_id, .. } if *order_id == entry.order_id
        )));
        assert!(submits(&cmds).is_empty());

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(1) + Duration::seconds(40),
        });
        assert!(!cmds.iter().any(|cmd| matches!(cmd, Command::QueryOrder { .. })));

        let cmds = c.handle(ControlEvent::OrderStatus(OrderStatusReport {
            instrument: "005930".to_string(),
            order_id: entry.order_id.clone(),
            state: OrderState::Filled,
            filled_quantity: 666,
            average_price: Some(dec!(749)),
        }));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::SavePosition(p) if p.average_cost == dec!(749)
        )));
        assert_eq!(c.state("005930"), LifecycleState::PartiallyEntered(1));

        // the late fill report changes nothing
        assert!(c.handle(stage_fill(&entry, at(2))).is_empty());
    }

    #[test]
    fn test_entry_reject_clears_pending_order() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));
        c.handle(oversold());
        let entry = submits(&c.handle(tick(dec!(750), at(1)))).remove(0);

        c.handle(ControlEvent::Rejected {
            instrument: "005930".to_string(),
            order_id: entry.order_id.clone(),
            reason: "insufficient funds".to_string(),
        });
        assert_eq!(c.state("005930"), LifecycleState::Tracking);
        assert!(c.view("005930").unwrap().pending_order.is_none());

        // retry waits out the fill timeout
        assert!(submits(&c.handle(tick(dec!(750), at(1) + Duration::seconds(10)))).is_empty());
        assert_eq!(submits(&c.handle(tick(dec!(750), at(2)))).len(), 1);
    }

    #[test]
    fn test_tracking_timeout_abandons_instrument() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: t0() + Duration::days(8),
        });
        assert!(matches!(cmds.as_slice(), [Command::RemoveInstrument { .. }]));
        assert_eq!(c.state("005930"), LifecycleState::Idle);
    }

    #[test]
    fn test_manual_liquidation() {
        let mut c = controller();
        entered(&mut c);

        let intents = submits(&c.handle(ControlEvent::Liquidate {
            instrument: "005930".to_string(),
        }));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].quantity, 666);
        assert_eq!(intents[0].purpose, OrderPurpose::Exit(ExitReason::Manual));

        let again = c.handle(ControlEvent::Liquidate {
            instrument: "005930".to_string(),
        });
        assert!(submits(&again).is_empty());
    }

    #[test]
    fn test_untracked_fill_is_adopted() {
        let mut c = controller();
        let cmds = c.handle(ControlEvent::Fill(FillEvent {
            instrument: "000660".to_string(),
            leg: FillLeg::Stage(Stage::First),
            price: dec!(120),
            quantity: 10,
            order_id: "manual-1".to_string(),
            execution_id: None,
            timestamp: at(0),
        }));

        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Alert { .. })));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::SavePosition(p) if p.quantity == 10)));
        assert_eq!(c.state("000660"), LifecycleState::PartiallyEntered(1));
    }

    #[test]
    fn test_exit_overfill_freezes() {
        let mut c = controller();
        entered(&mut c);

        let exit = submits(&c.handle(tick(dec!(735), at(5)))).remove(0);
        let cmds = c.handle(exit_fill(&exit, dec!(735), 700, "x1", at(6)));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::Freeze { .. })));
        assert!(c.is_frozen("005930"));
        assert!(c.position("005930").is_some());
    }

    #[test]
    fn test_restore_open_exit_order() {
        let mut c = controller();
        let position = Position::open(
            "005930",
            StageFill {
                stage: Stage::First,
                price: dec!(750),
                quantity: 666,
                order_id: "e1".to_string(),
                filled_at: at(0),
                executions: Vec::new(),
            },
        );
        let exit = exit_intent("005930", 666, ExitReason::StopLoss, dec!(735), at(0));
        c.restore(RestoredLifecycle {
            instrument: instrument(),
            position: Some(position),
            frozen: None,
            open_orders: vec![(exit.clone(), at(0))],
        });
        assert_eq!(c.state("005930"), LifecycleState::ExitPending);

        let cmds = c.handle(ControlEvent::Heartbeat {
            now: at(0) + Duration::seconds(31),
        });
        assert!(cmds.iter().any(|cmd| matches!(cmd, Command::QueryOrder { .. })));

        let cmds = c.handle(ControlEvent::OrderStatus(OrderStatusReport {
            instrument: "005930".to_string(),
            order_id: exit.order_id.clone(),
            state: OrderState::Filled,
            filled_quantity: 666,
            average_price: Some(dec!(734)),
        }));
        let entry = recorded_exit(&cmds).unwrap();
        assert_eq!(entry.event.price, dec!(734));
        assert_eq!(c.state("005930"), LifecycleState::Cooldown);
    }

    #[test]
    fn test_new_peak_raises_rise_rate() {
        let mut c = controller();
        c.handle(ControlEvent::Track(instrument()));

        let cmds = c.handle(tick(dec!(1100), at(1)));
        let saved = cmds
            .iter()
            .find_map(|cmd| match cmd {
                Command::SaveInstrument(i) => Some(i.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(saved.peak_price, dec!(1100));
        assert!(saved.rise_rate > dec!(50));
        assert_eq!(saved.rise_days, 1);

        // Tuesday: another high extends the rise streak
        let cmds = c.handle(tick(dec!(1150), at(0) + Duration::days(1)));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Command::SaveInstrument(i) if i.peak_price == dec!(1150) && i.rise_days == 2
        )));
    }

    #[test]
    fn test_restricted_registration_refused() {
        let mut history =
            RebuyRestrictionRegistry::new(RestrictionConfig::default(), MarketConfig::default());
        let entry = history.record_exit(ExitEvent {
            instrument: "005930".to_string(),
            reason: ExitReason::StopLoss,
            price: dec!(735),
            quantity: 666,
            average_cost: dec!(750),
            stages: 1,
            exited_at: t0() - Duration::days(2),
        });

        let mut c = controller();
        c.load_restrictions(vec![entry]);
        assert!(c.handle(ControlEvent::Track(instrument())).is_empty());
        assert_eq!(c.state("005930"), LifecycleState::Idle);
        assert!(c.handle(tick(dec!(750), at(1))).is_empty());
    }
}
