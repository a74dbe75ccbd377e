//! Staged position model: up to three graduated buys, one full exit.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Entry stage. Stages fill strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    First,
    Second,
    Third,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::First, Stage::Second, Stage::Third];

    pub fn number(self) -> u8 {
        match self {
            Stage::First => 1,
            Stage::Second => 2,
            Stage::Third => 3,
        }
    }

    pub fn index(self) -> usize {
        usize::from(self.number() - 1)
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Stage::First),
            2 => Some(Stage::Second),
            3 => Some(Stage::Third),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stage::from_number(value).ok_or_else(|| format!("invalid stage {value}, expected 1-3"))
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.number()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.number())
    }
}

/// How many stages of a position are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    None,
    Staged(u8),
}

/// A single stage buy that filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFill {
    pub stage: Stage,
    pub price: Decimal,
    pub quantity: u64,
    pub order_id: String,
    pub filled_at: DateTime<Utc>,
    /// Broker execution ids merged into this fill
    #[serde(default)]
    pub executions: Vec<String>,
}

impl StageFill {
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    pub fn has_execution(&self, execution_id: &str) -> bool {
        self.executions.iter().any(|e| e == execution_id)
    }
}

/// Open position in one instrument.
///
/// Exists only once the first stage has filled; a closed position is removed
/// rather than kept at zero quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Exchange symbol
    pub instrument: String,

    /// Stage fills in stage order
    pub fills: Vec<StageFill>,

    /// Aggregate shares held
    pub quantity: u64,

    /// Volume-weighted average cost across all stage fills
    pub average_cost: Decimal,

    /// Highest price observed since the first fill, reset when trailing arms
    pub high_water: Decimal,

    /// Set once profit reaches the trailing trigger; never cleared
    pub trailing_armed: bool,

    /// Time of the first fill
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Open a position from its first stage fill.
    pub fn open(instrument: impl Into<String>, fill: StageFill) -> Self {
        Self {
            instrument: instrument.into(),
            quantity: fill.quantity,
            average_cost: fill.price,
            high_water: fill.price,
            trailing_armed: false,
            opened_at: fill.filled_at,
            fills: vec![fill],
        }
    }

    /// Append a later stage fill and re-derive the aggregate figures.
    pub(crate) fn add_fill(&mut self, fill: StageFill) {
        if fill.price > self.high_water {
            self.high_water = fill.price;
        }
        self.fills.push(fill);
        self.recompute();
    }

    /// Fold another piece of a partially filled stage order into its stage.
    ///
    /// The stage price becomes the volume-weighted price of all pieces.
    pub(crate) fn merge_fill(&mut self, piece: StageFill) {
        let Some(existing) = self.fills.iter_mut().find(|f| f.stage == piece.stage) else {
            self.add_fill(piece);
            return;
        };

        let quantity = existing.quantity + piece.quantity;
        existing.price = (existing.notional() + piece.notional()) / Decimal::from(quantity);
        existing.quantity = quantity;
        existing.filled_at = existing.filled_at.max(piece.filled_at);
        existing.executions.extend(piece.executions);

        if piece.price > self.high_water {
            self.high_water = piece.price;
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        self.quantity = self.fills.iter().map(|f| f.quantity).sum();
        if self.quantity > 0 {
            self.average_cost = self.cost_basis() / Decimal::from(self.quantity);
        }
    }

    pub fn fill_for(&self, stage: Stage) -> Option<&StageFill> {
        self.fills.iter().find(|f| f.stage == stage)
    }

    pub fn stages_filled(&self) -> u8 {
        self.fills.len() as u8
    }

    pub fn status(&self) -> PositionStatus {
        match self.stages_filled() {
            0 => PositionStatus::None,
            n => PositionStatus::Staged(n),
        }
    }

    /// Lowest stage not yet filled.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::from_number(self.stages_filled() + 1)
    }

    /// Total amount paid across stage fills.
    pub fn cost_basis(&self) -> Decimal {
        self.fills.iter().map(StageFill::notional).sum()
    }

    /// Profit of `price` over average cost, in percent.
    pub fn profit_rate(&self, price: Decimal) -> Decimal {
        if self.average_cost.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.average_cost) / self.average_cost * dec!(100)
    }

    /// Unrealized P&L at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.average_cost) * Decimal::from(self.quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(stage: Stage, price: Decimal, quantity: u64) -> StageFill {
        StageFill {
            stage,
            price,
            quantity,
            order_id: format!("ord-{}", stage.number()),
            filled_at: Utc.with_ymd_and_hms(2024, 3, 5, 1, 0, 0).unwrap(),
            executions: Vec::new(),
        }
    }

    #[test]
    fn test_weighted_average_cost() {
        let mut pos = Position::open("005930", fill(Stage::First, dec!(750), 666));
        pos.add_fill(fill(Stage::Second, dec!(700), 400));

        assert_eq!(pos.quantity, 1066);
        let expected = (dec!(750) * dec!(666) + dec!(700) * dec!(400)) / dec!(1066);
        assert_eq!(pos.average_cost, expected);
        assert_eq!(pos.status(), PositionStatus::Staged(2));
        assert_eq!(pos.next_stage(), Some(Stage::Third));
    }

    #[test]
    fn test_high_water_tracks_fill_prices() {
        let mut pos = Position::open("005930", fill(Stage::First, dec!(750), 100));
        pos.add_fill(fill(Stage::Second, dec!(720), 100));
        assert_eq!(pos.high_water, dec!(750));
    }

    #[test]
    fn test_partial_pieces_merge_into_one_stage() {
        let mut first = fill(Stage::First, dec!(750), 400);
        first.executions.push("e1".to_string());
        let mut pos = Position::open("005930", first);

        let mut second = fill(Stage::First, dec!(745), 266);
        second.executions.push("e2".to_string());
        pos.merge_fill(second);

        assert_eq!(pos.fills.len(), 1);
        assert_eq!(pos.quantity, 666);
        assert_eq!(pos.stages_filled(), 1);
        let expected = (dec!(750) * dec!(400) + dec!(745) * dec!(266)) / dec!(666);
        assert_eq!(pos.average_cost, expected);
        assert_eq!(pos.cost_basis(), dec!(750) * dec!(400) + dec!(745) * dec!(266));
        assert!(pos.fills[0].has_execution("e1"));
        assert!(pos.fills[0].has_execution("e2"));
        assert_eq!(pos.high_water, dec!(750));
    }

    #[test]
    fn test_profit_rate() {
        let pos = Position::open("005930", fill(Stage::First, dec!(750), 100));
        assert_eq!(pos.profit_rate(dec!(765)), dec!(2));
        assert_eq!(pos.profit_rate(dec!(735)), dec!(-2));
        assert_eq!(pos.unrealized_pnl(dec!(760)), dec!(1000));
    }

    #[test]
    fn test_stage_serde_as_number() {
        let json = serde_json::to_string(&Stage::Second).unwrap();
        assert_eq!(json, "2");
        let stage: Stage = serde_json::from_str("3").unwrap();
        assert_eq!(stage, Stage::Third);
        assert!(serde_json::from_str::<Stage>("4").is_err());
    }
}
