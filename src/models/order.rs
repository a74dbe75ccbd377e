//! Order intents sent to the gateway and the execution reports that come back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, Stage};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Limit price or marketable order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPrice {
    Limit(Decimal),
    Market,
}

impl OrderPrice {
    pub fn limit(&self) -> Option<Decimal> {
        match self {
            OrderPrice::Limit(p) => Some(*p),
            OrderPrice::Market => None,
        }
    }
}

/// What an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry(Stage),
    Exit(ExitReason),
}

impl OrderPurpose {
    pub fn label(&self) -> String {
        match self {
            OrderPurpose::Entry(stage) => format!("entry_{}", stage.number()),
            OrderPurpose::Exit(reason) => format!("exit_{}", reason.as_str()),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, OrderPurpose::Exit(_))
    }
}

/// Order the controller wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Client order id; fills and status reports refer back to it
    pub order_id: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: OrderPrice,
    /// Execute at best available price without delay
    pub urgent: bool,
    pub purpose: OrderPurpose,
    /// Last traded price when the intent was created
    pub reference_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new_order_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Which leg of the lifecycle a fill belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLeg", into = "RawLeg")]
pub enum FillLeg {
    Stage(Stage),
    Exit,
}

/// Wire form: `1`, `2`, `3` or `"exit"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLeg {
    Stage(u8),
    Named(String),
}

impl TryFrom<RawLeg> for FillLeg {
    type Error = String;

    fn try_from(raw: RawLeg) -> Result<Self, Self::Error> {
        match raw {
            RawLeg::Stage(n) => Stage::try_from(n).map(FillLeg::Stage),
            RawLeg::Named(s) if s.eq_ignore_ascii_case("exit") => Ok(FillLeg::Exit),
            RawLeg::Named(s) => s
                .parse::<u8>()
                .map_err(|_| format!("invalid fill leg '{s}'"))
                .and_then(Stage::try_from)
                .map(FillLeg::Stage),
        }
    }
}

impl From<FillLeg> for RawLeg {
    fn from(leg: FillLeg) -> Self {
        match leg {
            FillLeg::Stage(stage) => RawLeg::Stage(stage.number()),
            FillLeg::Exit => RawLeg::Named("exit".to_string()),
        }
    }
}

/// Execution report for a controller order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub instrument: String,
    #[serde(rename = "stage")]
    pub leg: FillLeg,
    pub price: Decimal,
    pub quantity: u64,
    pub order_id: String,
    /// Broker execution id, used to drop repeated partial exit fills
    #[serde(default)]
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Broker-side order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Working,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

/// Answer to an order status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub instrument: String,
    pub order_id: String,
    pub state: OrderState,
    #[serde(default)]
    pub filled_quantity: u64,
    #[serde(default)]
    pub average_price: Option<Decimal>,
}

/// Gateway accepted the order for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
}
