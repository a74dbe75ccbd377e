//! Paper gateway: fills every order immediately against its own price.
//!
//! Limit orders fill at the limit; market orders fill at the reference price
//! moved against us by the configured slippage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::{GatewayError, OrderGateway};
use crate::models::{
    FillEvent, FillLeg, OrderAck, OrderIntent, OrderPrice, OrderPurpose, OrderSide, OrderState,
    OrderStatusReport,
};

pub struct PaperGateway {
    fills: mpsc::UnboundedSender<FillEvent>,
    slippage_pct: Decimal,
    orders: RwLock<HashMap<String, OrderStatusReport>>,
    executions: AtomicU64,
}

impl PaperGateway {
    pub fn new(fills: mpsc::UnboundedSender<FillEvent>, slippage_pct: Decimal) -> Self {
        Self {
            fills,
            slippage_pct,
            orders: RwLock::new(HashMap::new()),
            executions: AtomicU64::new(0),
        }
    }

    fn fill_price(&self, intent: &OrderIntent) -> Decimal {
        match intent.price {
            OrderPrice::Limit(price) => price,
            OrderPrice::Market => {
                let slip = self.slippage_pct / dec!(100);
                match intent.side {
                    OrderSide::Buy => intent.reference_price * (Decimal::ONE + slip),
                    OrderSide::Sell => intent.reference_price * (Decimal::ONE - slip),
                }
            }
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderAck, GatewayError> {
        if intent.quantity == 0 {
            return Err(GatewayError::Rejected("zero quantity".to_string()));
        }

        let price = self.fill_price(intent);
        if price <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!("no usable price for {}", intent.order_id)));
        }

        let leg = match intent.purpose {
            OrderPurpose::Entry(stage) => FillLeg::Stage(stage),
            OrderPurpose::Exit(_) => FillLeg::Exit,
        };
        let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;

        // fills carry the intent's timestamp so replays stay on the event clock
        let fill = FillEvent {
            instrument: intent.instrument.clone(),
            leg,
            price,
            quantity: intent.quantity,
            order_id: intent.order_id.clone(),
            execution_id: Some(format!("paper-{execution}")),
            timestamp: intent.created_at,
        };

        self.orders.write().await.insert(
            intent.order_id.clone(),
            OrderStatusReport {
                instrument: intent.instrument.clone(),
                order_id: intent.order_id.clone(),
                state: OrderState::Filled,
                filled_quantity: intent.quantity,
                average_price: Some(price),
            },
        );

        info!(
            instrument = %intent.instrument,
            order_id = %intent.order_id,
            side = intent.side.as_str(),
            purpose = %intent.purpose.label(),
            quantity = intent.quantity,
            price = %price.round_dp(2),
            "Paper fill"
        );

        self.fills
            .send(fill)
            .map_err(|_| GatewayError::Transport("fill channel closed".to_string()))?;

        Ok(OrderAck {
            order_id: intent.order_id.clone(),
            accepted_at: intent.created_at,
        })
    }

    async fn order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, GatewayError> {
        debug!(instrument = %instrument, order_id = %order_id, "Paper status query");
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))
    }
}
