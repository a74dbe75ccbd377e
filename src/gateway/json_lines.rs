//! JSON-lines gateway: writes orders and status queries to a stream for an
//! external broker adapter. Fills and status reports come back through the
//! event feed.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{GatewayError, OrderGateway};
use crate::models::{OrderAck, OrderIntent, OrderState, OrderStatusReport};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Order(&'a OrderIntent),
    StatusQuery {
        instrument: &'a str,
        order_id: &'a str,
    },
}

pub struct JsonLinesGateway<W> {
    out: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesGateway<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    async fn write(&self, message: &Outbound<'_>) -> Result<(), GatewayError> {
        let mut line =
            serde_json::to_vec(message).map_err(|e| GatewayError::Transport(e.to_string()))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> OrderGateway for JsonLinesGateway<W> {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    async fn submit(&self, intent: &OrderIntent) -> Result<OrderAck, GatewayError> {
        self.write(&Outbound::Order(intent)).await?;
        debug!(instrument = %intent.instrument, order_id = %intent.order_id, "Order written");

        Ok(OrderAck {
            order_id: intent.order_id.clone(),
            accepted_at: intent.created_at,
        })
    }

    /// Requests a status report from the adapter. The answer arrives later as
    /// an `order_status` feed event, so the immediate reply is `Unknown`.
    async fn order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, GatewayError> {
        self.write(&Outbound::StatusQuery {
            instrument,
            order_id,
        })
        .await?;

        Ok(OrderStatusReport {
            instrument: instrument.to_string(),
            order_id: order_id.to_string(),
            state: OrderState::Unknown,
            filled_quantity: 0,
            average_price: None,
        })
    }
}
