//! Order gateways: where order intents leave the process.
//!
//! The controller only emits intents; a gateway delivers them and answers
//! status queries. Fills come back asynchronously through the event feed
//! (or, for the paper gateway, through its fill channel).

mod json_lines;
mod paper;

pub use json_lines::JsonLinesGateway;
pub use paper::PaperGateway;

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use thiserror::Error;
use tracing::warn;

use crate::models::{OrderAck, OrderIntent, OrderStatusReport};
use crate::trading::RuntimeConfig;

/// Gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The venue refused the order; retrying will not help
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Delivery failed; the order may be retried
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver an order. An `Ok` ack means accepted for execution, not filled.
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderAck, GatewayError>;

    /// Current status of a previously submitted order.
    async fn order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, GatewayError>;
}

/// Retry schedule for entry submissions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.entry_retry_initial_ms),
            max_elapsed: Duration::from_secs(config.entry_retry_max_secs),
        }
    }
}

/// Submit an order, retrying transient failures with exponential backoff.
///
/// Urgent (exit) orders get a single attempt: a failed exit is surfaced to
/// the controller at once, which alerts and re-issues it.
pub async fn submit_with_retry(
    gateway: &dyn OrderGateway,
    intent: &OrderIntent,
    policy: RetryPolicy,
) -> Result<OrderAck, GatewayError> {
    if intent.urgent {
        return gateway.submit(intent).await;
    }

    let schedule = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_elapsed_time(Some(policy.max_elapsed))
        .build();

    backoff::future::retry(schedule, move || async move {
        gateway.submit(intent).await.map_err(|e| {
            if e.is_retryable() {
                warn!(
                    instrument = %intent.instrument,
                    order_id = %intent.order_id,
                    error = %e,
                    "Order submission failed, retrying"
                );
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}
