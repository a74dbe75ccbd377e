//! Inbound event feed: one JSON object per line.
//!
//! ```text
//! {"type":"track","instrument":"005930","peak_price":"1000","rise_rate":"40","rise_days":1}
//! {"type":"tick","instrument":"005930","price":"750","volume":5000,"timestamp":"2024-03-04T01:00:00Z"}
//! {"type":"indicators","instrument":"005930","oscillator":"28"}
//! {"type":"fill","instrument":"005930","stage":1,"price":"750","quantity":666,"order_id":"...","timestamp":"..."}
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{FillEvent, IndicatorUpdate, OrderStatusReport, Tick, TrackedInstrument};
use crate::trading::ControlEvent;

/// Registration of a newly discovered riser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub instrument: String,
    pub peak_price: Decimal,
    pub rise_rate: Decimal,
    #[serde(default = "default_rise_days")]
    pub rise_days: u32,
    #[serde(default)]
    pub discovered_at: Option<DateTime<Utc>>,
}

fn default_rise_days() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Track(TrackRequest),
    Untrack { instrument: String },
    Tick(Tick),
    Indicators(IndicatorUpdate),
    Fill(FillEvent),
    OrderStatus(OrderStatusReport),
    Reject {
        instrument: String,
        order_id: String,
        reason: String,
    },
    Liquidate { instrument: String },
    Release { instrument: String },
}

impl FeedEvent {
    /// Convert to a controller event; `now` stamps registrations without a
    /// discovery time.
    pub fn into_control(self, now: DateTime<Utc>) -> ControlEvent {
        match self {
            FeedEvent::Track(req) => ControlEvent::Track(TrackedInstrument::new(
                req.instrument,
                req.peak_price,
                req.rise_rate,
                req.rise_days,
                req.discovered_at.unwrap_or(now),
            )),
            FeedEvent::Untrack { instrument } => ControlEvent::Untrack { instrument },
            FeedEvent::Tick(tick) => ControlEvent::Tick(tick),
            FeedEvent::Indicators(update) => ControlEvent::Indicators(update),
            FeedEvent::Fill(fill) => ControlEvent::Fill(fill),
            FeedEvent::OrderStatus(report) => ControlEvent::OrderStatus(report),
            FeedEvent::Reject {
                instrument,
                order_id,
                reason,
            } => ControlEvent::Rejected {
                instrument,
                order_id,
                reason,
            },
            FeedEvent::Liquidate { instrument } => ControlEvent::Liquidate { instrument },
            FeedEvent::Release { instrument } => ControlEvent::Release { instrument },
        }
    }

    /// Timestamp carried by the event, if any.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedEvent::Track(req) => req.discovered_at,
            FeedEvent::Tick(tick) => Some(tick.timestamp),
            FeedEvent::Fill(fill) => Some(fill.timestamp),
            _ => None,
        }
    }
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<FeedEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Malformed feed event")?;
    Ok(Some(event))
}

/// Feed reader totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub events: u64,
    pub malformed: u64,
}

/// Read events until EOF or until the receiver goes away.
///
/// Malformed lines are logged and skipped.
pub async fn read_events<R>(reader: R, tx: mpsc::Sender<FeedEvent>) -> Result<FeedStats>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut stats = FeedStats::default();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read feed")? {
        line_no += 1;
        match parse_line(&line) {
            Ok(Some(event)) => {
                stats.events += 1;
                if tx.send(event).await.is_err() {
                    debug!("Feed receiver closed");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                stats.malformed += 1;
                warn!(line = line_no, error = %e, "Skipping feed line");
            }
        }
    }

    Ok(stats)
}
