//! Database persistence for lifecycle state.
//!
//! Stores everything needed to resume after restart:
//! - Tracked instruments and their frozen markers
//! - Open positions with their stage fills
//! - Exit history, which doubles as the rebuy restriction ledger
//! - Order log, so unconfirmed orders are queried rather than resubmitted
//! - Engine run state

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{ExitEvent, ExitReason, OrderIntent, Position, RestrictionEntry, TrackedInstrument};
use crate::trading::RestoredLifecycle;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Engine state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EngineState {
    pub id: i64,
    pub is_running: bool,
    pub gateway: String,
    pub events_processed: i64,
    pub last_heartbeat_at: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Stored tracked instrument record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredInstrument {
    pub instrument: String,
    pub peak_price: String,
    pub base_price: String,
    pub rise_rate: String,
    pub rise_days: i64,
    pub discovered_at: DateTime<Utc>,
    pub peak_at: DateTime<Utc>,
    pub frozen_reason: Option<String>,
    pub updated_at: String,
}

impl StoredInstrument {
    pub fn to_tracked(&self) -> Result<TrackedInstrument> {
        Ok(TrackedInstrument {
            instrument: self.instrument.clone(),
            peak_price: parse_decimal(&self.peak_price)?,
            base_price: parse_decimal(&self.base_price)?,
            rise_rate: parse_decimal(&self.rise_rate)?,
            rise_days: u32::try_from(self.rise_days).context("rise_days out of range")?,
            discovered_at: self.discovered_at,
            peak_at: self.peak_at,
        })
    }
}

/// Stored exit record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredExit {
    pub id: i64,
    pub instrument: String,
    pub reason: String,
    pub price: String,
    pub quantity: i64,
    pub average_cost: String,
    pub stages: i64,
    pub exited_at: DateTime<Utc>,
    pub exit_date: NaiveDate,
    pub restricted_until: NaiveDate,
}

impl StoredExit {
    pub fn to_entry(&self) -> Result<RestrictionEntry> {
        let reason = ExitReason::parse(&self.reason)
            .with_context(|| format!("Unknown exit reason '{}'", self.reason))?;

        Ok(RestrictionEntry {
            event: ExitEvent {
                instrument: self.instrument.clone(),
                reason,
                price: parse_decimal(&self.price)?,
                quantity: u64::try_from(self.quantity).context("exit quantity out of range")?,
                average_cost: parse_decimal(&self.average_cost)?,
                stages: u8::try_from(self.stages).context("stage count out of range")?,
                exited_at: self.exited_at,
            },
            exit_date: self.exit_date,
            restricted_until: self.restricted_until,
        })
    }
}

/// Stored order log record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub order_id: String,
    pub instrument: String,
    pub side: String,
    pub purpose: String,
    pub quantity: i64,
    pub payload: String,
    pub status: String,
    pub detail: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: String,
}

impl StoredOrder {
    pub fn intent(&self) -> Result<OrderIntent> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt order payload for {}", self.order_id))
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "submitted" | "accepted")
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    value
        .parse()
        .with_context(|| format!("Invalid decimal '{value}'"))
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // every in-memory connection is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Engine state table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running INTEGER NOT NULL DEFAULT 0,
                gateway TEXT NOT NULL DEFAULT '',
                events_processed INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tracked instruments
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_instruments (
                instrument TEXT PRIMARY KEY,
                peak_price TEXT NOT NULL,
                base_price TEXT NOT NULL,
                rise_rate TEXT NOT NULL,
                rise_days INTEGER NOT NULL,
                discovered_at TEXT NOT NULL,
                peak_at TEXT NOT NULL,
                frozen_reason TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Open positions, one per instrument
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                instrument TEXT PRIMARY KEY,
                quantity INTEGER NOT NULL,
                average_cost TEXT NOT NULL,
                stages INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Exit history / rebuy restrictions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                reason TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                average_cost TEXT NOT NULL,
                stages INTEGER NOT NULL,
                exited_at TEXT NOT NULL,
                exit_date TEXT NOT NULL,
                restricted_until TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Order log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_log (
                order_id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                purpose TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'submitted',
                detail TEXT,
                submitted_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_exit_events_instrument ON exit_events(instrument)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_exit_events_until ON exit_events(restricted_until)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_order_log_status ON order_log(instrument, status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Engine State ====================

    /// Initialize or reset engine state for a new run.
    pub async fn init_engine_state(&self, gateway: &str) -> Result<EngineState> {
        sqlx::query(
            r#"
            INSERT INTO engine_state (id, is_running, gateway, events_processed, started_at, updated_at)
            VALUES (1, 1, ?, 0, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                is_running = 1,
                gateway = excluded.gateway,
                events_processed = 0,
                started_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .bind(gateway)
        .execute(&self.pool)
        .await?;

        self.get_engine_state().await
    }

    /// Get current engine state.
    pub async fn get_engine_state(&self) -> Result<EngineState> {
        sqlx::query_as::<_, EngineState>("SELECT * FROM engine_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Engine state not initialized")
    }

    /// Record a heartbeat with the running event count.
    pub async fn record_heartbeat(&self, events_processed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE engine_state SET
                events_processed = ?,
                last_heartbeat_at = datetime('now'),
                updated_at = datetime('now')
            WHERE id = 1
            "#,
        )
        .bind(events_processed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark engine as stopped.
    pub async fn mark_engine_stopped(&self) -> Result<()> {
        sqlx::query("UPDATE engine_state SET is_running = 0, updated_at = datetime('now') WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Instruments ====================

    /// Save or update a tracked instrument. The frozen marker is preserved.
    pub async fn save_instrument(&self, instrument: &TrackedInstrument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracked_instruments (instrument, peak_price, base_price, rise_rate, rise_days, discovered_at, peak_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(instrument) DO UPDATE SET
                peak_price = excluded.peak_price,
                base_price = excluded.base_price,
                rise_rate = excluded.rise_rate,
                rise_days = excluded.rise_days,
                discovered_at = excluded.discovered_at,
                peak_at = excluded.peak_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(&instrument.instrument)
        .bind(instrument.peak_price.to_string())
        .bind(instrument.base_price.to_string())
        .bind(instrument.rise_rate.to_string())
        .bind(i64::from(instrument.rise_days))
        .bind(instrument.discovered_at)
        .bind(instrument.peak_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get all tracked instruments.
    pub async fn get_instruments(&self) -> Result<Vec<StoredInstrument>> {
        sqlx::query_as::<_, StoredInstrument>(
            "SELECT * FROM tracked_instruments ORDER BY instrument",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch instruments")
    }

    /// Remove an instrument from tracking.
    pub async fn remove_instrument(&self, instrument: &str) -> Result<()> {
        sqlx::query("DELETE FROM tracked_instruments WHERE instrument = ?")
            .bind(instrument)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Set or clear the frozen marker. Returns `false` for an unknown instrument.
    pub async fn set_frozen(&self, instrument: &str, reason: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tracked_instruments SET frozen_reason = ?, updated_at = datetime('now') WHERE instrument = ?",
        )
        .bind(reason)
        .bind(instrument)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ==================== Positions ====================

    /// Save or replace the open position for an instrument.
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let payload = serde_json::to_string(position).context("Failed to encode position")?;

        sqlx::query(
            r#"
            INSERT INTO positions (instrument, quantity, average_cost, stages, payload)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(instrument) DO UPDATE SET
                quantity = excluded.quantity,
                average_cost = excluded.average_cost,
                stages = excluded.stages,
                payload = excluded.payload,
                updated_at = datetime('now')
            "#,
        )
        .bind(&position.instrument)
        .bind(position.quantity as i64)
        .bind(position.average_cost.to_string())
        .bind(i64::from(position.stages_filled()))
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get all open positions.
    pub async fn get_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT payload FROM positions ORDER BY instrument")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch positions")?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).context("Corrupt position payload"))
            .collect()
    }

    /// Delete a closed position.
    pub async fn delete_position(&self, instrument: &str) -> Result<()> {
        sqlx::query("DELETE FROM positions WHERE instrument = ?")
            .bind(instrument)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Exits ====================

    /// Append an exit to the restriction ledger.
    pub async fn record_exit(&self, entry: &RestrictionEntry) -> Result<i64> {
        let event = &entry.event;
        let result = sqlx::query(
            r#"
            INSERT INTO exit_events (
                instrument, reason, price, quantity, average_cost,
                stages, exited_at, exit_date, restricted_until
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.instrument)
        .bind(event.reason.as_str())
        .bind(event.price.to_string())
        .bind(event.quantity as i64)
        .bind(event.average_cost.to_string())
        .bind(i64::from(event.stages))
        .bind(event.exited_at)
        .bind(entry.exit_date)
        .bind(entry.restricted_until)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get exit history, optionally for one instrument, oldest first.
    pub async fn get_exits(&self, instrument: Option<&str>) -> Result<Vec<RestrictionEntry>> {
        let rows = match instrument {
            Some(instrument) => {
                sqlx::query_as::<_, StoredExit>(
                    "SELECT * FROM exit_events WHERE instrument = ? ORDER BY exited_at, id",
                )
                .bind(instrument)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredExit>("SELECT * FROM exit_events ORDER BY exited_at, id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to fetch exit history")?;

        rows.iter().map(StoredExit::to_entry).collect()
    }

    /// Get exits whose restriction is still in force on `as_of`.
    pub async fn get_active_restrictions(&self, as_of: NaiveDate) -> Result<Vec<RestrictionEntry>> {
        let rows = sqlx::query_as::<_, StoredExit>(
            "SELECT * FROM exit_events WHERE restricted_until >= ? ORDER BY instrument, exited_at",
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch restrictions")?;

        rows.iter().map(StoredExit::to_entry).collect()
    }

    /// Delete exits whose restriction ended before `cutoff`.
    pub async fn prune_exits(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM exit_events WHERE restricted_until < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ==================== Orders ====================

    /// Log a submitted order.
    pub async fn record_order(&self, intent: &OrderIntent) -> Result<()> {
        let payload = serde_json::to_string(intent).context("Failed to encode order")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO order_log (
                order_id, instrument, side, purpose, quantity, payload, status, submitted_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'submitted', ?)
            "#,
        )
        .bind(&intent.order_id)
        .bind(&intent.instrument)
        .bind(intent.side.as_str())
        .bind(intent.purpose.label())
        .bind(intent.quantity as i64)
        .bind(payload)
        .bind(intent.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update order status.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE order_log SET
                status = ?,
                detail = COALESCE(?, detail),
                updated_at = datetime('now')
            WHERE order_id = ?
            "#,
        )
        .bind(status)
        .bind(detail)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get orders that never reached a final status.
    pub async fn get_open_orders(&self) -> Result<Vec<StoredOrder>> {
        sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM order_log WHERE status IN ('submitted', 'accepted') ORDER BY submitted_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open orders")
    }

    /// Get recent orders for an instrument, newest first.
    pub async fn get_orders(&self, instrument: &str, limit: i64) -> Result<Vec<StoredOrder>> {
        sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM order_log WHERE instrument = ? ORDER BY submitted_at DESC LIMIT ?",
        )
        .bind(instrument)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders")
    }

    // ==================== Restore ====================

    /// Assemble every persisted lifecycle for a restart.
    pub async fn load_lifecycles(&self) -> Result<Vec<RestoredLifecycle>> {
        let mut positions: HashMap<String, Position> = self
            .get_positions()
            .await?
            .into_iter()
            .map(|p| (p.instrument.clone(), p))
            .collect();

        let mut orders: HashMap<String, Vec<(OrderIntent, DateTime<Utc>)>> = HashMap::new();
        for order in self.get_open_orders().await? {
            let intent = order.intent()?;
            orders
                .entry(order.instrument.clone())
                .or_default()
                .push((intent, order.submitted_at));
        }

        let mut restored = Vec::new();
        for stored in self.get_instruments().await? {
            restored.push(RestoredLifecycle {
                instrument: stored.to_tracked()?,
                position: positions.remove(&stored.instrument),
                frozen: stored.frozen_reason.clone(),
                open_orders: orders.remove(&stored.instrument).unwrap_or_default(),
            });
        }

        // A position without an instrument row still needs managing.
        for (instrument, position) in positions {
            let tracked = TrackedInstrument::new(
                &instrument,
                position.average_cost,
                Decimal::ZERO,
                1,
                position.opened_at,
            );
            restored.push(RestoredLifecycle {
                instrument: tracked,
                open_orders: orders.remove(&instrument).unwrap_or_default(),
                position: Some(position),
                frozen: None,
            });
        }

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderPrice, OrderPurpose, OrderSide, Stage, StageFill};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn position() -> Position {
        Position::open(
            "005930",
            StageFill {
                stage: Stage::First,
                price: dec!(750),
                quantity: 666,
                order_id: "o1".to_string(),
                filled_at: at(),
                executions: vec!["x1".to_string()],
            },
        )
    }

    fn entry(instrument: &str, until: NaiveDate) -> RestrictionEntry {
        RestrictionEntry {
            event: ExitEvent {
                instrument: instrument.to_string(),
                reason: ExitReason::TrailingStop,
                price: dec!(764.8),
                quantity: 666,
                average_cost: dec!(750),
                stages: 1,
                exited_at: at(),
            },
            exit_date: date(4),
            restricted_until: until,
        }
    }

    fn intent(order_id: &str) -> OrderIntent {
        OrderIntent {
            order_id: order_id.to_string(),
            instrument: "005930".to_string(),
            side: OrderSide::Buy,
            quantity: 405,
            price: OrderPrice::Limit(dec!(740)),
            urgent: false,
            purpose: OrderPurpose::Entry(Stage::Second),
            reference_price: dec!(740),
            created_at: at(),
        }
    }

    #[tokio::test]
    async fn test_instrument_round_trip_keeps_frozen_marker() {
        let db = db().await;
        let tracked = TrackedInstrument::new("005930", dec!(1000), dec!(40), 2, at());
        db.save_instrument(&tracked).await.unwrap();
        assert!(db.set_frozen("005930", Some("stage 1 already filled")).await.unwrap());

        // re-saving after a new peak must not clear the marker
        let mut higher = tracked.clone();
        let offset = chrono::FixedOffset::east_opt(9 * 3600).unwrap();
        higher.observe_high(dec!(1100), at() + chrono::Duration::days(1), offset);
        assert_eq!(higher.rise_days, 3);
        db.save_instrument(&higher).await.unwrap();

        let stored = db.get_instruments().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].frozen_reason.as_deref(), Some("stage 1 already filled"));
        assert_eq!(stored[0].to_tracked().unwrap(), higher);

        assert!(!db.set_frozen("000660", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_position_save_and_delete() {
        let db = db().await;
        let pos = position();
        db.save_position(&pos).await.unwrap();
        db.save_position(&pos).await.unwrap();

        let positions = db.get_positions().await.unwrap();
        assert_eq!(positions, vec![pos]);

        db.delete_position("005930").await.unwrap();
        assert!(db.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_ledger_and_prune() {
        let db = db().await;
        db.record_exit(&entry("005930", date(11))).await.unwrap();
        db.record_exit(&entry("000660", date(6))).await.unwrap();

        let all = db.get_exits(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(db.get_exits(Some("005930")).await.unwrap(), vec![entry("005930", date(11))]);

        let active = db.get_active_restrictions(date(8)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event.instrument, "005930");

        assert_eq!(db.prune_exits(date(8)).await.unwrap(), 1);
        assert_eq!(db.get_exits(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_orders_feed_restore() {
        let db = db().await;
        let tracked = TrackedInstrument::new("005930", dec!(1000), dec!(40), 1, at());
        db.save_instrument(&tracked).await.unwrap();
        db.save_position(&position()).await.unwrap();

        db.record_order(&intent("filled")).await.unwrap();
        db.update_order_status("filled", "filled", None).await.unwrap();
        db.record_order(&intent("working")).await.unwrap();
        db.update_order_status("working", "accepted", None).await.unwrap();

        let open = db.get_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].intent().unwrap(), intent("working"));

        let restored = db.load_lifecycles().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].instrument, tracked);
        assert_eq!(restored[0].position.as_ref().map(|p| p.quantity), Some(666));
        assert_eq!(restored[0].open_orders.len(), 1);
        assert_eq!(restored[0].open_orders[0].1, at());
    }

    #[tokio::test]
    async fn test_orphan_position_is_restored() {
        let db = db().await;
        db.save_position(&position()).await.unwrap();

        let restored = db.load_lifecycles().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].instrument.instrument, "005930");
        assert!(restored[0].position.is_some());
    }

    #[tokio::test]
    async fn test_engine_state_lifecycle() {
        let db = db().await;
        let state = db.init_engine_state("paper").await.unwrap();
        assert!(state.is_running);
        assert_eq!(state.gateway, "paper");

        db.record_heartbeat(42).await.unwrap();
        db.mark_engine_stopped().await.unwrap();

        let state = db.get_engine_state().await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.events_processed, 42);
        assert!(state.last_heartbeat_at.is_some());
    }
}
