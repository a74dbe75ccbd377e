//! Engine runner: routes feed events to per-instrument workers.
//!
//! Handles:
//! - One worker task per instrument, each owning its own controller
//! - Carrying out controller commands (orders, persistence, alerts)
//! - Heartbeats on the wall clock or the event clock
//! - Restoring every lifecycle from the database on start

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::db::Database;
use crate::feed::FeedEvent;
use crate::gateway::{submit_with_retry, GatewayError, OrderGateway, RetryPolicy};
use crate::models::{FillEvent, OrderIntent, OrderState, OrderStatusReport};
use crate::trading::{Command, ControlEvent, ControllerConfig, PositionController, RestoredLifecycle};

/// Source of "now" for heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ClockMode {
    /// System time; for live feeds
    Wall,
    /// Latest event timestamp; for replays
    Event,
}

/// Idle time after the feed closes before the engine stops waiting for fills.
const DRAIN_IDLE: Duration = Duration::from_millis(250);

struct WorkerHandle {
    tx: mpsc::Sender<ControlEvent>,
    task: JoinHandle<()>,
}

/// Run totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub events: u64,
    pub workers: usize,
    pub heartbeats: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Engine Run ===")?;
        writeln!(f, "Events:      {}", self.events)?;
        writeln!(f, "Instruments: {}", self.workers)?;
        writeln!(f, "Heartbeats:  {}", self.heartbeats)?;
        Ok(())
    }
}

pub struct Engine {
    config: ControllerConfig,
    clock: ClockMode,
    db: Database,
    gateway: Arc<dyn OrderGateway>,
    workers: HashMap<String, WorkerHandle>,
    event_clock: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    stats: EngineStats,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        config: ControllerConfig,
        clock: ClockMode,
        db: Database,
        gateway: Arc<dyn OrderGateway>,
    ) -> Self {
        Self {
            config,
            clock,
            db,
            gateway,
            workers: HashMap::new(),
            event_clock: None,
            last_heartbeat: None,
            stats: EngineStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restore persisted lifecycles and mark the engine running.
    pub async fn initialize(&mut self) -> Result<()> {
        info!(gateway = self.gateway.name(), clock = ?self.clock, "Initializing engine...");
        self.db.init_engine_state(self.gateway.name()).await?;

        let restored = self.db.load_lifecycles().await?;
        info!(count = restored.len(), "Restoring lifecycles");

        for lifecycle in restored {
            let instrument = lifecycle.instrument.instrument.clone();
            if let Err(e) = self.spawn_worker(&instrument, Some(lifecycle)).await {
                error!(instrument = %instrument, error = %e, "Failed to restore lifecycle");
            }
        }

        Ok(())
    }

    /// Main run loop. Returns when the feed closes or on shutdown.
    pub async fn run(
        mut self,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut fills: mpsc::UnboundedReceiver<FillEvent>,
    ) -> Result<EngineStats> {
        info!(
            heartbeat_secs = self.config.runtime.heartbeat_secs,
            "Starting engine run loop"
        );

        let mut heartbeat = interval(Duration::from_secs(self.config.runtime.heartbeat_secs));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("Feed closed");
                        self.drain_fills(&mut fills).await;
                        break;
                    }
                },
                Some(fill) = fills.recv() => self.route(ControlEvent::Fill(fill)).await,
                _ = heartbeat.tick() => {
                    if self.clock == ClockMode::Wall {
                        self.broadcast_heartbeat(Utc::now()).await;
                    }
                }
            }
        }

        // Graceful shutdown
        self.shutdown().await
    }

    async fn dispatch(&mut self, event: FeedEvent) {
        self.stats.events += 1;

        if let Some(ts) = event.timestamp() {
            self.event_clock = Some(self.event_clock.map_or(ts, |c| c.max(ts)));
        }
        let now = match self.clock {
            ClockMode::Wall => Utc::now(),
            ClockMode::Event => self.event_clock.unwrap_or_else(Utc::now),
        };

        self.route(event.into_control(now)).await;

        if self.clock == ClockMode::Event {
            let due = self.last_heartbeat.map_or(true, |last| {
                (now - last).num_seconds() >= self.config.runtime.heartbeat_secs as i64
            });
            if due {
                self.broadcast_heartbeat(now).await;
            }
        }
    }

    async fn route(&mut self, event: ControlEvent) {
        let Some(instrument) = event.instrument().map(str::to_string) else {
            return;
        };

        let existing = self.workers.get(&instrument).map(|h| h.tx.clone());
        let event = match existing {
            Some(tx) => match tx.send(event).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    warn!(instrument = %instrument, "Worker stopped, respawning");
                    self.workers.remove(&instrument);
                    event
                }
            },
            None => event,
        };

        // Only a registration or a fill can start a lifecycle.
        if !matches!(event, ControlEvent::Track(_) | ControlEvent::Fill(_)) {
            trace!(instrument = %instrument, "Event for unmanaged instrument dropped");
            return;
        }

        let restored = match self.restore_one(&instrument).await {
            Ok(restored) => restored,
            Err(e) => {
                error!(instrument = %instrument, error = %e, "Failed to load lifecycle");
                None
            }
        };

        match self.spawn_worker(&instrument, restored).await {
            Ok(tx) => {
                if tx.send(event).await.is_err() {
                    error!(instrument = %instrument, "New worker exited immediately");
                }
            }
            Err(e) => error!(instrument = %instrument, error = %e, "Failed to start worker"),
        }
    }

    /// Persisted state for one instrument, for respawning a worker.
    async fn restore_one(&self, instrument: &str) -> Result<Option<RestoredLifecycle>> {
        Ok(self
            .db
            .load_lifecycles()
            .await?
            .into_iter()
            .find(|l| l.instrument.instrument == instrument))
    }

    async fn spawn_worker(
        &mut self,
        instrument: &str,
        restored: Option<RestoredLifecycle>,
    ) -> Result<mpsc::Sender<ControlEvent>> {
        let mut controller = PositionController::new(self.config.clone());
        controller.load_restrictions(self.db.get_exits(Some(instrument)).await?);
        if let Some(lifecycle) = restored {
            controller.restore(lifecycle);
        }

        let (tx, rx) = mpsc::channel(self.config.runtime.inbox_capacity);
        let worker = Worker {
            instrument: instrument.to_string(),
            controller,
            rx,
            loopback: tx.downgrade(),
            db: self.db.clone(),
            gateway: self.gateway.clone(),
            retry: RetryPolicy::from_config(&self.config.runtime),
        };

        let task = tokio::spawn(worker.run());
        debug!(instrument = %instrument, "Worker started");
        self.workers.insert(
            instrument.to_string(),
            WorkerHandle {
                tx: tx.clone(),
                task,
            },
        );
        self.stats.workers = self.workers.len();

        Ok(tx)
    }

    async fn broadcast_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
        self.stats.heartbeats += 1;

        let senders: Vec<mpsc::Sender<ControlEvent>> =
            self.workers.values().map(|h| h.tx.clone()).collect();
        for tx in senders {
            tx.send(ControlEvent::Heartbeat { now }).await.ok();
        }

        if let Err(e) = self.db.record_heartbeat(self.stats.events as i64).await {
            warn!(error = %e, "Failed to record heartbeat");
        }
    }

    /// Route fills still in flight after the feed has closed.
    async fn drain_fills(&mut self, fills: &mut mpsc::UnboundedReceiver<FillEvent>) {
        while let Ok(Some(fill)) = tokio::time::timeout(DRAIN_IDLE, fills.recv()).await {
            self.route(ControlEvent::Fill(fill)).await;
        }
    }

    /// Graceful shutdown.
    async fn shutdown(mut self) -> Result<EngineStats> {
        info!("Shutting down engine...");

        // closing the inboxes lets each worker finish its queue and exit
        let tasks: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, h)| h.task).collect();
        let results = futures::future::join_all(tasks).await;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        self.db.record_heartbeat(self.stats.events as i64).await?;
        self.db.mark_engine_stopped().await?;

        info!(events = self.stats.events, "Engine shutdown complete");
        Ok(self.stats)
    }
}

/// Owns one instrument's controller and applies its commands in order.
struct Worker {
    instrument: String,
    controller: PositionController,
    rx: mpsc::Receiver<ControlEvent>,
    loopback: mpsc::WeakSender<ControlEvent>,
    db: Database,
    gateway: Arc<dyn OrderGateway>,
    retry: RetryPolicy,
}

impl Worker {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let commands = self.controller.handle(event);
            for command in commands {
                self.execute(command).await;
            }
        }
        debug!(instrument = %self.instrument, "Worker stopped");
    }

    async fn execute(&self, command: Command) {
        let result = match command {
            Command::Submit(intent) => self.submit(intent).await,
            Command::QueryOrder {
                instrument,
                order_id,
            } => {
                self.query(instrument, order_id);
                Ok(())
            }
            Command::SaveInstrument(instrument) => self.db.save_instrument(&instrument).await,
            Command::RemoveInstrument { instrument } => self.db.remove_instrument(&instrument).await,
            Command::SavePosition(position) => self.db.save_position(&position).await,
            Command::DeletePosition { instrument } => self.db.delete_position(&instrument).await,
            Command::RecordExit(entry) => self.db.record_exit(&entry).await.map(|_| ()),
            Command::OrderUpdate {
                order_id,
                status,
                detail,
            } => {
                self.db
                    .update_order_status(&order_id, status.as_str(), detail.as_deref())
                    .await
            }
            Command::Freeze { instrument, reason } => {
                self.db.set_frozen(&instrument, Some(&reason)).await.map(|_| ())
            }
            Command::Unfreeze { instrument } => {
                self.db.set_frozen(&instrument, None).await.map(|_| ())
            }
            Command::Alert {
                instrument,
                message,
            } => {
                error!(instrument = %instrument, message = %message, "ALERT");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(instrument = %self.instrument, error = %e, "Failed to apply command");
        }
    }

    /// Log the order, then deliver it off the worker so retries never block
    /// event processing. The outcome comes back through the inbox.
    async fn submit(&self, intent: OrderIntent) -> Result<()> {
        self.db.record_order(&intent).await?;

        let Some(loopback) = self.loopback.upgrade() else {
            warn!(instrument = %self.instrument, order_id = %intent.order_id, "Engine stopping, order not sent");
            return Ok(());
        };
        let gateway = self.gateway.clone();
        let retry = self.retry;

        tokio::spawn(async move {
            let event = match submit_with_retry(gateway.as_ref(), &intent, retry).await {
                Ok(ack) => ControlEvent::Accepted {
                    instrument: intent.instrument.clone(),
                    order_id: ack.order_id,
                },
                Err(e) => {
                    warn!(
                        instrument = %intent.instrument,
                        order_id = %intent.order_id,
                        error = %e,
                        "Order submission failed"
                    );
                    ControlEvent::Rejected {
                        instrument: intent.instrument.clone(),
                        order_id: intent.order_id.clone(),
                        reason: e.to_string(),
                    }
                }
            };
            loopback.send(event).await.ok();
        });

        Ok(())
    }

    fn query(&self, instrument: String, order_id: String) {
        let Some(loopback) = self.loopback.upgrade() else {
            return;
        };
        let gateway = self.gateway.clone();

        tokio::spawn(async move {
            let report = match gateway.order_status(&instrument, &order_id).await {
                Ok(report) => report,
                // never reached the venue
                Err(GatewayError::UnknownOrder(_)) => OrderStatusReport {
                    instrument: instrument.clone(),
                    order_id: order_id.clone(),
                    state: OrderState::Rejected,
                    filled_quantity: 0,
                    average_price: None,
                },
                Err(e) => {
                    warn!(instrument = %instrument, order_id = %order_id, error = %e, "Status query failed");
                    return;
                }
            };
            loopback.send(ControlEvent::OrderStatus(report)).await.ok();
        });
    }
}
