//! Tumepok: staged position lifecycle controller.
//!
//! Tracks instruments after a sharp rise, buys the pullback in up to three
//! stages, liquidates on stop-loss or trailing stop and blocks re-entry for
//! a number of trading days after each exit.

mod db;
mod engine;
mod feed;
mod gateway;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::db::Database;
use crate::engine::{ClockMode, Engine};
use crate::gateway::{JsonLinesGateway, OrderGateway, PaperGateway};
use crate::metrics::ExitCalculator;
use crate::trading::{ControllerConfig, LifecycleState, PositionController};

/// Staged entry / exit controller CLI.
#[derive(Parser)]
#[command(name = "tumepok")]
#[command(about = "Staged pullback entries with stop-loss, trailing stop and rebuy restrictions", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "TUMEPOK_DATABASE_URL", default_value = "sqlite:./tumepok.db?mode=rwc")]
    database: String,

    /// Controller configuration file (JSON); defaults apply when omitted
    #[arg(short, long, env = "TUMEPOK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GatewayKind {
    /// Fill every order immediately in-process
    Paper,
    /// Write orders as JSON lines for an external broker adapter
    JsonLines,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller over an event feed
    Run {
        /// Event file (JSON lines); reads stdin when omitted
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Where orders go
        #[arg(short, long, value_enum, default_value = "paper")]
        gateway: GatewayKind,

        /// Order output file for the json-lines gateway; stdout when omitted
        #[arg(short, long)]
        orders: Option<PathBuf>,

        /// Clock for heartbeats: wall for live feeds, event for replays
        #[arg(long, value_enum, default_value = "wall")]
        clock: ClockMode,

        /// Simulated slippage percentage for paper market orders
        #[arg(long, default_value = "0.1")]
        slippage: Decimal,
    },

    /// Show every persisted lifecycle
    Status,

    /// List rebuy restrictions
    Restrictions {
        /// Only this instrument, including expired entries
        #[arg(short, long)]
        instrument: Option<String>,
    },

    /// Show the order log for an instrument
    Orders {
        instrument: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Clear the frozen marker on an instrument
    Release {
        instrument: String,
    },

    /// Delete exit history older than the given number of days
    Prune {
        #[arg(short, long, default_value = "90")]
        keep_days: i64,
    },

    /// Show exit statistics
    Stats {
        /// Only this instrument
        #[arg(short, long)]
        instrument: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for orders and reports
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ControllerConfig::load(cli.config.as_deref())?;
    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Run {
            events,
            gateway,
            orders,
            clock,
            slippage,
        } => {
            let (fill_tx, fill_rx) = mpsc::unbounded_channel();
            let gateway: Arc<dyn OrderGateway> = match gateway {
                GatewayKind::Paper => Arc::new(PaperGateway::new(fill_tx, slippage)),
                GatewayKind::JsonLines => match orders {
                    Some(path) => {
                        let file = tokio::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&path)
                            .await
                            .with_context(|| format!("Failed to open {}", path.display()))?;
                        Arc::new(JsonLinesGateway::new(file))
                    }
                    None => Arc::new(JsonLinesGateway::new(tokio::io::stdout())),
                },
            };

            let reader: Box<dyn AsyncRead + Unpin + Send> = match &events {
                Some(path) => Box::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdin()),
            };

            let mut engine = Engine::new(config.clone(), clock, db.clone(), gateway);
            engine.initialize().await?;

            let (feed_tx, feed_rx) = mpsc::channel(config.runtime.inbox_capacity);
            let feed = tokio::spawn(feed::read_events(reader, feed_tx));

            info!(
                events = %events.as_ref().map_or("stdin".to_string(), |p| p.display().to_string()),
                clock = ?clock,
                "Controller running. Press Ctrl+C to stop."
            );

            let stats = engine.run(feed_rx, fill_rx).await?;
            feed.abort();
            match feed.await {
                Ok(Ok(feed_stats)) if feed_stats.malformed > 0 => {
                    error!(malformed = feed_stats.malformed, "Feed contained malformed lines");
                }
                Ok(Err(e)) => error!(error = %e, "Feed reader failed"),
                _ => {}
            }

            eprintln!("\n{}", stats);
        }

        Commands::Status => {
            let mut controller = PositionController::new(config.clone());
            controller.load_restrictions(db.get_exits(None).await?);
            for lifecycle in db.load_lifecycles().await? {
                controller.restore(lifecycle);
            }

            let views = controller.views();
            if views.is_empty() {
                println!("No instruments under management.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<14} {:>10} {:>8} {:>8} {:>12} {:>10}  {}",
                "INSTRUMENT", "STATE", "PEAK", "RISE%", "QTY", "AVG COST", "P&L%", "NOTE"
            );
            println!("{}", "-".repeat(92));

            for view in views {
                let (quantity, average_cost) = view
                    .position
                    .as_ref()
                    .map(|p| (p.quantity.to_string(), p.average_cost.round_dp(2).to_string()))
                    .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
                let pnl = match (&view.position, view.last_price) {
                    (Some(p), Some(price)) => format!("{:+.2}", p.profit_rate(price)),
                    _ => "-".to_string(),
                };
                let note = match (&view.frozen, view.restricted_until) {
                    (Some(reason), _) => format!("FROZEN: {reason}"),
                    (None, Some(until)) if view.state == LifecycleState::Cooldown => {
                        format!("restricted until {until}")
                    }
                    _ => view.pending_order.map(|id| format!("order {id}")).unwrap_or_default(),
                };

                println!(
                    "{:<12} {:<14} {:>10} {:>8} {:>8} {:>12} {:>10}  {}",
                    view.instrument,
                    view.state.to_string(),
                    view.peak_price.round_dp(2),
                    view.rise_rate.round_dp(1),
                    quantity,
                    average_cost,
                    pnl,
                    note
                );
            }

            let state = db.get_engine_state().await.ok();
            if let Some(state) = state {
                println!(
                    "\nEngine: {} via {} ({} events, last heartbeat {})",
                    if state.is_running { "running" } else { "stopped" },
                    state.gateway,
                    state.events_processed,
                    state.last_heartbeat_at.unwrap_or_else(|| "never".to_string())
                );
            }
        }

        Commands::Restrictions { instrument } => {
            let entries = match &instrument {
                Some(id) => db.get_exits(Some(id)).await?,
                None => {
                    let today = config.market.market_date(Utc::now());
                    db.get_active_restrictions(today).await?
                }
            };

            if entries.is_empty() {
                println!("No restrictions.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<14} {:>10} {:>10} {:<12} {:<12}",
                "INSTRUMENT", "REASON", "PRICE", "RETURN%", "EXITED", "UNTIL"
            );
            println!("{}", "-".repeat(76));
            for entry in entries {
                println!(
                    "{:<12} {:<14} {:>10} {:>10} {:<12} {:<12}",
                    entry.event.instrument,
                    entry.event.reason.as_str(),
                    entry.event.price.round_dp(2),
                    format!("{:+.2}", entry.event.return_pct()),
                    entry.exit_date,
                    entry.restricted_until
                );
            }
        }

        Commands::Orders { instrument, limit } => {
            let orders = db.get_orders(&instrument, limit).await?;
            if orders.is_empty() {
                println!("No orders for {}.", instrument);
                return Ok(());
            }

            println!(
                "\n{:<38} {:<5} {:<20} {:>8} {:<17} {:<20}",
                "ORDER ID", "SIDE", "PURPOSE", "QTY", "STATUS", "SUBMITTED"
            );
            println!("{}", "-".repeat(112));
            for order in orders {
                let marker = if order.is_open() { "*" } else { "" };
                println!(
                    "{:<38} {:<5} {:<20} {:>8} {:<17} {:<20}",
                    order.order_id,
                    order.side,
                    order.purpose,
                    order.quantity,
                    format!("{}{}", order.status, marker),
                    order.submitted_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(detail) = order.detail {
                    println!("    {}", detail);
                }
            }
        }

        Commands::Release { instrument } => {
            if db.set_frozen(&instrument, None).await? {
                info!(instrument = %instrument, "Frozen marker cleared");
                println!("Released: {}", instrument);
            } else {
                println!("Not tracked: {}", instrument);
            }
        }

        Commands::Prune { keep_days } => {
            let cutoff = config.market.market_date(Utc::now() - Duration::days(keep_days));
            let removed = db.prune_exits(cutoff).await?;
            println!("Removed {} exit records before {}", removed, cutoff);
        }

        Commands::Stats { instrument } => {
            let mut entries = db.get_exits(instrument.as_deref()).await?;
            entries.sort_by_key(|e| e.event.exited_at);
            let stats = ExitCalculator::calculate(entries.iter().map(|e| &e.event));
            println!("\n{}", stats);
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
