//! Catalyst Trader - Main Entry Point
//!
//! Runs trading cycles on a schedule, or once, against the paper broker or an
//! Alpaca-style brokerage.

use anyhow::Result;
use catalyst_trader::broker::{BrokerClient, FillMode, HttpBroker, PaperBroker};
use catalyst_trader::config::{BrokerKind, Config, TradingMode};
use catalyst_trader::cycle::{
    Collaborators, CycleOrchestrator, CycleRequest, CycleScheduler, CycleStatus, MarketHours,
};
use catalyst_trader::events::{EventSink, FanoutSink, LogSink};
use catalyst_trader::persistence::{SqliteStore, TradeStore};
use catalyst_trader::providers::{InMemoryProviders, SyntheticMarket};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Size of the synthetic market used for signals in paper runs
const SYNTHETIC_LISTINGS: usize = 200;

/// Catalyst Trader CLI
#[derive(Parser)]
#[command(name = "catalyst-trader")]
#[command(version, about = "Catalyst-driven trading cycles with hard risk gates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run trading cycles (the default)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Trading mode: aggressive, normal or conservative
        #[arg(short, long)]
        mode: Option<TradingMode>,

        /// Ignore market hours
        #[arg(long)]
        ignore_hours: bool,

        /// Seed for the synthetic signal market
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Show recent cycles, positions and audit events from persisted state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/catalyst_trader.db")]
        db: String,

        /// Show orders and audit events
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let (once, mode, ignore_hours, seed) = match cli.command {
        Some(Commands::Status { db, verbose }) => return show_status(&db, verbose),
        Some(Commands::Run {
            once,
            mode,
            ignore_hours,
            seed,
        }) => (once, mode, ignore_hours, seed),
        None => (false, None, false, 7),
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Catalyst Trader v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut config = Config::load()?;
    if let Some(mode) = mode {
        config.cycle.mode = mode;
    }
    config.validate()?;
    log_config(&config);

    // Signal providers
    let providers = Arc::new(SyntheticMarket::seeded(SYNTHETIC_LISTINGS, seed).await);
    info!(listings = SYNTHETIC_LISTINGS, seed, "Synthetic signal market ready");

    // Broker
    let broker: Arc<dyn BrokerClient> = match config.broker.kind {
        BrokerKind::Paper => {
            info!("📝 PAPER TRADING - simulated fills");
            let paper = PaperBroker::new(config.broker.paper_equity, FillMode::Immediate);
            paper.set_prices(providers.prices().await).await;
            Arc::new(paper)
        }
        BrokerKind::Alpaca => {
            warn!("⚠️  BROKER TRADING - orders go to {}", config.broker.base_url);
            Arc::new(HttpBroker::new(
                &config.broker,
                Duration::from_secs(config.execution.broker_timeout_secs),
            )?)
        }
    };

    // Persistence and events
    if let Some(parent) = std::path::Path::new(&config.persistence.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store: Arc<dyn TradeStore> = Arc::new(SqliteStore::new(&config.persistence.db_path)?);
    let mut fanout = FanoutSink::default();
    fanout.push(Arc::new(LogSink));
    let sink: Arc<dyn EventSink> = Arc::new(fanout);

    let orchestrator = Arc::new(CycleOrchestrator::new(
        config.clone(),
        Collaborators::from_providers(providers.clone(), broker.clone(), store, sink),
    ));

    // Recover orders and positions from the last run
    let restored = orchestrator.orders().restore_from_store().await?;
    if restored > 0 {
        info!(restored, "📂 [PERSISTENCE] Restored orders and positions");
        let report = orchestrator.orders().reconcile().await;
        info!(
            corrections = report.corrections,
            protective_placed = report.protective_placed,
            "Startup reconciliation complete"
        );
    }

    // Broker event inbox
    let pump = match broker.stream_events().await {
        Ok(rx) => Some(orchestrator.orders().spawn_event_pump(rx)),
        Err(e) => {
            warn!(error = %e, "Broker event stream unavailable, relying on reconciliation");
            None
        }
    };

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));

    if once {
        let handle = orchestrator.start_cycle(CycleRequest::with_mode(config.cycle.mode)).await?;
        let stopper = orchestrator.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("🛑 Shutdown signal received");
            stopper.stop_cycle("interrupted").await;
        });

        let snapshot = orchestrator.run(&handle).await;
        if let Some(cycle) = &snapshot.cycle {
            info!("{}", cycle.summary.clone().unwrap_or_else(|| cycle.summary_text()));
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if snapshot.status == CycleStatus::Aborted {
            error!("Cycle aborted");
        }
        return Ok(());
    }

    let hours = if ignore_hours {
        MarketHours::always()
    } else {
        MarketHours::from_config(&config.market_hours)?
    };
    let scheduler = Arc::new(CycleScheduler::new(orchestrator.clone(), hours, shutdown.clone()));

    let signal_scheduler = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        signal_scheduler.shutdown();
    });

    // Fresh synthetic signals each scan interval
    let refresh_every = config.modes.profile(config.cycle.mode).scan_interval_secs.max(1);
    let refresh_stop = shutdown.clone();
    let refresh_providers: Arc<InMemoryProviders> = providers.clone();
    tokio::spawn(async move {
        let mut market = SyntheticMarket::new(seed.wrapping_add(1));
        let mut ticker = tokio::time::interval(Duration::from_secs(refresh_every));
        ticker.tick().await;
        while !refresh_stop.load(Ordering::SeqCst) {
            ticker.tick().await;
            market
                .refresh_signals(&refresh_providers, SYNTHETIC_LISTINGS)
                .await;
        }
    });

    info!("🚀 Starting cycle scheduler...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    scheduler.run().await?;

    if let Some(pump) = pump {
        pump.abort();
    }
    info!("👋 Shutdown complete");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "catalyst-trader.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("catalyst_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let profile = config.modes.profile(config.cycle.mode);
    info!("📋 Configuration:");
    info!("   Mode: {}", config.cycle.mode);
    info!("   Scan Interval: {}s", profile.scan_interval_secs);
    info!(
        "   Thresholds: catalyst {} / pattern {} / technical {}",
        profile.catalyst_threshold, profile.pattern_threshold, profile.technical_threshold
    );
    info!("   Max Positions: {}", profile.max_positions);
    info!(
        "   Risk Per Trade: {:.2}%",
        profile.risk_per_trade * dec!(100)
    );
    info!(
        "   Max Daily Loss: {:.2}%",
        config.risk.max_daily_loss * dec!(100)
    );
    info!(
        "   Min Dollar Volume: ${:.0}M",
        config.universe.min_dollar_volume / dec!(1_000_000)
    );
    info!("   Final Selection: {}", config.pipeline.final_selection_size);
}

/// Show persisted cycles and positions.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              CATALYST TRADER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No cycle has run yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;

    let cycles = store.recent_cycles(10)?;
    println!("\n🔄 Recent Cycles");
    if cycles.is_empty() {
        println!("   └─ none");
    }
    for cycle in &cycles {
        let flag = if cycle.degraded { " (degraded)" } else { "" };
        println!(
            "   ┌─ {} [{}] {}{}",
            &cycle.id[..8.min(cycle.id.len())],
            cycle.mode,
            cycle.status,
            flag
        );
        println!("   ├─ Started: {}", cycle.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(summary) = &cycle.summary {
            println!("   └─ {}", summary);
        }
    }

    let positions = store.load_positions()?;
    let open: Vec<_> = positions.iter().filter(|p| p.is_open()).collect();
    let realized: rust_decimal::Decimal = positions.iter().map(|p| p.realized_pnl).sum();

    println!("\n📈 Positions");
    println!("   ├─ Open:          {}", open.len());
    println!("   ├─ Total:         {}", positions.len());
    println!("   └─ Realized PnL:  ${:.2}", realized);

    for position in &open {
        println!("   ┌─ {} {:?}", position.symbol, position.side);
        println!("   ├─ Qty: {} @ ${:.2}", position.quantity, position.entry_price);
        println!(
            "   ├─ Stop: ${:.2}  Target: ${:.2}",
            position.stop_loss, position.take_profit
        );
        println!(
            "   └─ Opened: {}",
            position.opened_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if verbose {
        let orders = store.load_orders()?;
        println!("\n🧾 Orders ({})", orders.len());
        for order in orders.iter().rev().take(20) {
            println!(
                "   ├─ {} {} {:?} {}/{} {}",
                order.client_order_id,
                order.symbol,
                order.side,
                order.filled_quantity,
                order.quantity,
                order.status
            );
        }

        let audit = store.recent_audit(20)?;
        if !audit.is_empty() {
            println!("\n🚨 Audit Events");
            for event in &audit {
                println!(
                    "   ├─ {} {} {}: {}",
                    event.at.format("%Y-%m-%d %H:%M"),
                    event.kind.as_str(),
                    event.subject,
                    event.detail
                );
            }
        }
    }

    println!();
    Ok(())
}
