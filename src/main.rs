use anyhow::{Context, Result};
use clap::Parser;
use perpbot::api::{quote_asset_of, BinanceClient, ExecutionClient, MarketDataSource, RetryPolicy};
use perpbot::config::{Credentials, LogSettings, Settings};
use perpbot::engine::{
    command::HELP, run_reconcile_loop, run_signal_loop, ConsoleCommand, EngineHandle,
    TradingEngine,
};
use perpbot::execution::CandleFeed;
use perpbot::strategy::SignalPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "MACD momentum trader for USDⓈ-M perpetual futures")]
struct Args {
    /// Settings file (TOML); PERPBOT_* environment variables override it
    #[arg(short, long, default_value = "perpbot.toml")]
    config: PathBuf,

    /// Override the traded symbol
    #[arg(long)]
    symbol: Option<String>,

    /// Start the strategy immediately instead of waiting for `start`
    #[arg(long)]
    start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::load(Some(args.config.as_path()))?;
    if let Some(symbol) = args.symbol {
        settings = settings.with_symbol(&symbol)?;
    }
    setup_logging(&settings.log);

    tracing::info!("🚀 PerpBot starting");

    let credentials = Credentials::from_env();
    if !credentials.is_configured() {
        tracing::warn!("⚠️  No API credentials found, signed requests will fail");
    }

    let client = Arc::new(
        BinanceClient::new(&settings.exchange, credentials)
            .context("Failed to build exchange client")?
            .with_quote_asset(quote_asset_of(&settings.market.symbol)),
    );
    let market: Arc<dyn MarketDataSource> = client.clone();
    let exchange: Arc<dyn ExecutionClient> = client;

    let pipeline = SignalPipeline::from_settings(&settings.strategy);
    let feed = CandleFeed::new(
        market,
        &settings.market.symbol,
        settings.market.interval,
        settings.market.history_capacity.max(pipeline.min_history()),
        Duration::from_secs(settings.market.stale_after_secs),
        RetryPolicy::from_settings(&settings.exchange),
    );

    let (engine, handle) = TradingEngine::new(&settings, exchange, feed.subscribe_health());
    let engine_task = engine.spawn();

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {} ({} candles)", settings.market.symbol, settings.market.interval);
    tracing::info!(
        "  MACD: {}/{}/{}, cooldown {} candles, shorts {}",
        settings.strategy.fast_period,
        settings.strategy.slow_period,
        settings.strategy.signal_period,
        settings.strategy.cooldown_candles,
        if settings.strategy.allow_short { "on" } else { "off" }
    );
    tracing::info!(
        "  Leverage: {}x {} (max {}x), allocation {:.0}%",
        settings.risk.leverage,
        settings.risk.margin_mode,
        settings.risk.max_leverage,
        settings.engine.allocation_fraction * 100.0
    );
    tracing::info!("  Exchange: {:?}", settings.exchange.mode);

    let signal_task = {
        let handle = handle.clone();
        let poll_every = Duration::from_secs(settings.market.poll_interval_secs);
        tokio::spawn(async move {
            run_signal_loop(feed, pipeline, handle, poll_every).await;
        })
    };

    let reconcile_task = {
        let handle = handle.clone();
        let every = settings.engine.reconcile_interval();
        tokio::spawn(async move {
            run_reconcile_loop(handle, every).await;
        })
    };

    if args.start {
        handle.start()?;
    }

    let console_task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = console_loop(handle).await {
                tracing::error!("Console loop failed: {}", e);
            }
        })
    };

    tracing::info!("✅ All loops spawned, type 'help' for commands");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = engine_task => {
            tracing::error!("Engine task exited: {:?}", result);
        }
        result = signal_task => {
            tracing::error!("Signal loop exited: {:?}", result);
        }
        result = reconcile_task => {
            tracing::error!("Reconcile loop exited: {:?}", result);
        }
        result = console_task => {
            tracing::info!("Console closed: {:?}", result);
        }
    }

    let snapshot = handle.snapshot();
    if !snapshot.position.is_flat() {
        tracing::warn!(
            "⚠️  Exiting with an open {} position of {}",
            snapshot.position.side,
            snapshot.position.size
        );
    }
    tracing::info!("{}", snapshot.summary());
    tracing::info!("👋 PerpBot stopped");
    Ok(())
}

fn setup_logging(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    if log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Read operator commands from stdin until EOF
async fn console_loop(handle: EngineHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let ack = match command {
            ConsoleCommand::Start => handle.start(),
            ConsoleCommand::Stop => handle.stop(),
            ConsoleCommand::Open { side, size } => handle.manual_open(side, size),
            ConsoleCommand::Close => handle.manual_close(),
            ConsoleCommand::Reconcile => handle.reconcile_now(),
            ConsoleCommand::Status => {
                let snapshot = handle.snapshot();
                println!("{}", snapshot.summary());
                if let Some(order) = &snapshot.in_flight {
                    println!("  in flight: {} {} ({})", order.side, order.size, order.client_id);
                }
                for notice in snapshot.notices.iter().rev().take(5) {
                    println!("  {} {:?}: {}", notice.at.format("%H:%M:%S"), notice.kind, notice.message);
                }
                continue;
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                continue;
            }
        };

        let ack = ack?;
        let snapshot = handle.wait_processed(ack.seq).await?;
        println!("{}", snapshot.summary());
    }

    Ok(())
}
