use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod account;
mod broker;
mod config;
mod cycles;
mod engine;
mod error;
mod execution;
mod graph;
mod history;
mod models;
mod risk;
mod routes;
mod session;
mod utils;

use broker::oanda::OandaClient;
use broker::Broker;
use engine::Engine;
use execution::ExecutionMode;
use history::JsonlJournal;

/// Cycle arbitrage over an OANDA account.
#[derive(Parser, Debug)]
#[command(name = "fx-cycle-arb", version)]
struct Cli {
    /// TOML configuration; a `.json` file with the same stem is merged on top.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Price from the broker but fill trades from the detection snapshot.
    #[arg(long)]
    demo: bool,

    /// Force the practice endpoint.
    #[arg(long)]
    practice: bool,

    /// Seconds between passes.
    #[arg(long)]
    interval: Option<u64>,

    /// Stop after this many seconds.
    #[arg(long)]
    runtime: Option<u64>,

    #[arg(short, long)]
    verbose: bool,

    /// Serve GET /status and POST /stop on this address.
    #[arg(long, env = "ARB_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::init_tracing(cli.verbose);

    let mut cfg = config::load(&cli.config).context("loading configuration")?;
    if cli.practice {
        cfg.broker.practice_mode = true;
    }
    if let Some(interval) = cli.interval {
        cfg.policy.check_interval = interval;
    }
    if cli.runtime.is_some() {
        cfg.max_runtime = cli.runtime;
    }
    cfg.validate()?;

    let mode = if cli.demo {
        ExecutionMode::Simulated
    } else {
        ExecutionMode::Live
    };
    if mode == ExecutionMode::Live && !cfg.broker.practice_mode {
        warn!("LIVE trading on a real-money account");
    }

    let mut client = OandaClient::new(&cfg.broker).context("creating OANDA client")?;
    let pairs = client
        .load_instruments(&cfg.policy.currencies_to_monitor)
        .await
        .context("loading tradable instruments")?;
    if pairs.len() < 3 {
        bail!(
            "only {} instruments between the monitored currencies, need at least 3",
            pairs.len()
        );
    }
    let balance = client
        .account_balance()
        .await
        .context("reading account balance")?;
    info!(
        "balance {:.2} {}, margin available {:.2}",
        balance.balance, cfg.policy.account_currency, balance.available_margin
    );

    let broker: Arc<dyn Broker> = Arc::new(client);
    let mut engine = Engine::new(cfg.policy.clone(), broker, pairs, mode, balance, Utc::now())
        .with_max_concurrent(cfg.broker.max_concurrent_fetches);
    if let Some(path) = &cfg.history_path {
        let journal = JsonlJournal::open(path)
            .with_context(|| format!("opening trade journal {}", path.display()))?;
        engine = engine.with_journal(Box::new(journal));
    }

    let stop = engine.stop_handle();
    if let Some(addr) = cli.listen {
        let app = routes::router(routes::ControlState {
            status: engine.status(),
            stop: stop.clone(),
        });
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding control listener on {addr}"))?;
        info!("control api listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("control api stopped: {}", e);
            }
        });
    }

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.stop();
            }
        });
    }

    let result = engine.run(cfg.max_runtime.map(Duration::from_secs)).await;
    engine.summary().log();
    info!(
        "final balance {:.2} {}",
        engine.account().balance,
        cfg.policy.account_currency
    );
    result.context("trading halted")?;
    Ok(())
}
