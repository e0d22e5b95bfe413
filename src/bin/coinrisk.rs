//! CLI entrypoint: serve the dashboards or backfill price history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use coinrisk::config::Config;
use coinrisk::dashboard::{self, DashboardService};
use coinrisk::persistence::{backfill_all, spawn_backfill_loop, PriceStore, SqlitePriceStore};
use coinrisk::upstream::{CoinGeckoClient, MarketDataProvider};
use coinrisk::utils::init_logging;

#[derive(Debug, Parser)]
#[command(name = "coinrisk", author, version, about = "Crypto market and risk dashboards", long_about = None)]
struct Args {
    /// Path to the configuration file (TOML); default locations are tried otherwise
    #[arg(short, long, env = "COINRISK_CONFIG")]
    config: Option<String>,

    /// Print the default configuration to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Command to execute (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the dashboard API
    Serve {
        /// Listen address, overrides `app.bind_addr`
        #[arg(long)]
        bind: Option<String>,
        /// Skip the background backfill
        #[arg(long)]
        no_backfill: bool,
    },
    /// Fetch daily prices into the local database and exit
    Backfill {
        /// Coin id to backfill (repeatable); defaults to every configured coin
        #[arg(long = "coin", value_name = "ID")]
        coins: Vec<String>,
        /// Days of history, overrides `store.backfill_days`
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", Config::default_toml()?);
        return Ok(());
    }

    let config = match &args.config {
        | Some(path) => Config::from_file(path).with_context(|| format!("Failed to load configuration from {path}"))?,
        | None => Config::load().context("Failed to load configuration")?,
    };
    init_logging(&config.app.log_level);
    coinrisk::metrics::init()?;

    let provider: Arc<dyn MarketDataProvider> =
        Arc::new(CoinGeckoClient::new(&config.upstream).context("Failed to build upstream client")?);
    let store: Arc<dyn PriceStore> = Arc::new(
        SqlitePriceStore::open(&config.store.db_path, &config.store)
            .await
            .with_context(|| format!("Failed to open price database {}", config.store.db_path))?,
    );

    match args.command.unwrap_or(Command::Serve { bind: None, no_backfill: false }) {
        | Command::Serve { bind, no_backfill } => serve(config, provider, store, bind, no_backfill).await,
        | Command::Backfill { coins, days } => {
            let coins = if coins.is_empty() { config.coins.clone() } else { coins };
            let days = days.unwrap_or(config.store.backfill_days);
            run_backfill(provider, store, &coins, days).await
        }
    }
}

async fn serve(
    config: Config,
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn PriceStore>,
    bind: Option<String>,
    no_backfill: bool,
) -> Result<()> {
    if config.store.backfill_on_start && !no_backfill {
        spawn_backfill_loop(
            store.clone(),
            provider.clone(),
            config.coins.clone(),
            config.store.backfill_days,
            Duration::from_secs(config.store.backfill_interval_secs),
        );
    } else {
        info!("background backfill disabled");
    }

    let addr = bind.unwrap_or_else(|| config.app.bind_addr.clone());
    let service = Arc::new(DashboardService::new(config, provider, store));
    dashboard::run(service, &addr).await.with_context(|| format!("Dashboard server on {addr} failed"))?;
    info!("dashboard stopped");
    Ok(())
}

async fn run_backfill(
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn PriceStore>,
    coins: &[String],
    days: u32,
) -> Result<()> {
    let outcomes = backfill_all(store.as_ref(), provider.as_ref(), coins, days).await;
    let mut failed = 0;
    for (coin, outcome) in &outcomes {
        match outcome {
            | Ok(r) if r.skipped => println!("{coin:<12} up to date"),
            | Ok(r) => println!("{coin:<12} fetched {:>4}  written {:>4}", r.fetched, r.written),
            | Err(e) => {
                failed += 1;
                println!("{coin:<12} FAILED: {e}");
            }
        }
    }
    if failed > 0 {
        warn!(failed, total = outcomes.len(), "backfill incomplete");
        anyhow::bail!("{failed} of {} coins failed to backfill", outcomes.len());
    }
    Ok(())
}
