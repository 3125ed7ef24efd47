use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulligan::config::Config;
use bulligan::db::{Datastore, SqliteStore};
use bulligan::error::Result;
use bulligan::gateway::{Gateway, GatewayTuning, MarketFeed, YahooFeed};
use bulligan::pipeline::Orchestrator;
use bulligan::scheduler::{Clock, Scheduler, SystemClock};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = SqliteStore::connect(&format!("sqlite:{}", cfg.db_path)).await?;
    let store: Arc<dyn Datastore> = Arc::new(store);

    // --- Market data gateway ---
    let feed: Arc<dyn MarketFeed> = Arc::new(YahooFeed::new(cfg.chart_api_url.clone())?);
    let gateway = Arc::new(Gateway::new(feed, GatewayTuning::default()));

    // --- Pipeline + scheduler ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(Orchestrator::new(store, gateway, Arc::clone(&clock), &cfg));
    let scheduler = Scheduler::new(
        Arc::clone(&orchestrator),
        clock,
        cfg.timezone,
        cfg.capture_open_at,
        cfg.lock_predictions_at,
        cfg.score_close_at,
    );
    scheduler.start();
    info!(
        "pipeline scheduled ({}): open {}, lock {}, score {}",
        cfg.timezone, cfg.capture_open_at, cfg.lock_predictions_at, cfg.score_close_at
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping jobs");
    scheduler.stop_all();
    Ok(())
}
