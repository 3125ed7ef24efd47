//! Manual pipeline runner: re-run one stage or a whole day for a past date.
//!
//! Without `--stage`, runs all three stages in order, pulling historical
//! bars for the open and close. `--force` re-derives stages that already
//! completed; an already-scored day is re-scored with replacement semantics
//! (totals corrected, streaks untouched).

use std::sync::Arc;

use chrono::NaiveDate;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bulligan::config::Config;
use bulligan::db::{Datastore, SqliteStore};
use bulligan::error::Result;
use bulligan::gateway::{Gateway, GatewayTuning, MarketFeed, YahooFeed};
use bulligan::pipeline::{Orchestrator, Overrides};
use bulligan::scheduler::{Clock, SystemClock};
use bulligan::types::Stage;

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Run scoring pipeline stages for a specific date")]
struct Args {
    /// Date to process (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,

    /// Run a single stage (capture-open | lock-predictions | score-close)
    /// instead of the whole day
    #[arg(long)]
    stage: Option<Stage>,

    /// Close price override; skips the historical close lookup
    #[arg(long)]
    close: Option<f64>,

    /// Re-run stages that already completed
    #[arg(long)]
    force: bool,

    /// Print stage outcomes as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
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

    if let Err(e) = run(cfg, args).await {
        eprintln!("backfill failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, args: Args) -> Result<()> {
    let store: Arc<dyn Datastore> =
        Arc::new(SqliteStore::connect(&format!("sqlite:{}", cfg.db_path)).await?);
    let feed: Arc<dyn MarketFeed> = Arc::new(YahooFeed::new(cfg.chart_api_url.clone())?);
    let gateway = Arc::new(Gateway::new(feed, GatewayTuning::default()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Orchestrator::new(store, gateway, clock, &cfg);

    match args.stage {
        Some(stage) => {
            let overrides = Overrides { close_price: args.close, force: args.force, ..Overrides::default() };
            let outcome = orchestrator.run_stage(stage, args.date, overrides).await?;
            print_outcome(stage, args.date, &outcome, args.json)?;
        }
        None => {
            let outcomes = orchestrator.backfill_day(args.date, args.close, args.force).await?;
            for (stage, outcome) in [Stage::CaptureOpen, Stage::LockPredictions, Stage::ScoreClose]
                .iter()
                .zip(&outcomes)
            {
                print_outcome(*stage, args.date, outcome, args.json)?;
            }
        }
    }
    Ok(())
}

fn print_outcome(
    stage: Stage,
    date: NaiveDate,
    outcome: &bulligan::types::StageOutcome,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
    } else {
        println!("{stage} {date}: {outcome}");
    }
    Ok(())
}
