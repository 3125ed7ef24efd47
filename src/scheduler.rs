//! Wall-clock scheduling for the three daily stages.
//!
//! The `Scheduler` owns its job handles: start/stop/status by name, no
//! ambient global registry. All business logic reads time through the
//! injected [`Clock`] so window checks are testable without waiting on
//! real time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::{Orchestrator, Overrides};
use crate::types::Stage;

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Next occurrence of `at` (zone-local) on a weekday, strictly after `now`.
/// Holidays are not considered here; the stage's own trading-day guard
/// turns a holiday fire into a logged skip.
pub fn next_weekday_fire(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let mut date = local.date_naive();
    if local.time() >= at {
        date += Duration::days(1);
    }
    while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        date += Duration::days(1);
    }
    // DST gaps/overlaps: take the earliest valid instant, or shift an hour
    // for the (rare) nonexistent local time.
    match tz.from_local_datetime(&date.and_time(at)) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        chrono::LocalResult::None => tz
            .from_local_datetime(&(date.and_time(at) + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now + Duration::hours(24)),
    }
}

struct Job {
    stage: Stage,
    at: NaiveTime,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    jobs: Vec<Job>,
    handles: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        capture_open_at: NaiveTime,
        lock_predictions_at: NaiveTime,
        score_close_at: NaiveTime,
    ) -> Self {
        Self {
            orchestrator,
            clock,
            timezone,
            jobs: vec![
                Job { stage: Stage::CaptureOpen, at: capture_open_at },
                Job { stage: Stage::LockPredictions, at: lock_predictions_at },
                Job { stage: Stage::ScoreClose, at: score_close_at },
            ],
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one loop per stage job. Idempotent per job name.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("scheduler handle lock");
        for job in &self.jobs {
            let name = job.stage.name();
            if handles.get(name).map(|h| !h.is_finished()).unwrap_or(false) {
                continue;
            }
            let orchestrator = Arc::clone(&self.orchestrator);
            let clock = Arc::clone(&self.clock);
            let tz = self.timezone;
            let stage = job.stage;
            let at = job.at;
            let handle = tokio::spawn(async move {
                run_job(orchestrator, clock, tz, stage, at).await;
            });
            info!("scheduled {name} at {at} ({tz})", tz = self.timezone);
            handles.insert(name, handle);
        }
    }

    pub fn stop(&self, name: &str) -> bool {
        let mut handles = self.handles.lock().expect("scheduler handle lock");
        if let Some(handle) = handles.remove(name) {
            handle.abort();
            info!("stopped job {name}");
            true
        } else {
            false
        }
    }

    pub fn stop_all(&self) {
        let mut handles = self.handles.lock().expect("scheduler handle lock");
        for (name, handle) in handles.drain() {
            handle.abort();
            info!("stopped job {name}");
        }
    }

    /// (job name, still running) for every stage job.
    pub fn status(&self) -> Vec<(&'static str, bool)> {
        let handles = self.handles.lock().expect("scheduler handle lock");
        self.jobs
            .iter()
            .map(|j| {
                let name = j.stage.name();
                let running = handles.get(name).map(|h| !h.is_finished()).unwrap_or(false);
                (name, running)
            })
            .collect()
    }
}

async fn run_job(
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    stage: Stage,
    at: NaiveTime,
) {
    loop {
        let now = clock.now_utc();
        let fire_at = next_weekday_fire(now, tz, at);
        let wait = (fire_at - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let date = clock.now_utc().with_timezone(&tz).date_naive();
        info!("[{stage}] fired for {date}");
        match orchestrator.run_stage(stage, date, Overrides::default()).await {
            Ok(outcome) => info!("[{stage}] {date}: {outcome}"),
            // Failed stages are left for the next fire or a manual backfill;
            // the orchestrator never retries in the background.
            Err(e) => error!("[{stage}] {date} failed: {e}"),
        }
    }
}
