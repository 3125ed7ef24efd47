//! The three-stage daily pipeline: capture the open, lock predictions, score
//! the close. Every stage is idempotent per (stage, date), so schedulers and
//! manual backfills can re-run any of them safely.

use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::calendar;
use crate::config::{Config, MissedDayPolicy, INDEX_SYMBOL};
use crate::db::Datastore;
use crate::error::{AppError, Result};
use crate::gateway::{Gateway, OpenSnapshot};
use crate::scheduler::Clock;
use crate::scoring::{
    condition_from_move, expected_move_from_volatility, par_from_volatility, score_prediction,
};
use crate::streak::{self, DayOutcome, MulliganWindow};
use crate::types::{Prediction, ScoringStage, Stage, StageOutcome, TradingDay, UserAggregate};

/// Manual inputs for a stage run. Scheduled runs use the default (fetch
/// everything, never force); backfills supply snapshots and may force a
/// re-derivation of an already-completed stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub open: Option<OpenSnapshot>,
    pub close_price: Option<f64>,
    pub force: bool,
}

pub struct Orchestrator {
    store: Arc<dyn Datastore>,
    gateway: Arc<Gateway>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    missed_day_policy: MissedDayPolicy,
    mulligan_window: MulliganWindow,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Datastore>,
        gateway: Arc<Gateway>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            timezone: config.timezone,
            missed_day_policy: config.missed_day_policy,
            mulligan_window: MulliganWindow {
                opens_at: config.lock_predictions_at,
                ends_at: config.mulligan_window_ends_at,
                timezone: config.timezone,
            },
        }
    }

    pub async fn run_stage(
        &self,
        stage: Stage,
        date: NaiveDate,
        overrides: Overrides,
    ) -> Result<StageOutcome> {
        match stage {
            Stage::CaptureOpen => self.capture_open(date, overrides).await,
            Stage::LockPredictions => self.lock_predictions(date, overrides).await,
            Stage::ScoreClose => self.score_close(date, overrides).await,
        }
    }

    /// Stage 1: record the opening price and derive the day's par from the
    /// previous trading day's volatility close.
    async fn capture_open(&self, date: NaiveDate, ov: Overrides) -> Result<StageOutcome> {
        if !calendar::is_trading_day(date) {
            self.record_non_trading_day(date).await?;
            return Ok(StageOutcome::NotATradingDay);
        }

        let existing = self.store.trading_day(date).await?;
        if let Some(day) = &existing {
            if day.stage >= ScoringStage::Opened && !ov.force {
                return Ok(StageOutcome::AlreadyCompleted);
            }
        }

        let snapshot = match ov.open {
            Some(s) => s,
            None => self.gateway.fetch_open_snapshot(date).await?,
        };
        let par = par_from_volatility(snapshot.prior_volatility_close);
        let expected_move = expected_move_from_volatility(snapshot.prior_volatility_close);

        // On a forced re-open of a later-stage day, only the open-derived
        // fields change; stage, close fields, and the scored gate survive so
        // a forced Stage 3 still sees the previous completion.
        let mut day = existing.unwrap_or_else(|| blank_day(date));
        day.is_trading_day = true;
        day.open_price = Some(snapshot.open_price);
        day.prior_volatility = Some(snapshot.prior_volatility_close);
        day.par = Some(par);
        day.expected_move = Some(expected_move);
        day.opened_at = Some(self.clock.now_utc());
        if day.stage < ScoringStage::Opened {
            day.stage = ScoringStage::Opened;
        }
        self.store.upsert_trading_day(&day).await?;

        info!(
            "[capture-open] {date}: open={:.2} prior_vol={:.2} par={par}",
            snapshot.open_price, snapshot.prior_volatility_close
        );
        Ok(StageOutcome::Opened {
            open_price: snapshot.open_price,
            prior_volatility: snapshot.prior_volatility_close,
            par,
        })
    }

    /// Stage 2: freeze every open prediction for the date.
    async fn lock_predictions(&self, date: NaiveDate, ov: Overrides) -> Result<StageOutcome> {
        if !calendar::is_trading_day(date) {
            return Ok(StageOutcome::NotATradingDay);
        }
        let day = self.store.trading_day(date).await?.ok_or_else(|| {
            AppError::InvalidTransition(format!("{date} has no opening snapshot; run capture-open first"))
        })?;
        if !day.is_trading_day {
            return Ok(StageOutcome::NotATradingDay);
        }
        if day.stage >= ScoringStage::Locked && !ov.force {
            return Ok(StageOutcome::AlreadyCompleted);
        }

        let locked = self
            .store
            .lock_predictions(date, self.clock.now_utc())
            .await?;
        self.store
            .advance_stage(date, ScoringStage::Opened, ScoringStage::Locked)
            .await?;

        info!("[lock-predictions] {date}: locked {locked} predictions");
        Ok(StageOutcome::Locked { predictions_locked: locked })
    }

    /// Stage 3: capture the close, score every locked prediction, and advance
    /// the streak machine. Three commits, each idempotent:
    ///   1. the close capture, which is also the mulligan-spend cutoff;
    ///   2. scores plus aggregate totals, with replacement semantics;
    ///   3. streaks plus the scored gate, in one transaction.
    async fn score_close(&self, date: NaiveDate, ov: Overrides) -> Result<StageOutcome> {
        if !calendar::is_trading_day(date) {
            return Ok(StageOutcome::NotATradingDay);
        }
        let day = self.store.trading_day(date).await?.ok_or_else(|| {
            AppError::InvalidTransition(format!("{date} has no opening snapshot; run capture-open first"))
        })?;
        if !day.is_trading_day {
            return Ok(StageOutcome::NotATradingDay);
        }

        let was_scored = day.stage == ScoringStage::Scored;
        if was_scored {
            if !ov.force {
                return Ok(StageOutcome::AlreadyCompleted);
            }
            self.store.reset_for_rescore(date).await?;
            warn!("[score-close] {date}: forced re-score of an already scored day");
        } else if day.stage < ScoringStage::Locked {
            return Err(AppError::InvalidTransition(format!(
                "{date} is not locked yet; run lock-predictions first"
            )));
        }

        let open_price = day.open_price.ok_or_else(|| {
            AppError::InvalidTransition(format!("{date} has no open price"))
        })?;
        let par = day.par.ok_or_else(|| {
            AppError::InvalidTransition(format!("{date} has no par"))
        })?;
        let expected_move = day
            .expected_move
            .ok_or_else(|| AppError::InvalidTransition(format!("{date} has no expected move")))?;

        let today = self.clock.now_utc().with_timezone(&self.timezone).date_naive();
        let close_price = match ov.close_price {
            Some(c) => c,
            None if date < today => self
                .gateway
                .fetch_historical_close(INDEX_SYMBOL, date)
                .await?
                .ok_or_else(|| {
                    AppError::DataUnavailable(format!("no historical close bar for {date}"))
                })?,
            None => self.gateway.fetch_close_snapshot().await?.close_price,
        };

        let actual_move_pct = (close_price - open_price) / open_price * 100.0;
        let condition = condition_from_move(actual_move_pct, expected_move);

        // Commit 1: from here on, mulligan spends for this date are rejected.
        self.store
            .capture_close(date, close_price, actual_move_pct, condition)
            .await?;

        let predictions = self.store.locked_predictions(date).await?;
        let mut scores = Vec::with_capacity(predictions.len());
        for p in &predictions {
            self.store.ensure_user(&p.user_id).await?;
            let card = score_prediction(par, p.predicted_close, close_price);
            scores.push(card.into_score(p.user_id.clone(), date, par, p.is_mulligan_active));
        }

        // Commit 2: score rows and aggregate totals move together.
        self.store.commit_scores(date, &scores).await?;

        let scored_at = self.clock.now_utc();
        let (streaks_incremented, streaks_reset, mulligans_awarded) = if was_scored {
            // A forced re-score replaces totals but never replays the streak
            // day; that pass already happened exactly once.
            self.store.mark_scored(date, scored_at).await?;
            (0, 0, 0)
        } else {
            let mut aggregates: Vec<UserAggregate> = Vec::new();
            let mut awarded = 0usize;
            for score in &scores {
                let mut agg = self
                    .store
                    .aggregate(&score.user_id)
                    .await?
                    .unwrap_or_else(|| UserAggregate::new(score.user_id.clone()));
                let t = streak::advance(&mut agg, DayOutcome::Played, self.missed_day_policy);
                if t.mulligan_awarded {
                    awarded += 1;
                    info!("[score-close] {date}: mulligan earned by {}", score.user_id);
                }
                aggregates.push(agg);
            }
            let incremented = aggregates.len();

            let mut resets = 0usize;
            for mut agg in self.store.users_without_score(date).await? {
                let t = streak::advance(&mut agg, DayOutcome::DidNotPlay, self.missed_day_policy);
                if t.streak_reset {
                    resets += 1;
                }
                aggregates.push(agg);
            }

            // Commit 3: streak state and the scored gate land atomically.
            self.store
                .commit_streaks(date, &aggregates, Some(scored_at))
                .await?;
            (incremented, resets, awarded)
        };

        info!(
            "[score-close] {date}: close={close_price:.2} move={actual_move_pct:+.2}% \
             condition={condition} scores={}",
            scores.len()
        );
        Ok(StageOutcome::Scored {
            close_price,
            actual_move_pct,
            condition,
            scores_created: scores.len(),
            streaks_incremented,
            streaks_reset,
            mulligans_awarded,
        })
    }

    /// Submit or edit a prediction. Open until Stage 2 locks the date.
    pub async fn submit_prediction(
        &self,
        user_id: &str,
        date: NaiveDate,
        predicted_close: f64,
    ) -> Result<Prediction> {
        if !calendar::is_trading_day(date) {
            return Err(AppError::InvalidTransition(format!("{date} is not a trading day")));
        }
        if let Some(existing) = self.store.prediction(user_id, date).await? {
            if existing.locked_at.is_some() {
                return Err(AppError::InvalidTransition(format!(
                    "predictions for {date} are locked; spend a mulligan to change one"
                )));
            }
        }
        self.store.ensure_user(user_id).await?;
        let prediction = Prediction {
            user_id: user_id.to_string(),
            date,
            predicted_close,
            submitted_at: self.clock.now_utc(),
            locked_at: None,
            is_mulligan_active: false,
            original_value: None,
        };
        self.store.upsert_prediction(&prediction).await?;
        Ok(prediction)
    }

    /// Spend a mulligan to overwrite today's locked prediction. Only inside
    /// the window between the lock and mid-afternoon; the store re-validates
    /// balance and the close-capture cutoff inside its transaction.
    pub async fn spend_mulligan(
        &self,
        user_id: &str,
        date: NaiveDate,
        new_value: f64,
    ) -> Result<Prediction> {
        if !self.mulligan_window.is_open(self.clock.as_ref(), date) {
            return Err(AppError::MulliganRejected(format!(
                "the mulligan window for {date} is not open"
            )));
        }
        let updated = self.store.spend_mulligan(user_id, date, new_value).await?;
        info!("[mulligan] {user_id} replayed {date}: {:?} -> {new_value}", updated.original_value);
        Ok(updated)
    }

    /// Re-run all three stages for one past date, fetching historical data.
    /// `force` re-derives stages that already completed.
    pub async fn backfill_day(
        &self,
        date: NaiveDate,
        close_override: Option<f64>,
        force: bool,
    ) -> Result<Vec<StageOutcome>> {
        if !calendar::is_trading_day(date) {
            return Ok(vec![StageOutcome::NotATradingDay]);
        }

        let bar = self.gateway.fetch_historical_bar(INDEX_SYMBOL, date).await?;
        let open = match bar {
            Some(bar) => {
                let vol = self.gateway.volatility_for_par(date).await?;
                Some(OpenSnapshot { open_price: bar.open, prior_volatility_close: vol })
            }
            None => None,
        };
        let close_price = close_override.or(bar.map(|b| b.close));

        let mut outcomes = Vec::with_capacity(3);
        outcomes.push(
            self.run_stage(Stage::CaptureOpen, date, Overrides { open, close_price: None, force })
                .await?,
        );
        outcomes.push(
            self.run_stage(Stage::LockPredictions, date, Overrides { force, ..Overrides::default() })
                .await?,
        );
        outcomes.push(
            self.run_stage(
                Stage::ScoreClose,
                date,
                Overrides { close_price, force, ..Overrides::default() },
            )
            .await?,
        );
        Ok(outcomes)
    }

    async fn record_non_trading_day(&self, date: NaiveDate) -> Result<()> {
        if self.store.trading_day(date).await?.is_none() {
            let mut day = blank_day(date);
            day.is_trading_day = false;
            self.store.upsert_trading_day(&day).await?;
        }
        Ok(())
    }
}

fn blank_day(date: NaiveDate) -> TradingDay {
    TradingDay {
        date,
        is_trading_day: true,
        open_price: None,
        close_price: None,
        prior_volatility: None,
        par: None,
        expected_move: None,
        actual_move_pct: None,
        condition: None,
        stage: ScoringStage::Empty,
        opened_at: None,
        scored_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use chrono_tz::America::New_York;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::db::SqliteStore;
    use crate::gateway::{DailyBar, GatewayTuning, MarketFeed, Quote};
    use crate::scoring::MarketCondition;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn at(dt: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(dt)))
        }

        fn set(&self, dt: DateTime<Utc>) {
            *self.0.lock().unwrap() = dt;
        }
    }

    impl Clock for FixedClock {
        fn now_utc(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Feed with a fixed quote and daily bar; enough to drive a whole day.
    struct StubFeed {
        open: f64,
        close: f64,
        vol: f64,
    }

    #[async_trait]
    impl MarketFeed for StubFeed {
        async fn quote(&self, symbol: &str) -> crate::error::Result<Quote> {
            let price = if symbol == crate::config::VOLATILITY_SYMBOL { self.vol } else { self.close };
            Ok(Quote {
                symbol: symbol.to_string(),
                price,
                open: self.open,
                high: price.max(self.open),
                low: price.min(self.open),
                previous_close: self.open,
                change_pct: (price - self.open) / self.open * 100.0,
            })
        }

        async fn daily_bar(
            &self,
            symbol: &str,
            _date: NaiveDate,
        ) -> crate::error::Result<Option<DailyBar>> {
            if symbol == crate::config::VOLATILITY_SYMBOL {
                return Ok(Some(DailyBar { open: self.vol, high: self.vol, low: self.vol, close: self.vol }));
            }
            Ok(Some(DailyBar {
                open: self.open,
                high: self.close.max(self.open),
                low: self.close.min(self.open),
                close: self.close,
            }))
        }
    }

    fn et(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().with_timezone(&Utc)
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn test_config() -> Config {
        Config {
            chart_api_url: "http://unused".to_string(),
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            timezone: New_York,
            capture_open_at: chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            lock_predictions_at: chrono::NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            score_close_at: chrono::NaiveTime::from_hms_opt(16, 5, 0).unwrap(),
            mulligan_window_ends_at: chrono::NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            missed_day_policy: MissedDayPolicy::Skip,
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<SqliteStore>,
        clock: Arc<FixedClock>,
    }

    async fn fixture_with(config: Config, feed: StubFeed) -> Fixture {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let clock = FixedClock::at(et(2026, 3, 2, 9, 30));
        let feed: Arc<dyn MarketFeed> = Arc::new(feed);
        let gateway = Arc::new(Gateway::new(
            feed,
            GatewayTuning { cache_ttl: Duration::ZERO, retry_delays: vec![] },
        ));
        let dyn_store: Arc<dyn Datastore> = store.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let orchestrator = Orchestrator::new(dyn_store, gateway, dyn_clock, &config);
        Fixture { orchestrator, store, clock }
    }

    async fn fixture() -> Fixture {
        fixture_with(test_config(), StubFeed { open: 5000.0, close: 5010.0, vol: 18.0 }).await
    }

    /// Drive one full day: open (vol 18 → par 4), lock, score at `close`.
    async fn play_day(f: &Fixture, date: NaiveDate, close: f64) -> StageOutcome {
        f.orchestrator
            .run_stage(Stage::CaptureOpen, date, Overrides {
                open: Some(OpenSnapshot { open_price: 5000.0, prior_volatility_close: 18.0 }),
                ..Overrides::default()
            })
            .await
            .unwrap();
        f.orchestrator
            .run_stage(Stage::LockPredictions, date, Overrides::default())
            .await
            .unwrap();
        f.orchestrator
            .run_stage(Stage::ScoreClose, date, Overrides {
                close_price: Some(close),
                ..Overrides::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_day_scores_locked_predictions() {
        let f = fixture().await;
        let date = monday();
        // 5009 vs close 5010: deviation ≈ 0.02% → 1 stroke on par 4 → Albatross
        f.orchestrator.submit_prediction("u1", date, 5009.0).await.unwrap();
        // 5100 vs 5010: ≈ 1.8% → 5 strokes → Bogey
        f.orchestrator.submit_prediction("u2", date, 5100.0).await.unwrap();

        let outcome = play_day(&f, date, 5010.0).await;
        match outcome {
            StageOutcome::Scored {
                close_price,
                condition,
                scores_created,
                streaks_incremented,
                streaks_reset,
                mulligans_awarded,
                ..
            } => {
                assert!((close_price - 5010.0).abs() < 1e-9);
                assert_eq!(condition, MarketCondition::Calm); // 0.2% move, 1.13% expected
                assert_eq!(scores_created, 2);
                assert_eq!(streaks_incremented, 2);
                assert_eq!(streaks_reset, 0);
                assert_eq!(mulligans_awarded, 0);
            }
            other => panic!("expected Scored, got {other:?}"),
        }

        let s1 = f.store.score("u1", date).await.unwrap().unwrap();
        assert_eq!(s1.strokes, 1);
        assert_eq!(s1.golf_score, -3);
        assert_eq!(s1.score_name, "Albatross");
        let s2 = f.store.score("u2", date).await.unwrap().unwrap();
        assert_eq!(s2.golf_score, 1);

        let a1 = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(a1.total_days_played, 1);
        assert_eq!(a1.total_score, -3);
        assert_eq!(a1.albatrosses, 1);
        assert_eq!(a1.current_streak, 1);
        assert_eq!(a1.best_score, Some(-3));

        let day = f.store.trading_day(date).await.unwrap().unwrap();
        assert_eq!(day.stage, ScoringStage::Scored);
        assert!(day.scored_at.is_some());
    }

    #[tokio::test]
    async fn every_stage_is_idempotent() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5009.0).await.unwrap();
        play_day(&f, date, 5010.0).await;

        let again = f.orchestrator
            .run_stage(Stage::CaptureOpen, date, Overrides::default())
            .await
            .unwrap();
        assert_eq!(again, StageOutcome::AlreadyCompleted);
        let again = f.orchestrator
            .run_stage(Stage::LockPredictions, date, Overrides::default())
            .await
            .unwrap();
        assert_eq!(again, StageOutcome::AlreadyCompleted);
        let again = f.orchestrator
            .run_stage(Stage::ScoreClose, date, Overrides::default())
            .await
            .unwrap();
        assert_eq!(again, StageOutcome::AlreadyCompleted);

        // Nothing double-counted
        let a1 = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(a1.total_days_played, 1);
        assert_eq!(a1.current_streak, 1);
    }

    #[tokio::test]
    async fn weekends_and_holidays_are_skipped() {
        let f = fixture().await;
        let saturday = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        let independence_day_observed = NaiveDate::from_ymd_opt(2026, 7, 3).unwrap();
        for date in [saturday, independence_day_observed] {
            let outcome = f.orchestrator
                .run_stage(Stage::CaptureOpen, date, Overrides::default())
                .await
                .unwrap();
            assert_eq!(outcome, StageOutcome::NotATradingDay);
        }
        let day = f.store.trading_day(saturday).await.unwrap().unwrap();
        assert!(!day.is_trading_day);
    }

    #[tokio::test]
    async fn scoring_before_lock_is_rejected() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator
            .run_stage(Stage::CaptureOpen, date, Overrides {
                open: Some(OpenSnapshot { open_price: 5000.0, prior_volatility_close: 18.0 }),
                ..Overrides::default()
            })
            .await
            .unwrap();
        let err = f.orchestrator
            .run_stage(Stage::ScoreClose, date, Overrides {
                close_price: Some(5010.0),
                ..Overrides::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn missed_day_resets_streak_and_skips_penalty_by_default() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("player", date, 5009.0).await.unwrap();
        // "idle" exists but never predicts; give them a streak to lose
        f.store.ensure_user("idle").await.unwrap();
        let mut idle = f.store.aggregate("idle").await.unwrap().unwrap();
        idle.current_streak = 3;
        idle.longest_streak = 3;
        f.store.commit_streaks(date, &[idle], None).await.unwrap();

        let outcome = play_day(&f, date, 5010.0).await;
        match outcome {
            StageOutcome::Scored { streaks_incremented, streaks_reset, .. } => {
                assert_eq!(streaks_incremented, 1);
                assert_eq!(streaks_reset, 1);
            }
            other => panic!("expected Scored, got {other:?}"),
        }
        let idle = f.store.aggregate("idle").await.unwrap().unwrap();
        assert_eq!(idle.current_streak, 0);
        assert_eq!(idle.longest_streak, 3);
        assert_eq!(idle.total_score, 0); // Skip policy: no charge
    }

    #[tokio::test]
    async fn penalize_policy_charges_missed_days() {
        let mut config = test_config();
        config.missed_day_policy = MissedDayPolicy::Penalize { golf_score: 5 };
        let f = fixture_with(config, StubFeed { open: 5000.0, close: 5010.0, vol: 18.0 }).await;
        let date = monday();
        f.orchestrator.submit_prediction("player", date, 5009.0).await.unwrap();
        f.store.ensure_user("idle").await.unwrap();

        play_day(&f, date, 5010.0).await;
        let idle = f.store.aggregate("idle").await.unwrap().unwrap();
        assert_eq!(idle.total_score, 5);
        assert_eq!(idle.total_days_played, 0);
    }

    #[tokio::test]
    async fn fifth_consecutive_day_awards_a_mulligan() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5009.0).await.unwrap();
        // Four consecutive days already on the books
        let mut agg = UserAggregate::new("u1");
        agg.current_streak = 4;
        agg.longest_streak = 4;
        f.store.ensure_user("u1").await.unwrap();
        f.store.commit_streaks(date, &[agg], None).await.unwrap();

        let outcome = play_day(&f, date, 5010.0).await;
        match outcome {
            StageOutcome::Scored { mulligans_awarded, .. } => assert_eq!(mulligans_awarded, 1),
            other => panic!("expected Scored, got {other:?}"),
        }
        let agg = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(agg.current_streak, 5);
        assert_eq!(agg.mulligans_available, 1);
    }

    #[tokio::test]
    async fn mulligan_spend_inside_window_changes_the_scored_value() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5100.0).await.unwrap();
        f.store.ensure_user("u1").await.unwrap();
        let mut agg = f.store.aggregate("u1").await.unwrap().unwrap();
        agg.mulligans_available = 1;
        f.store.commit_streaks(date, &[agg], None).await.unwrap();

        f.orchestrator
            .run_stage(Stage::CaptureOpen, date, Overrides {
                open: Some(OpenSnapshot { open_price: 5000.0, prior_volatility_close: 18.0 }),
                ..Overrides::default()
            })
            .await
            .unwrap();
        f.clock.set(et(2026, 3, 2, 11, 0));
        f.orchestrator
            .run_stage(Stage::LockPredictions, date, Overrides::default())
            .await
            .unwrap();

        // Too early and too late both fail
        f.clock.set(et(2026, 3, 2, 10, 30));
        assert!(f.orchestrator.spend_mulligan("u1", date, 5009.0).await.is_err());
        f.clock.set(et(2026, 3, 2, 14, 30));
        assert!(f.orchestrator.spend_mulligan("u1", date, 5009.0).await.is_err());

        f.clock.set(et(2026, 3, 2, 12, 0));
        let updated = f.orchestrator.spend_mulligan("u1", date, 5009.0).await.unwrap();
        assert_eq!(updated.original_value, Some(5100.0));

        f.clock.set(et(2026, 3, 2, 16, 5));
        f.orchestrator
            .run_stage(Stage::ScoreClose, date, Overrides {
                close_price: Some(5010.0),
                ..Overrides::default()
            })
            .await
            .unwrap();

        // Scored on the replayed value, flagged as a mulligan score
        let score = f.store.score("u1", date).await.unwrap().unwrap();
        assert_eq!(score.strokes, 1);
        assert!(score.used_mulligan);
        let agg = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(agg.mulligans_available, 0);
        assert_eq!(agg.mulligans_used_total, 1);
    }

    #[tokio::test]
    async fn mulligan_spend_after_scoring_changes_nothing() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5100.0).await.unwrap();
        f.store.ensure_user("u1").await.unwrap();
        let mut agg = f.store.aggregate("u1").await.unwrap().unwrap();
        agg.mulligans_available = 1;
        f.store.commit_streaks(date, &[agg], None).await.unwrap();
        play_day(&f, date, 5010.0).await;

        // Inside the window by the clock, but the day is already scored
        f.clock.set(et(2026, 3, 2, 12, 0));
        let before_agg = f.store.aggregate("u1").await.unwrap().unwrap();
        let before_pred = f.store.prediction("u1", date).await.unwrap().unwrap();
        let err = f.orchestrator.spend_mulligan("u1", date, 5009.0).await.unwrap_err();
        assert!(matches!(err, AppError::MulliganRejected(_)));
        assert_eq!(f.store.aggregate("u1").await.unwrap().unwrap(), before_agg);
        let after_pred = f.store.prediction("u1", date).await.unwrap().unwrap();
        assert_eq!(after_pred.predicted_close, before_pred.predicted_close);
        assert!(!after_pred.is_mulligan_active);
    }

    #[tokio::test]
    async fn submissions_are_rejected_after_lock() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5100.0).await.unwrap();
        f.orchestrator
            .run_stage(Stage::CaptureOpen, date, Overrides {
                open: Some(OpenSnapshot { open_price: 5000.0, prior_volatility_close: 18.0 }),
                ..Overrides::default()
            })
            .await
            .unwrap();
        f.orchestrator
            .run_stage(Stage::LockPredictions, date, Overrides::default())
            .await
            .unwrap();
        let err = f.orchestrator.submit_prediction("u1", date, 5000.0).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn forced_rescore_replaces_totals_without_replaying_streaks() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5009.0).await.unwrap();
        play_day(&f, date, 5010.0).await;

        let before = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(before.total_score, -3);
        assert_eq!(before.current_streak, 1);

        // Corrected close: 5009 vs 5500 is off by ~9% → 8 strokes → +4
        f.clock.set(et(2026, 3, 2, 18, 0));
        let outcomes = f.orchestrator.backfill_day(date, Some(5500.0), true).await.unwrap();
        assert!(matches!(outcomes[2], StageOutcome::Scored { .. }));

        let after = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(after.total_days_played, 1);
        assert_eq!(after.total_score, 4);
        assert_eq!(after.albatrosses, 0);
        assert_eq!(after.worse, 1);
        // Streak day already happened; the re-score never replays it
        assert_eq!(after.current_streak, 1);
        assert_eq!(after.best_score, Some(4));

        let day = f.store.trading_day(date).await.unwrap().unwrap();
        assert_eq!(day.stage, ScoringStage::Scored);
        assert!((day.close_price.unwrap() - 5500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backfill_without_force_respects_completed_stages() {
        let f = fixture().await;
        let date = monday();
        f.orchestrator.submit_prediction("u1", date, 5009.0).await.unwrap();
        play_day(&f, date, 5010.0).await;

        f.clock.set(et(2026, 3, 2, 18, 0));
        let outcomes = f.orchestrator.backfill_day(date, Some(5200.0), false).await.unwrap();
        assert!(outcomes.iter().all(|o| *o == StageOutcome::AlreadyCompleted));
        let day = f.store.trading_day(date).await.unwrap().unwrap();
        assert!((day.close_price.unwrap() - 5010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backfill_fills_a_past_day_from_historical_bars() {
        let f = fixture_with(test_config(), StubFeed { open: 5000.0, close: 5010.0, vol: 14.0 }).await;
        let date = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(); // previous Friday
        f.orchestrator.submit_prediction("u1", date, 5008.0).await.unwrap();
        f.clock.set(et(2026, 3, 2, 9, 0));

        let outcomes = f.orchestrator.backfill_day(date, None, false).await.unwrap();
        // vol 14 → par 3; 5008 vs 5010 ≈ 0.04% → 1 stroke → hole-in-one
        assert!(matches!(outcomes[0], StageOutcome::Opened { par: 3, .. }));
        assert!(matches!(outcomes[2], StageOutcome::Scored { .. }));
        let score = f.store.score("u1", date).await.unwrap().unwrap();
        assert!(score.is_hole_in_one);
        let agg = f.store.aggregate("u1").await.unwrap().unwrap();
        assert_eq!(agg.hole_in_ones, 1);
    }

    #[tokio::test]
    async fn total_score_matches_the_sum_of_score_rows() {
        let f = fixture().await;
        let date = monday();
        for (user, value) in [("a", 5009.0), ("b", 5030.0), ("c", 5150.0)] {
            f.orchestrator.submit_prediction(user, date, value).await.unwrap();
        }
        play_day(&f, date, 5010.0).await;

        for user in ["a", "b", "c"] {
            let agg = f.store.aggregate(user).await.unwrap().unwrap();
            let score = f.store.score(user, date).await.unwrap().unwrap();
            assert_eq!(agg.total_score, score.golf_score);
            assert!((agg.avg_score - score.golf_score as f64).abs() < 1e-9);
            let buckets = agg.hole_in_ones
                + agg.condors
                + agg.albatrosses
                + agg.eagles
                + agg.birdies
                + agg.pars
                + agg.bogeys
                + agg.double_bogeys
                + agg.triple_bogeys
                + agg.worse;
            assert_eq!(buckets, agg.total_days_played);
        }
    }
}
