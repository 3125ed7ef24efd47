//! SQLite-backed [`Datastore`]. All multi-row commits run inside a single
//! transaction so a crash between stages never leaves half-applied totals.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{AppError, Result};
use crate::scoring::MarketCondition;
use crate::streak;
use crate::types::{Prediction, Score, ScoringStage, TradingDay, UserAggregate};

use super::models::{PredictionRow, ScoreRow, TradingDayRow, UserAggregateRow};
use super::Datastore;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and run pending migrations.
    ///
    /// SQLite allows one writer at a time; a single pooled connection keeps
    /// that serialization explicit and makes `sqlite::memory:` databases
    /// coherent across calls.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database ready at {url}");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn aggregate_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
    ) -> Result<Option<UserAggregate>> {
        let row = sqlx::query_as::<_, UserAggregateRow>(
            "SELECT * FROM user_aggregates WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(UserAggregate::from))
    }

    async fn write_aggregate_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        agg: &UserAggregate,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE user_aggregates SET
                is_active = ?, total_days_played = ?, total_score = ?, avg_score = ?,
                best_score = ?, hole_in_ones = ?, condors = ?, albatrosses = ?,
                eagles = ?, birdies = ?, pars = ?, bogeys = ?, double_bogeys = ?,
                triple_bogeys = ?, worse = ?, current_streak = ?, longest_streak = ?,
                mulligans_available = ?, mulligans_earned_total = ?, mulligans_used_total = ?
             WHERE user_id = ?",
        )
        .bind(agg.is_active)
        .bind(agg.total_days_played)
        .bind(agg.total_score)
        .bind(agg.avg_score)
        .bind(agg.best_score)
        .bind(agg.hole_in_ones)
        .bind(agg.condors)
        .bind(agg.albatrosses)
        .bind(agg.eagles)
        .bind(agg.birdies)
        .bind(agg.pars)
        .bind(agg.bogeys)
        .bind(agg.double_bogeys)
        .bind(agg.triple_bogeys)
        .bind(agg.worse)
        .bind(agg.current_streak)
        .bind(agg.longest_streak)
        .bind(agg.mulligans_available)
        .bind(agg.mulligans_earned_total)
        .bind(agg.mulligans_used_total)
        .bind(&agg.user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn trading_day(&self, date: NaiveDate) -> Result<Option<TradingDay>> {
        let row = sqlx::query_as::<_, TradingDayRow>("SELECT * FROM trading_days WHERE date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(TradingDay::from))
    }

    async fn upsert_trading_day(&self, day: &TradingDay) -> Result<()> {
        sqlx::query(
            "INSERT INTO trading_days
                (date, is_trading_day, open_price, close_price, prior_volatility, par,
                 expected_move, actual_move_pct, condition_tag, stage, opened_at, scored_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (date) DO UPDATE SET
                is_trading_day = excluded.is_trading_day,
                open_price = excluded.open_price,
                close_price = excluded.close_price,
                prior_volatility = excluded.prior_volatility,
                par = excluded.par,
                expected_move = excluded.expected_move,
                actual_move_pct = excluded.actual_move_pct,
                condition_tag = excluded.condition_tag,
                stage = excluded.stage,
                opened_at = excluded.opened_at,
                scored_at = excluded.scored_at",
        )
        .bind(day.date)
        .bind(day.is_trading_day)
        .bind(day.open_price)
        .bind(day.close_price)
        .bind(day.prior_volatility)
        .bind(day.par)
        .bind(day.expected_move)
        .bind(day.actual_move_pct)
        .bind(day.condition.map(|c| c.as_str()))
        .bind(day.stage.as_str())
        .bind(day.opened_at)
        .bind(day.scored_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_stage(
        &self,
        date: NaiveDate,
        from: ScoringStage,
        to: ScoringStage,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE trading_days SET stage = ? WHERE date = ? AND stage = ?")
            .bind(to.as_str())
            .bind(date)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn capture_close(
        &self,
        date: NaiveDate,
        close_price: f64,
        actual_move_pct: f64,
        condition: MarketCondition,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE trading_days
             SET close_price = ?, actual_move_pct = ?, condition_tag = ?
             WHERE date = ?",
        )
        .bind(close_price)
        .bind(actual_move_pct)
        .bind(condition.as_str())
        .bind(date)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "no trading day row for {date}"
            )));
        }
        Ok(())
    }

    async fn reset_for_rescore(&self, date: NaiveDate) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let stage: Option<(String,)> =
            sqlx::query_as("SELECT stage FROM trading_days WHERE date = ?")
                .bind(date)
                .fetch_optional(&mut *tx)
                .await?;
        let was_scored = matches!(stage, Some((ref s,)) if ScoringStage::parse(s) == ScoringStage::Scored);
        sqlx::query("UPDATE trading_days SET stage = 'empty', scored_at = NULL WHERE date = ?")
            .bind(date)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(was_scored)
    }

    async fn upsert_prediction(&self, prediction: &Prediction) -> Result<()> {
        sqlx::query(
            "INSERT INTO predictions
                (user_id, date, predicted_close, submitted_at, locked_at,
                 is_mulligan_active, original_value)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, date) DO UPDATE SET
                predicted_close = excluded.predicted_close,
                submitted_at = excluded.submitted_at,
                locked_at = excluded.locked_at,
                is_mulligan_active = excluded.is_mulligan_active,
                original_value = excluded.original_value",
        )
        .bind(&prediction.user_id)
        .bind(prediction.date)
        .bind(prediction.predicted_close)
        .bind(prediction.submitted_at)
        .bind(prediction.locked_at)
        .bind(prediction.is_mulligan_active)
        .bind(prediction.original_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prediction(&self, user_id: &str, date: NaiveDate) -> Result<Option<Prediction>> {
        let row = sqlx::query_as::<_, PredictionRow>(
            "SELECT user_id, date, predicted_close, submitted_at, locked_at,
                    is_mulligan_active, original_value
             FROM predictions WHERE user_id = ? AND date = ?",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Prediction::from))
    }

    async fn lock_predictions(&self, date: NaiveDate, locked_at: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("UPDATE predictions SET locked_at = ? WHERE date = ? AND locked_at IS NULL")
                .bind(locked_at)
                .bind(date)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn locked_predictions(&self, date: NaiveDate) -> Result<Vec<Prediction>> {
        let rows = sqlx::query_as::<_, PredictionRow>(
            "SELECT user_id, date, predicted_close, submitted_at, locked_at,
                    is_mulligan_active, original_value
             FROM predictions WHERE date = ? AND locked_at IS NOT NULL
             ORDER BY user_id",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Prediction::from).collect())
    }

    async fn score(&self, user_id: &str, date: NaiveDate) -> Result<Option<Score>> {
        let row = sqlx::query_as::<_, ScoreRow>(
            "SELECT user_id, date, strokes, par, golf_score, score_name, deviation_pct,
                    is_hole_in_one, used_mulligan
             FROM scores WHERE user_id = ? AND date = ?",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Score::from))
    }

    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        let row = sqlx::query_as::<_, UserAggregateRow>(
            "SELECT * FROM user_aggregates WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserAggregate::from))
    }

    async fn ensure_user(&self, user_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_aggregates (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_scores(&self, date: NaiveDate, scores: &[Score]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for score in scores {
            let old = sqlx::query_as::<_, ScoreRow>(
                "SELECT user_id, date, strokes, par, golf_score, score_name, deviation_pct,
                        is_hole_in_one, used_mulligan
                 FROM scores WHERE user_id = ? AND date = ?",
            )
            .bind(&score.user_id)
            .bind(date)
            .fetch_optional(&mut *tx)
            .await?
            .map(Score::from);

            sqlx::query(
                "INSERT INTO scores
                    (user_id, date, strokes, par, golf_score, score_name, deviation_pct,
                     is_hole_in_one, used_mulligan)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id, date) DO UPDATE SET
                    strokes = excluded.strokes,
                    par = excluded.par,
                    golf_score = excluded.golf_score,
                    score_name = excluded.score_name,
                    deviation_pct = excluded.deviation_pct,
                    is_hole_in_one = excluded.is_hole_in_one,
                    used_mulligan = excluded.used_mulligan",
            )
            .bind(&score.user_id)
            .bind(date)
            .bind(score.strokes)
            .bind(score.par)
            .bind(score.golf_score)
            .bind(&score.score_name)
            .bind(score.deviation_pct)
            .bind(score.is_hole_in_one)
            .bind(score.used_mulligan)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT OR IGNORE INTO user_aggregates (user_id) VALUES (?)")
                .bind(&score.user_id)
                .execute(&mut *tx)
                .await?;
            let mut agg = Self::aggregate_tx(&mut tx, &score.user_id)
                .await?
                .unwrap_or_else(|| UserAggregate::new(score.user_id.clone()));
            agg.apply_score(old.as_ref(), score);
            // best_score from the scores table directly: replacement-safe on a
            // forced re-score that worsens the previous personal best.
            let (best,): (Option<i64>,) =
                sqlx::query_as("SELECT MIN(golf_score) FROM scores WHERE user_id = ?")
                    .bind(&score.user_id)
                    .fetch_one(&mut *tx)
                    .await?;
            agg.best_score = best;
            Self::write_aggregate_tx(&mut tx, &agg).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit_streaks(
        &self,
        date: NaiveDate,
        aggregates: &[UserAggregate],
        scored_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for agg in aggregates {
            Self::write_aggregate_tx(&mut tx, agg).await?;
        }
        // Marking the day scored in the same commit makes the streak pass
        // exactly-once: a crash before this point replays it, after it the
        // scored gate skips it.
        if let Some(at) = scored_at {
            sqlx::query("UPDATE trading_days SET stage = 'scored', scored_at = ? WHERE date = ?")
                .bind(at)
                .bind(date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_scored(&self, date: NaiveDate, scored_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE trading_days SET stage = 'scored', scored_at = ? WHERE date = ?")
            .bind(scored_at)
            .bind(date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn users_without_score(&self, date: NaiveDate) -> Result<Vec<UserAggregate>> {
        let rows = sqlx::query_as::<_, UserAggregateRow>(
            "SELECT a.* FROM user_aggregates a
             WHERE a.is_active = 1
               AND NOT EXISTS (SELECT 1 FROM scores s WHERE s.user_id = a.user_id AND s.date = ?)
             ORDER BY a.user_id",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UserAggregate::from).collect())
    }

    async fn spend_mulligan(
        &self,
        user_id: &str,
        date: NaiveDate,
        new_value: f64,
    ) -> Result<Prediction> {
        let mut tx = self.pool.begin().await?;
        let agg = Self::aggregate_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| AppError::MulliganRejected(format!("unknown user {user_id}")))?;
        let prediction = sqlx::query_as::<_, PredictionRow>(
            "SELECT user_id, date, predicted_close, submitted_at, locked_at,
                    is_mulligan_active, original_value
             FROM predictions WHERE user_id = ? AND date = ?",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&mut *tx)
        .await?
        .map(Prediction::from);
        let day = sqlx::query_as::<_, TradingDayRow>("SELECT * FROM trading_days WHERE date = ?")
            .bind(date)
            .fetch_optional(&mut *tx)
            .await?
            .map(TradingDay::from);

        streak::validate_spend(&agg, prediction.as_ref(), day.as_ref())?;
        let prediction = prediction.expect("validated above");

        sqlx::query(
            "UPDATE predictions
             SET original_value = predicted_close, predicted_close = ?, is_mulligan_active = 1
             WHERE user_id = ? AND date = ?",
        )
        .bind(new_value)
        .bind(user_id)
        .bind(date)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE user_aggregates
             SET mulligans_available = mulligans_available - 1,
                 mulligans_used_total = mulligans_used_total + 1
             WHERE user_id = ?",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Prediction {
            predicted_close: new_value,
            is_mulligan_active: true,
            original_value: Some(prediction.predicted_close),
            ..prediction
        })
    }
}
