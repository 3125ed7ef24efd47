//! The datastore contract. The pipeline only ever talks to this trait; the
//! SQLite implementation provides the transactional multi-row commits the
//! stages rely on.

pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::scoring::MarketCondition;
use crate::types::{Prediction, Score, ScoringStage, TradingDay, UserAggregate};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait Datastore: Send + Sync {
    // --- trading days ---
    async fn trading_day(&self, date: NaiveDate) -> Result<Option<TradingDay>>;
    async fn upsert_trading_day(&self, day: &TradingDay) -> Result<()>;
    /// Compare-and-set stage advance. Returns false if the day was not in `from`.
    async fn advance_stage(&self, date: NaiveDate, from: ScoringStage, to: ScoringStage)
        -> Result<bool>;
    /// Write the close capture for Stage 3. Committing this is also the
    /// mulligan-spend cutoff for the date.
    async fn capture_close(
        &self,
        date: NaiveDate,
        close_price: f64,
        actual_move_pct: f64,
        condition: MarketCondition,
    ) -> Result<()>;
    /// Forced re-score support: push the stage back to empty and clear the
    /// scored gate. Returns whether the day had already been scored.
    async fn reset_for_rescore(&self, date: NaiveDate) -> Result<bool>;

    // --- predictions ---
    async fn upsert_prediction(&self, prediction: &Prediction) -> Result<()>;
    async fn prediction(&self, user_id: &str, date: NaiveDate) -> Result<Option<Prediction>>;
    /// Lock every unlocked prediction for the date; returns how many flipped.
    async fn lock_predictions(&self, date: NaiveDate, locked_at: DateTime<Utc>) -> Result<u64>;
    async fn locked_predictions(&self, date: NaiveDate) -> Result<Vec<Prediction>>;

    // --- scores and aggregates ---
    async fn score(&self, user_id: &str, date: NaiveDate) -> Result<Option<Score>>;
    async fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>>;
    /// Create the aggregate row for a user if it does not exist.
    async fn ensure_user(&self, user_id: &str) -> Result<()>;
    /// ONE transaction: upsert score rows and fold each into its user's
    /// aggregate with replacement semantics (re-running is a no-op).
    async fn commit_scores(&self, date: NaiveDate, scores: &[Score]) -> Result<()>;
    /// ONE transaction: write streak/mulligan fields for the given users and,
    /// when `scored_at` is set, mark the day scored in the same commit.
    async fn commit_streaks(
        &self,
        date: NaiveDate,
        aggregates: &[UserAggregate],
        scored_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn mark_scored(&self, date: NaiveDate, scored_at: DateTime<Utc>) -> Result<()>;
    /// Active users with no Score for the date (the DidNotPlay set).
    async fn users_without_score(&self, date: NaiveDate) -> Result<Vec<UserAggregate>>;
    /// Atomic mulligan spend: re-validates balance, lock state, and the
    /// close-capture gate inside the transaction, then overwrites the
    /// prediction and debits the balance.
    async fn spend_mulligan(
        &self,
        user_id: &str,
        date: NaiveDate,
        new_value: f64,
    ) -> Result<Prediction>;
}
