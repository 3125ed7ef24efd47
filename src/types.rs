use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::scoring::MarketCondition;

/// Per-day pipeline progression. One-directional; each stage's re-entry is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringStage {
    Empty,
    Opened,
    Locked,
    Scored,
}

impl ScoringStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringStage::Empty => "empty",
            ScoringStage::Opened => "opened",
            ScoringStage::Locked => "locked",
            ScoringStage::Scored => "scored",
        }
    }

    pub fn parse(s: &str) -> ScoringStage {
        match s {
            "opened" => ScoringStage::Opened,
            "locked" => ScoringStage::Locked,
            "scored" => ScoringStage::Scored,
            _ => ScoringStage::Empty,
        }
    }
}

impl std::fmt::Display for ScoringStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per calendar date. Created by Stage 1, close fields filled by
/// Stage 3, never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub is_trading_day: bool,
    pub open_price: Option<f64>,
    pub close_price: Option<f64>,
    /// Volatility index close of the previous trading day.
    pub prior_volatility: Option<f64>,
    pub par: Option<i64>,
    /// Expected daily move in percent, derived from prior_volatility.
    pub expected_move: Option<f64>,
    pub actual_move_pct: Option<f64>,
    pub condition: Option<MarketCondition>,
    pub stage: ScoringStage,
    pub opened_at: Option<DateTime<Utc>>,
    pub scored_at: Option<DateTime<Utc>>,
}

/// At most one per (user, date). Immutable once locked, except for the single
/// permitted mulligan overwrite.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub user_id: String,
    pub date: NaiveDate,
    pub predicted_close: f64,
    pub submitted_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub is_mulligan_active: bool,
    /// Pre-mulligan value, set only when a mulligan overwrote the prediction.
    pub original_value: Option<f64>,
}

/// Exactly one per (user, date) once Stage 3 completes; mutated only by a
/// forced re-score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub user_id: String,
    pub date: NaiveDate,
    pub strokes: i64,
    pub par: i64,
    pub golf_score: i64,
    pub score_name: String,
    /// Signed deviation in percent, rounded to 4 decimal places.
    pub deviation_pct: f64,
    pub is_hole_in_one: bool,
    pub used_mulligan: bool,
}

/// Per-user cumulative statistics. Scoring totals and category counters are
/// owned by Stage 3; streak and mulligan fields by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserAggregate {
    pub user_id: String,
    pub is_active: bool,
    pub total_days_played: i64,
    pub total_score: i64,
    pub avg_score: f64,
    pub best_score: Option<i64>,
    pub hole_in_ones: i64,
    pub condors: i64,
    pub albatrosses: i64,
    pub eagles: i64,
    pub birdies: i64,
    pub pars: i64,
    pub bogeys: i64,
    pub double_bogeys: i64,
    pub triple_bogeys: i64,
    pub worse: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub mulligans_available: i64,
    pub mulligans_earned_total: i64,
    pub mulligans_used_total: i64,
}

impl UserAggregate {
    /// Fixed lookup from category to its counter field. Aggregate columns are
    /// only ever addressed through this table.
    pub fn category_counter_mut(&mut self, category: crate::scoring::ScoreCategory) -> &mut i64 {
        use crate::scoring::ScoreCategory::*;
        match category {
            HoleInOnes => &mut self.hole_in_ones,
            Condors => &mut self.condors,
            Albatrosses => &mut self.albatrosses,
            Eagles => &mut self.eagles,
            Birdies => &mut self.birdies,
            Pars => &mut self.pars,
            Bogeys => &mut self.bogeys,
            DoubleBogeys => &mut self.double_bogeys,
            TripleBogeys => &mut self.triple_bogeys,
            Worse => &mut self.worse,
        }
    }

    /// Fold one score into the cumulative totals. When `old` is present this
    /// is a replacement (forced re-score): the previous contribution is
    /// backed out first, so re-applying the same score is a no-op and a
    /// corrected score never double-counts. `best_score` is recomputed from
    /// the scores table by the datastore after the score row is written.
    pub fn apply_score(&mut self, old: Option<&Score>, new: &Score) {
        use crate::scoring::ScoreCategory;
        if let Some(old) = old {
            self.total_score -= old.golf_score;
            *self.category_counter_mut(ScoreCategory::from_score(
                old.golf_score,
                old.strokes,
                old.par,
            )) -= 1;
        } else {
            self.total_days_played += 1;
        }
        self.total_score += new.golf_score;
        *self.category_counter_mut(ScoreCategory::from_score(
            new.golf_score,
            new.strokes,
            new.par,
        )) += 1;
        if self.total_days_played > 0 {
            self.avg_score = self.total_score as f64 / self.total_days_played as f64;
        }
    }

    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_active: true,
            total_days_played: 0,
            total_score: 0,
            avg_score: 0.0,
            best_score: None,
            hole_in_ones: 0,
            condors: 0,
            albatrosses: 0,
            eagles: 0,
            birdies: 0,
            pars: 0,
            bogeys: 0,
            double_bogeys: 0,
            triple_bogeys: 0,
            worse: 0,
            current_streak: 0,
            longest_streak: 0,
            mulligans_available: 0,
            mulligans_earned_total: 0,
            mulligans_used_total: 0,
        }
    }
}

/// The three ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CaptureOpen,
    LockPredictions,
    ScoreClose,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CaptureOpen => "capture-open",
            Stage::LockPredictions => "lock-predictions",
            Stage::ScoreClose => "score-close",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "capture-open" | "open" => Ok(Stage::CaptureOpen),
            "lock-predictions" | "lock" => Ok(Stage::LockPredictions),
            "score-close" | "score" => Ok(Stage::ScoreClose),
            other => Err(format!("unknown stage {other:?}")),
        }
    }
}

/// Result of invoking a stage. Skips and idempotency short-circuits are
/// success-shaped, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    NotATradingDay,
    AlreadyCompleted,
    Opened {
        open_price: f64,
        prior_volatility: f64,
        par: i64,
    },
    Locked {
        predictions_locked: u64,
    },
    Scored {
        close_price: f64,
        actual_move_pct: f64,
        condition: MarketCondition,
        scores_created: usize,
        streaks_incremented: usize,
        streaks_reset: usize,
        mulligans_awarded: usize,
    },
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutcome::NotATradingDay => write!(f, "skipped: not a trading day"),
            StageOutcome::AlreadyCompleted => write!(f, "skipped: already completed"),
            StageOutcome::Opened { open_price, prior_volatility, par } => write!(
                f,
                "opened: open={open_price:.2} prior_vol={prior_volatility:.2} par={par}"
            ),
            StageOutcome::Locked { predictions_locked } => {
                write!(f, "locked: {predictions_locked} predictions")
            }
            StageOutcome::Scored {
                close_price,
                actual_move_pct,
                condition,
                scores_created,
                streaks_incremented,
                streaks_reset,
                mulligans_awarded,
            } => write!(
                f,
                "scored: close={close_price:.2} move={actual_move_pct:+.2}% condition={condition} \
                 scores={scores_created} streaks+={streaks_incremented} resets={streaks_reset} \
                 mulligans={mulligans_awarded}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_outcomes_serialize_with_an_outcome_tag() {
        let v = serde_json::to_value(StageOutcome::NotATradingDay).unwrap();
        assert_eq!(v["outcome"], "not_a_trading_day");

        let v = serde_json::to_value(StageOutcome::Scored {
            close_price: 5010.0,
            actual_move_pct: 0.2,
            condition: MarketCondition::Calm,
            scores_created: 2,
            streaks_incremented: 2,
            streaks_reset: 0,
            mulligans_awarded: 1,
        })
        .unwrap();
        assert_eq!(v["outcome"], "scored");
        assert_eq!(v["condition"], "calm");
        assert_eq!(v["scores_created"], 2);
    }

    #[test]
    fn scores_serialize_with_their_stored_field_names() {
        let score = Score {
            user_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            strokes: 1,
            par: 4,
            golf_score: -3,
            score_name: "Albatross".to_string(),
            deviation_pct: 0.02,
            is_hole_in_one: false,
            used_mulligan: false,
        };
        let v = serde_json::to_value(&score).unwrap();
        assert_eq!(v["date"], "2026-03-02");
        assert_eq!(v["golf_score"], -3);
        assert_eq!(v["score_name"], "Albatross");
    }
}
