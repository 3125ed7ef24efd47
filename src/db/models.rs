//! Database row types and their conversions into domain types.

use chrono::{DateTime, NaiveDate, Utc};

use crate::scoring::MarketCondition;
use crate::types::{Prediction, Score, ScoringStage, TradingDay, UserAggregate};

#[derive(Debug, sqlx::FromRow)]
pub struct TradingDayRow {
    pub date: NaiveDate,
    pub is_trading_day: i64,
    pub open_price: Option<f64>,
    pub close_price: Option<f64>,
    pub prior_volatility: Option<f64>,
    pub par: Option<i64>,
    pub expected_move: Option<f64>,
    pub actual_move_pct: Option<f64>,
    pub condition_tag: Option<String>,
    pub stage: String,
    pub opened_at: Option<DateTime<Utc>>,
    pub scored_at: Option<DateTime<Utc>>,
}

impl From<TradingDayRow> for TradingDay {
    fn from(r: TradingDayRow) -> Self {
        TradingDay {
            date: r.date,
            is_trading_day: r.is_trading_day != 0,
            open_price: r.open_price,
            close_price: r.close_price,
            prior_volatility: r.prior_volatility,
            par: r.par,
            expected_move: r.expected_move,
            actual_move_pct: r.actual_move_pct,
            condition: r.condition_tag.as_deref().and_then(MarketCondition::parse),
            stage: ScoringStage::parse(&r.stage),
            opened_at: r.opened_at,
            scored_at: r.scored_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PredictionRow {
    pub user_id: String,
    pub date: NaiveDate,
    pub predicted_close: f64,
    pub submitted_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub is_mulligan_active: i64,
    pub original_value: Option<f64>,
}

impl From<PredictionRow> for Prediction {
    fn from(r: PredictionRow) -> Self {
        Prediction {
            user_id: r.user_id,
            date: r.date,
            predicted_close: r.predicted_close,
            submitted_at: r.submitted_at,
            locked_at: r.locked_at,
            is_mulligan_active: r.is_mulligan_active != 0,
            original_value: r.original_value,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ScoreRow {
    pub user_id: String,
    pub date: NaiveDate,
    pub strokes: i64,
    pub par: i64,
    pub golf_score: i64,
    pub score_name: String,
    pub deviation_pct: f64,
    pub is_hole_in_one: i64,
    pub used_mulligan: i64,
}

impl From<ScoreRow> for Score {
    fn from(r: ScoreRow) -> Self {
        Score {
            user_id: r.user_id,
            date: r.date,
            strokes: r.strokes,
            par: r.par,
            golf_score: r.golf_score,
            score_name: r.score_name,
            deviation_pct: r.deviation_pct,
            is_hole_in_one: r.is_hole_in_one != 0,
            used_mulligan: r.used_mulligan != 0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct UserAggregateRow {
    pub user_id: String,
    pub is_active: i64,
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

impl From<UserAggregateRow> for UserAggregate {
    fn from(r: UserAggregateRow) -> Self {
        UserAggregate {
            user_id: r.user_id,
            is_active: r.is_active != 0,
            total_days_played: r.total_days_played,
            total_score: r.total_score,
            avg_score: r.avg_score,
            best_score: r.best_score,
            hole_in_ones: r.hole_in_ones,
            condors: r.condors,
            albatrosses: r.albatrosses,
            eagles: r.eagles,
            birdies: r.birdies,
            pars: r.pars,
            bogeys: r.bogeys,
            double_bogeys: r.double_bogeys,
            triple_bogeys: r.triple_bogeys,
            worse: r.worse,
            current_streak: r.current_streak,
            longest_streak: r.longest_streak,
            mulligans_available: r.mulligans_available,
            mulligans_earned_total: r.mulligans_earned_total,
            mulligans_used_total: r.mulligans_used_total,
        }
    }
}
