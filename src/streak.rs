//! Streak and mulligan progression. Transitions are pure functions over a
//! `UserAggregate`; persistence happens in the datastore layer.

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::config::{MissedDayPolicy, MAX_MULLIGANS, STREAK_PER_MULLIGAN};
use crate::error::{AppError, Result};
use crate::scheduler::Clock;
use crate::types::{Prediction, TradingDay, UserAggregate};

/// What a user did on a scored trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOutcome {
    Played,
    DidNotPlay,
}

/// Result of one daily transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub mulligan_awarded: bool,
    pub streak_reset: bool,
}

/// Advance one user's streak state for a scored trading day.
///
/// Played: streak +1, longest = max, and every `STREAK_PER_MULLIGAN`th
/// consecutive day earns a mulligan while below the cap. DidNotPlay: streak
/// resets to 0 (longest untouched); under the penalize policy the missed day
/// also charges a fixed golf score against the running total.
pub fn advance(agg: &mut UserAggregate, outcome: DayOutcome, policy: MissedDayPolicy) -> Transition {
    match outcome {
        DayOutcome::Played => {
            agg.current_streak += 1;
            agg.longest_streak = agg.longest_streak.max(agg.current_streak);

            let eligible = agg.current_streak % STREAK_PER_MULLIGAN == 0
                && agg.mulligans_available < MAX_MULLIGANS;
            if eligible {
                agg.mulligans_available = (agg.mulligans_available + 1).min(MAX_MULLIGANS);
                agg.mulligans_earned_total += 1;
            }
            Transition { mulligan_awarded: eligible, streak_reset: false }
        }
        DayOutcome::DidNotPlay => {
            let had_streak = agg.current_streak > 0;
            agg.current_streak = 0;
            if let MissedDayPolicy::Penalize { golf_score } = policy {
                agg.total_score += golf_score;
                if agg.total_days_played > 0 {
                    agg.avg_score = agg.total_score as f64 / agg.total_days_played as f64;
                }
            }
            Transition { mulligan_awarded: false, streak_reset: had_streak }
        }
    }
}

/// The mulligan window: opens when predictions lock, closes mid-afternoon,
/// and always ends before the close is scored.
#[derive(Debug, Clone, Copy)]
pub struct MulliganWindow {
    pub opens_at: chrono::NaiveTime,
    pub ends_at: chrono::NaiveTime,
    pub timezone: Tz,
}

impl MulliganWindow {
    pub fn is_open(&self, clock: &dyn Clock, date: NaiveDate) -> bool {
        let now = clock.now_utc().with_timezone(&self.timezone);
        now.date_naive() == date && now.time() >= self.opens_at && now.time() < self.ends_at
    }
}

/// Validate a mulligan spend against the in-memory view. The datastore
/// re-checks the day gate inside its transaction; this gives callers the
/// loud, descriptive rejection first.
pub fn validate_spend(
    agg: &UserAggregate,
    prediction: Option<&Prediction>,
    day: Option<&TradingDay>,
) -> Result<()> {
    if agg.mulligans_available < 1 {
        return Err(AppError::MulliganRejected("no mulligans available".to_string()));
    }
    let prediction = prediction
        .ok_or_else(|| AppError::MulliganRejected("no prediction for this date".to_string()))?;
    if prediction.locked_at.is_none() {
        return Err(AppError::MulliganRejected(
            "prediction is not locked yet; edit it directly".to_string(),
        ));
    }
    if prediction.is_mulligan_active {
        return Err(AppError::MulliganRejected("mulligan already used today".to_string()));
    }
    let day = day.ok_or_else(|| AppError::MulliganRejected("no market data for this date".to_string()))?;
    if day.close_price.is_some() || day.stage == crate::types::ScoringStage::Scored {
        return Err(AppError::MulliganRejected("scoring has already begun for this date".to_string()));
    }
    Ok(())
}
