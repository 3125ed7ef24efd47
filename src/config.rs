use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::error::{AppError, Result};

pub const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Index whose close the players predict.
pub const INDEX_SYMBOL: &str = "^GSPC";

/// Volatility index driving the daily par.
pub const VOLATILITY_SYMBOL: &str = "^VIX";

/// Read-through cache TTL for live quotes (seconds). Historical lookups bypass it.
pub const QUOTE_CACHE_TTL_SECS: u64 = 60;

/// Feed retry policy: at most 3 attempts, delays doubling from 1s.
pub const FEED_MAX_ATTEMPTS: u32 = 3;
pub const FEED_INITIAL_RETRY_MS: u64 = 1_000;

/// HTTP timeout for a single feed call (seconds).
pub const FEED_HTTP_TIMEOUT_SECS: u64 = 30;

/// Annualized-to-daily volatility conversion: sqrt(252) ≈ 15.87.
pub const DAILY_VOL_DIVISOR: f64 = 15.87;

/// Streak length that earns a mulligan, and the balance cap.
pub const STREAK_PER_MULLIGAN: i64 = 5;
pub const MAX_MULLIGANS: i64 = 2;

/// What happens to a user with no prediction on a scored trading day.
/// `Skip` only resets the streak. `Penalize` additionally charges a fixed
/// golf score against the user's running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedDayPolicy {
    Skip,
    Penalize { golf_score: i64 },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chart_api_url: String,
    pub log_level: String,
    pub db_path: String,
    /// Exchange time zone for all stage scheduling (TIMEZONE).
    pub timezone: Tz,
    /// Stage 1 fire time: capture the opening snapshot (CAPTURE_OPEN_AT, HH:MM).
    pub capture_open_at: NaiveTime,
    /// Stage 2 fire time: freeze predictions (LOCK_PREDICTIONS_AT, HH:MM).
    pub lock_predictions_at: NaiveTime,
    /// Stage 3 fire time: score the close (SCORE_CLOSE_AT, HH:MM).
    pub score_close_at: NaiveTime,
    /// End of the mulligan window (MULLIGAN_WINDOW_ENDS_AT, HH:MM).
    /// The window opens when predictions lock.
    pub mulligan_window_ends_at: NaiveTime,
    /// MISSED_DAY_PENALTY: unset or empty = no penalty, otherwise the golf
    /// score charged for a missed trading day.
    pub missed_day_policy: MissedDayPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let timezone: Tz = std::env::var("TIMEZONE")
            .unwrap_or_else(|_| "America/New_York".to_string())
            .parse()
            .map_err(|_| AppError::Config("TIMEZONE must be an IANA zone name".to_string()))?;

        let missed_day_policy = match std::env::var("MISSED_DAY_PENALTY") {
            Ok(v) if !v.trim().is_empty() => {
                let golf_score = v.trim().parse::<i64>().map_err(|_| {
                    AppError::Config("MISSED_DAY_PENALTY must be an integer golf score".to_string())
                })?;
                MissedDayPolicy::Penalize { golf_score }
            }
            _ => MissedDayPolicy::Skip,
        };

        Ok(Self {
            chart_api_url: std::env::var("CHART_API_URL")
                .unwrap_or_else(|_| YAHOO_CHART_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "bulligan.db".to_string()),
            timezone,
            capture_open_at: parse_time_var("CAPTURE_OPEN_AT", "09:30")?,
            lock_predictions_at: parse_time_var("LOCK_PREDICTIONS_AT", "11:00")?,
            score_close_at: parse_time_var("SCORE_CLOSE_AT", "16:05")?,
            mulligan_window_ends_at: parse_time_var("MULLIGAN_WINDOW_ENDS_AT", "14:00")?,
            missed_day_policy,
        })
    }
}

fn parse_time_var(name: &str, default: &str) -> Result<NaiveTime> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .map_err(|_| AppError::Config(format!("{name} must be HH:MM, got {raw:?}")))
}
