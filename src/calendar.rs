use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use tracing::warn;

/// NYSE full-closure holidays, by year. A date absent from every table on a
/// weekday is a trading day.
const NYSE_HOLIDAYS_2025: &[(u32, u32)] = &[
    (1, 1),   // New Year's Day
    (1, 20),  // Martin Luther King Jr. Day
    (2, 17),  // Presidents' Day
    (4, 18),  // Good Friday
    (5, 26),  // Memorial Day
    (7, 4),   // Independence Day
    (9, 1),   // Labor Day
    (11, 27), // Thanksgiving Day
    (12, 25), // Christmas Day
];

const NYSE_HOLIDAYS_2026: &[(u32, u32)] = &[
    (1, 1),   // New Year's Day
    (1, 19),  // Martin Luther King Jr. Day
    (2, 16),  // Presidents' Day
    (4, 3),   // Good Friday
    (5, 25),  // Memorial Day
    (7, 3),   // Independence Day (observed)
    (9, 7),   // Labor Day
    (11, 26), // Thanksgiving Day
    (12, 25), // Christmas Day
];

/// Early-close days (13:00 local): still trading days, shorter session.
const NYSE_EARLY_CLOSE_2025: &[(u32, u32)] = &[
    (7, 3),   // Day before Independence Day
    (11, 28), // Day after Thanksgiving
    (12, 24), // Christmas Eve
];

const NYSE_EARLY_CLOSE_2026: &[(u32, u32)] = &[
    (11, 27), // Day after Thanksgiving
    (12, 24), // Christmas Eve
];

const KNOWN_YEARS: &[i32] = &[2025, 2026];

/// Holiday table for a year. An unknown year is a recoverable condition:
/// fall back to the nearest known table and warn, never crash.
pub fn holidays_for_year(year: i32) -> &'static [(u32, u32)] {
    match year {
        2025 => NYSE_HOLIDAYS_2025,
        2026 => NYSE_HOLIDAYS_2026,
        _ => {
            let nearest = nearest_known_year(year);
            warn!("no holiday table for {year}, falling back to {nearest}");
            match nearest {
                2025 => NYSE_HOLIDAYS_2025,
                _ => NYSE_HOLIDAYS_2026,
            }
        }
    }
}

fn early_closes_for_year(year: i32) -> &'static [(u32, u32)] {
    match nearest_known_year(year) {
        2025 => NYSE_EARLY_CLOSE_2025,
        _ => NYSE_EARLY_CLOSE_2026,
    }
}

fn nearest_known_year(year: i32) -> i32 {
    *KNOWN_YEARS
        .iter()
        .min_by_key(|y| (year - **y).abs())
        .unwrap_or(&2026)
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_holiday(date: NaiveDate) -> bool {
    holidays_for_year(date.year())
        .iter()
        .any(|&(m, d)| date.month() == m && date.day() == d)
}

pub fn is_early_close(date: NaiveDate) -> bool {
    early_closes_for_year(date.year())
        .iter()
        .any(|&(m, d)| date.month() == m && date.day() == d)
}

pub fn is_trading_day(date: NaiveDate) -> bool {
    !is_weekend(date) && !is_holiday(date)
}

pub fn previous_trading_day(date: NaiveDate) -> NaiveDate {
    let mut d = date - Duration::days(1);
    while !is_trading_day(d) {
        d -= Duration::days(1);
    }
    d
}

pub fn next_trading_day(date: NaiveDate) -> NaiveDate {
    let mut d = date + Duration::days(1);
    while !is_trading_day(d) {
        d += Duration::days(1);
    }
    d
}

/// Local market-close time for a date: 13:00 on early-close days, 16:00 otherwise.
pub fn market_close_time(date: NaiveDate) -> NaiveTime {
    if is_early_close(date) {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap()
    } else {
        NaiveTime::from_hms_opt(16, 0, 0).unwrap()
    }
}

/// All trading days in [start, end], inclusive.
pub fn trading_days_in_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut d = start;
    while d <= end {
        if is_trading_day(d) {
            days.push(d);
        }
        d += Duration::days(1);
    }
    days
}
