//! Pure scoring functions. No I/O, no datastore; everything here is
//! deterministic on its inputs.

use crate::config::DAILY_VOL_DIVISOR;
use crate::types::Score;

/// Daily par from the prior day's volatility index close.
pub fn par_from_volatility(v: f64) -> i64 {
    if v < 16.0 {
        3
    } else if v < 21.0 {
        4
    } else if v < 25.0 {
        5
    } else {
        6
    }
}

/// Expected daily move in percent: annualized volatility over sqrt(252).
pub fn expected_move_from_volatility(v: f64) -> f64 {
    v / DAILY_VOL_DIVISOR
}

/// Strokes from absolute deviation, expressed as a fraction of the actual
/// close (0.001 = 0.1%).
pub fn strokes_from_deviation(d: f64) -> i64 {
    let d = d.abs();
    if d <= 0.001 {
        1
    } else if d <= 0.0025 {
        2
    } else if d <= 0.005 {
        3
    } else if d <= 0.01 {
        4
    } else if d <= 0.02 {
        5
    } else if d <= 0.03 {
        6
    } else if d <= 0.05 {
        7
    } else {
        8
    }
}

pub fn score_name(golf_score: i64) -> &'static str {
    match golf_score {
        i64::MIN..=-4 => "Condor",
        -3 => "Albatross",
        -2 => "Eagle",
        -1 => "Birdie",
        0 => "Par",
        1 => "Bogey",
        2 => "Double Bogey",
        3 => "Triple Bogey",
        _ => "Quadruple Bogey+",
    }
}

pub fn is_hole_in_one(strokes: i64, par: i64) -> bool {
    strokes == 1 && par == 3
}

/// Stats-counter key for a score. A fixed enumerated set; aggregate columns
/// are addressed through this lookup, never through interpolated strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreCategory {
    HoleInOnes,
    Condors,
    Albatrosses,
    Eagles,
    Birdies,
    Pars,
    Bogeys,
    DoubleBogeys,
    TripleBogeys,
    Worse,
}

impl ScoreCategory {
    /// Hole-in-one takes precedence over the numeric bucket.
    pub fn from_score(golf_score: i64, strokes: i64, par: i64) -> ScoreCategory {
        if is_hole_in_one(strokes, par) {
            return ScoreCategory::HoleInOnes;
        }
        match golf_score {
            i64::MIN..=-4 => ScoreCategory::Condors,
            -3 => ScoreCategory::Albatrosses,
            -2 => ScoreCategory::Eagles,
            -1 => ScoreCategory::Birdies,
            0 => ScoreCategory::Pars,
            1 => ScoreCategory::Bogeys,
            2 => ScoreCategory::DoubleBogeys,
            3 => ScoreCategory::TripleBogeys,
            _ => ScoreCategory::Worse,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            ScoreCategory::HoleInOnes => "hole_in_ones",
            ScoreCategory::Condors => "condors",
            ScoreCategory::Albatrosses => "albatrosses",
            ScoreCategory::Eagles => "eagles",
            ScoreCategory::Birdies => "birdies",
            ScoreCategory::Pars => "pars",
            ScoreCategory::Bogeys => "bogeys",
            ScoreCategory::DoubleBogeys => "double_bogeys",
            ScoreCategory::TripleBogeys => "triple_bogeys",
            ScoreCategory::Worse => "worse",
        }
    }
}

/// Descriptive market condition from the day's realized move against the
/// expected move. Never influences strokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketCondition {
    Calm,
    Choppy,
    Volatile,
    Extreme,
}

impl MarketCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketCondition::Calm => "calm",
            MarketCondition::Choppy => "choppy",
            MarketCondition::Volatile => "volatile",
            MarketCondition::Extreme => "extreme",
        }
    }

    pub fn parse(s: &str) -> Option<MarketCondition> {
        match s {
            "calm" => Some(MarketCondition::Calm),
            "choppy" => Some(MarketCondition::Choppy),
            "volatile" => Some(MarketCondition::Volatile),
            "extreme" => Some(MarketCondition::Extreme),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn condition_from_move(actual_move_pct: f64, expected_move: f64) -> MarketCondition {
    let ratio = actual_move_pct.abs() / expected_move.max(f64::EPSILON);
    if ratio <= 1.0 {
        MarketCondition::Calm
    } else if ratio <= 1.5 {
        MarketCondition::Choppy
    } else if ratio <= 2.0 {
        MarketCondition::Volatile
    } else {
        MarketCondition::Extreme
    }
}

/// Everything derived from one prediction against the actual close.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub strokes: i64,
    pub golf_score: i64,
    pub score_name: &'static str,
    /// Signed deviation in percent, 4 decimal places.
    pub deviation_pct: f64,
    pub is_hole_in_one: bool,
    pub category: ScoreCategory,
}

pub fn score_prediction(par: i64, predicted: f64, actual: f64) -> ScoreCard {
    let deviation = (predicted - actual) / actual;
    let strokes = strokes_from_deviation(deviation);
    let golf_score = strokes - par;
    ScoreCard {
        strokes,
        golf_score,
        score_name: score_name(golf_score),
        deviation_pct: (deviation * 100.0 * 10_000.0).round() / 10_000.0,
        is_hole_in_one: is_hole_in_one(strokes, par),
        category: ScoreCategory::from_score(golf_score, strokes, par),
    }
}

impl ScoreCard {
    pub fn into_score(self, user_id: String, date: chrono::NaiveDate, par: i64, used_mulligan: bool) -> Score {
        Score {
            user_id,
            date,
            strokes: self.strokes,
            par,
            golf_score: self.golf_score,
            score_name: self.score_name.to_string(),
            deviation_pct: self.deviation_pct,
            is_hole_in_one: self.is_hole_in_one,
            used_mulligan,
        }
    }
}
