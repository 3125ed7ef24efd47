//! Market data gateway: a typed feed contract plus short-TTL caching and
//! bounded exponential-backoff retry. Exhausted retries surface as
//! `DataUnavailable`: the caller's stage did not complete and must be
//! re-run later.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::calendar;
use crate::config::{
    FEED_HTTP_TIMEOUT_SECS, FEED_INITIAL_RETRY_MS, FEED_MAX_ATTEMPTS, INDEX_SYMBOL,
    QUOTE_CACHE_TTL_SECS, VOLATILITY_SYMBOL,
};
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub previous_close: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DailyBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Opening snapshot: what Stage 1 needs to set up the day.
#[derive(Debug, Clone, Copy)]
pub struct OpenSnapshot {
    pub open_price: f64,
    pub prior_volatility_close: f64,
}

/// Closing snapshot: what Stage 3 needs to score the day.
#[derive(Debug, Clone, Copy)]
pub struct CloseSnapshot {
    pub close_price: f64,
    pub high: f64,
    pub low: f64,
    pub change_pct: f64,
}

/// The external feed contract: one live quote and one historical daily bar.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;
    async fn daily_bar(&self, symbol: &str, date: NaiveDate) -> Result<Option<DailyBar>>;
}

/// Yahoo chart API implementation of [`MarketFeed`].
pub struct YahooFeed {
    client: reqwest::Client,
    base_url: String,
}

impl YahooFeed {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FEED_HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

#[async_trait]
impl MarketFeed for YahooFeed {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!(
            "{}/{}?interval=1d&range=1d",
            self.base_url,
            urlencode(symbol)
        );
        let resp: serde_json::Value = self.client.get(&url).send().await?.json().await?;

        let result = resp
            .get("chart")
            .and_then(|c| c.get("result"))
            .and_then(|r| r.as_array())
            .and_then(|a| a.first())
            .ok_or_else(|| feed_shape_error(symbol, "chart.result missing"))?;
        let meta = result
            .get("meta")
            .ok_or_else(|| feed_shape_error(symbol, "meta missing"))?;

        let price = meta_f64(meta, "regularMarketPrice")
            .ok_or_else(|| feed_shape_error(symbol, "regularMarketPrice missing"))?;
        let previous_close = meta_f64(meta, "chartPreviousClose")
            .or_else(|| meta_f64(meta, "previousClose"))
            .ok_or_else(|| feed_shape_error(symbol, "previous close missing"))?;

        // The session open is the first non-null entry in the intraday open
        // series; newer responses also carry it in meta.
        let quote_block = result
            .get("indicators")
            .and_then(|i| i.get("quote"))
            .and_then(|q| q.as_array())
            .and_then(|a| a.first());
        let open = meta_f64(meta, "regularMarketOpen")
            .or_else(|| quote_block.and_then(|q| first_series_value(q, "open")))
            .unwrap_or(previous_close);
        let high = meta_f64(meta, "regularMarketDayHigh")
            .or_else(|| quote_block.and_then(|q| first_series_value(q, "high")))
            .unwrap_or(price);
        let low = meta_f64(meta, "regularMarketDayLow")
            .or_else(|| quote_block.and_then(|q| first_series_value(q, "low")))
            .unwrap_or(price);

        let change_pct = if previous_close != 0.0 {
            (price - previous_close) / previous_close * 100.0
        } else {
            0.0
        };

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            open,
            high,
            low,
            previous_close,
            change_pct,
        })
    }

    async fn daily_bar(&self, symbol: &str, date: NaiveDate) -> Result<Option<DailyBar>> {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp();
        let end = start + 86_400;
        let url = format!(
            "{}/{}?interval=1d&period1={start}&period2={end}",
            self.base_url,
            urlencode(symbol)
        );
        let resp: serde_json::Value = self.client.get(&url).send().await?.json().await?;

        let result = resp
            .get("chart")
            .and_then(|c| c.get("result"))
            .and_then(|r| r.as_array())
            .and_then(|a| a.first());
        let Some(result) = result else { return Ok(None) };

        let Some(quote_block) = result
            .get("indicators")
            .and_then(|i| i.get("quote"))
            .and_then(|q| q.as_array())
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };

        let open = first_series_value(quote_block, "open");
        let high = first_series_value(quote_block, "high");
        let low = first_series_value(quote_block, "low");
        let close = first_series_value(quote_block, "close");

        match (open, high, low, close) {
            (Some(open), Some(high), Some(low), Some(close)) => {
                Ok(Some(DailyBar { open, high, low, close }))
            }
            _ => Ok(None),
        }
    }
}

fn meta_f64(meta: &serde_json::Value, key: &str) -> Option<f64> {
    meta.get(key).and_then(|v| v.as_f64())
}

fn first_series_value(quote_block: &serde_json::Value, series: &str) -> Option<f64> {
    quote_block
        .get(series)
        .and_then(|s| s.as_array())
        .and_then(|a| a.iter().find_map(|v| v.as_f64()))
}

fn feed_shape_error(symbol: &str, what: &str) -> AppError {
    AppError::Config(format!("unexpected feed response for {symbol}: {what}"))
}

fn urlencode(symbol: &str) -> String {
    symbol.replace('^', "%5E")
}

/// Cache TTL and retry ladder. Defaults follow the production policy;
/// tests shrink the delays to zero.
#[derive(Debug, Clone)]
pub struct GatewayTuning {
    pub cache_ttl: Duration,
    pub retry_delays: Vec<Duration>,
}

impl Default for GatewayTuning {
    fn default() -> Self {
        let retry_delays = (0..FEED_MAX_ATTEMPTS.saturating_sub(1))
            .map(|i| Duration::from_millis(FEED_INITIAL_RETRY_MS << i))
            .collect();
        Self { cache_ttl: Duration::from_secs(QUOTE_CACHE_TTL_SECS), retry_delays }
    }
}

pub struct Gateway {
    feed: Arc<dyn MarketFeed>,
    tuning: GatewayTuning,
    cache: Mutex<HashMap<String, (Instant, Quote)>>,
}

impl Gateway {
    pub fn new(feed: Arc<dyn MarketFeed>, tuning: GatewayTuning) -> Self {
        Self { feed, tuning, cache: Mutex::new(HashMap::new()) }
    }

    /// Opening snapshot for `date`: index open plus the volatility close of
    /// the previous trading day.
    pub async fn fetch_open_snapshot(&self, date: NaiveDate) -> Result<OpenSnapshot> {
        let quote = self.cached_quote(INDEX_SYMBOL).await?;
        let prior_volatility_close = self.volatility_for_par(date).await?;
        Ok(OpenSnapshot { open_price: quote.open, prior_volatility_close })
    }

    /// Closing snapshot: the current quote once the session has ended.
    pub async fn fetch_close_snapshot(&self) -> Result<CloseSnapshot> {
        let quote = self.cached_quote(INDEX_SYMBOL).await?;
        Ok(CloseSnapshot {
            close_price: quote.price,
            high: quote.high,
            low: quote.low,
            change_pct: quote.change_pct,
        })
    }

    /// Daily close for a past date. Bypasses the quote cache, keeps the
    /// retry policy. `None` means the feed has no bar for that date.
    pub async fn fetch_historical_close(&self, symbol: &str, date: NaiveDate) -> Result<Option<f64>> {
        Ok(self.fetch_historical_bar(symbol, date).await?.map(|b| b.close))
    }

    pub async fn fetch_historical_bar(&self, symbol: &str, date: NaiveDate) -> Result<Option<DailyBar>> {
        let feed = &self.feed;
        self.with_retry(&format!("daily bar {symbol} {date}"), || feed.daily_bar(symbol, date))
            .await
    }

    /// Volatility close of the trading day before `date`, for par derivation.
    /// Historical bar first; falls back to the live quote's previous close.
    pub async fn volatility_for_par(&self, date: NaiveDate) -> Result<f64> {
        let prior = calendar::previous_trading_day(date);
        if let Some(bar) = self.fetch_historical_bar(VOLATILITY_SYMBOL, prior).await? {
            return Ok(bar.close);
        }
        warn!("no historical volatility bar for {prior}, falling back to live previous close");
        let quote = self.cached_quote(VOLATILITY_SYMBOL).await?;
        Ok(quote.previous_close)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("gateway cache lock").clear();
    }

    async fn cached_quote(&self, symbol: &str) -> Result<Quote> {
        {
            let cache = self.cache.lock().expect("gateway cache lock");
            if let Some((at, quote)) = cache.get(symbol) {
                if at.elapsed() < self.tuning.cache_ttl {
                    debug!("quote cache hit for {symbol}");
                    return Ok(quote.clone());
                }
            }
        }

        let feed = &self.feed;
        let quote = self
            .with_retry(&format!("quote {symbol}"), || feed.quote(symbol))
            .await?;

        let mut cache = self.cache.lock().expect("gateway cache lock");
        cache.insert(symbol.to_string(), (Instant::now(), quote.clone()));
        Ok(quote)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.tuning.retry_delays.len() + 1;
        let mut last: Option<AppError> = None;
        for attempt in 1..=attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!("{what}: attempt {attempt}/{attempts} failed: {e}");
                    last = Some(e);
                    if let Some(delay) = self.tuning.retry_delays.get(attempt - 1) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }
        let last = last.map(|e| e.to_string()).unwrap_or_else(|| "no attempts".to_string());
        Err(AppError::DataUnavailable(format!("{what} after {attempts} attempts: {last}")))
    }
}
