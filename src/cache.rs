use crate::candle_utils::candles_in_range;
use crate::config::Timeframe;
use crate::exchange::{Exchange, SharedExchange};
use crate::models::{Balance, Candle, Order, OrderRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::path::{Path, PathBuf};

const CACHE_DATE_FORMAT: &str = "%Y%m%d";

/// File-backed cache for historical candles in front of another exchange.
///
/// Files are named `{symbol}_{timeframe}_{from}_{to}.json` with day-granular dates. A miss
/// fetches the request widened to whole UTC days, so a file always holds exactly the midnight
/// to midnight range its name says. A file whose range covers a request serves the
/// `from..=to` subset of its candles. Orders and balances always go to the wrapped exchange.
pub struct CachedExchange {
    inner: SharedExchange,
    cache_dir: PathBuf,
}

impl CachedExchange {
    pub fn new(inner: SharedExchange, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_key(
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> String {
        format!(
            "{}_{}_{}_{}.json",
            symbol,
            timeframe.as_str(),
            from.format(CACHE_DATE_FORMAT),
            to.format(CACHE_DATE_FORMAT)
        )
    }

    /// Today's bars are still forming, so ranges ending today or later skip the cache.
    fn is_cacheable(day_to: DateTime<Utc>) -> bool {
        day_to.date_naive() < Utc::now().date_naive()
    }

    async fn read_cached(&self, path: &Path) -> Option<Vec<Candle>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("Failed to read candle cache {}: {}", path.display(), err);
                return None;
            }
        };
        match serde_json::from_slice::<Vec<Candle>>(&raw) {
            Ok(candles) => Some(candles),
            Err(err) => {
                log::warn!(
                    "Ignoring unreadable candle cache {}: {}",
                    path.display(),
                    err
                );
                None
            }
        }
    }

    /// Files of the same symbol and timeframe whose stored range encloses `from..=to`.
    async fn find_covering_files(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let prefix = format!("{}_{}_", symbol, timeframe.as_str());
        let mut covering = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.cache_dir).await else {
            return covering;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((covered_from, covered_to)) = parse_covered_range(name, &prefix) else {
                continue;
            };
            if covered_from <= from && covered_to >= to {
                covering.push(entry.path());
            }
        }
        covering
    }

    async fn write_cached(&self, path: &Path, candles: &[Candle]) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("Failed to create cache dir {}", self.cache_dir.display()))?;
        let payload = serde_json::to_vec(candles).context("Failed to encode candles")?;
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("Failed to write candle cache {}", path.display()))
    }
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive))
}

/// Widens a request to whole UTC days, the granularity file names can describe.
fn day_bounds(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = midnight(from.date_naive())?;
    let mut end = midnight(to.date_naive())?;
    if end < to {
        end = end + Duration::days(1);
    }
    Some((start, end))
}

/// Stored range of a cache file. Files are only ever written for day-aligned ranges, so both
/// dates stand for their midnight.
fn parse_covered_range(file_name: &str, prefix: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let dates = file_name.strip_prefix(prefix)?.strip_suffix(".json")?;
    let (from, to) = dates.split_once('_')?;
    let from = NaiveDate::parse_from_str(from, CACHE_DATE_FORMAT).ok()?;
    let to = NaiveDate::parse_from_str(to, CACHE_DATE_FORMAT).ok()?;
    Some((midnight(from)?, midnight(to)?))
}

#[async_trait]
impl Exchange for CachedExchange {
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let Some((day_from, day_to)) =
            day_bounds(from, to).filter(|(_, day_to)| Self::is_cacheable(*day_to))
        else {
            return self.inner.get_historical_data(symbol, timeframe, from, to).await;
        };

        for source in self.find_covering_files(symbol, timeframe, from, to).await {
            if let Some(cached) = self.read_cached(&source).await {
                log::debug!(
                    "Serving {} {} candles from cache {}",
                    symbol,
                    timeframe,
                    source.display()
                );
                return Ok(candles_in_range(&cached, from, to));
            }
        }

        let fetched = self
            .inner
            .get_historical_data(symbol, timeframe, day_from, day_to)
            .await?;
        if !fetched.is_empty() {
            let path = self
                .cache_dir
                .join(Self::cache_key(symbol, timeframe, day_from, day_to));
            if let Err(err) = self.write_cached(&path, &fetched).await {
                log::warn!("{:#}", err);
            }
        }
        Ok(candles_in_range(&fetched, from, to))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        self.inner.place_order(request).await
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        self.inner.get_order(symbol, order_id).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance> {
        self.inner.get_balance(asset).await
    }
}
