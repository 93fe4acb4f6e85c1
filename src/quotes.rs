//! Fiat price quotes with a short-TTL cache and degraded fallbacks.
//!
//! Lookup order on `get`: fresh cache entry, then the external source, then
//! the stale cache entry, then the per-currency hard-coded constant. The
//! cache never fails a caller; degraded paths log and keep the game running.

use crate::types::Currency;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote request failed: {0}")]
    Http(String),

    #[error("quote response missing price for {0}")]
    MissingPrice(Currency),
}

/// Pluggable source of USD spot prices
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_usd_price(&self, currency: Currency) -> Result<f64, QuoteError>;
}

/// CoinGecko-compatible HTTP source. The per-request timeout lives on the
/// client; there is no retry at this layer.
pub struct HttpQuoteSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    usd: f64,
}

impl HttpQuoteSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_usd_price(&self, currency: Currency) -> Result<f64, QuoteError> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.base_url.trim_end_matches('/'),
            currency.quote_id()
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| QuoteError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| QuoteError::Http(e.to_string()))?;

        let body: HashMap<String, PriceEntry> = response
            .json()
            .await
            .map_err(|e| QuoteError::Http(e.to_string()))?;

        body.get(currency.quote_id())
            .map(|entry| entry.usd)
            .ok_or(QuoteError::MissingPrice(currency))
    }
}

/// Fixed price table for offline development and tests
pub struct StaticQuoteSource {
    prices: HashMap<Currency, f64>,
}

impl StaticQuoteSource {
    pub fn new(prices: HashMap<Currency, f64>) -> Self {
        Self { prices }
    }

    /// All five currencies at their fallback constants
    pub fn fallback_table() -> Self {
        Self::new(
            Currency::ALL
                .into_iter()
                .map(|c| (c, c.fallback_price_usd()))
                .collect(),
        )
    }
}

#[async_trait]
impl QuoteSource for StaticQuoteSource {
    async fn fetch_usd_price(&self, currency: Currency) -> Result<f64, QuoteError> {
        self.prices
            .get(&currency)
            .copied()
            .ok_or(QuoteError::MissingPrice(currency))
    }
}

#[derive(Debug, Clone, Copy)]
struct QuoteEntry {
    price: f64,
    fetched_at: Instant,
}

/// Process-wide memoized price lookup. Readers overlap; the write lock is
/// only taken to swap an entry and never held across an await.
pub struct QuoteCache {
    source: Box<dyn QuoteSource>,
    ttl: Duration,
    entries: RwLock<HashMap<Currency, QuoteEntry>>,
}

impl QuoteCache {
    pub fn new(source: Box<dyn QuoteSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current USD price for `currency`. Never fails: falls back to a stale
    /// entry, then to the hard-coded constant.
    pub async fn get(&self, currency: Currency) -> f64 {
        if let Some(price) = self.cached(currency, true) {
            return price;
        }

        match self.source.fetch_usd_price(currency).await {
            Ok(price) => {
                if let Ok(mut entries) = self.entries.write() {
                    entries.insert(currency, QuoteEntry { price, fetched_at: Instant::now() });
                }
                price
            }
            Err(err) => {
                if let Some(stale) = self.cached(currency, false) {
                    warn!(%currency, %err, "quote fetch failed, serving stale price");
                    stale
                } else {
                    let fallback = currency.fallback_price_usd();
                    warn!(%currency, %err, fallback, "quote fetch failed, serving fallback price");
                    fallback
                }
            }
        }
    }

    /// Prices for all supported currencies, fetched concurrently. Individual
    /// failures degrade per-currency.
    pub async fn get_all(&self) -> HashMap<Currency, f64> {
        let lookups = Currency::ALL.into_iter().map(|c| async move { (c, self.get(c).await) });
        join_all(lookups).await.into_iter().collect()
    }

    /// Drop every cached entry
    pub fn reset(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn cached(&self, currency: Currency, fresh_only: bool) -> Option<f64> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&currency)?;
        if fresh_only && entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.price)
    }
}

pub fn usd_to_crypto(usd: f64, price: f64) -> f64 {
    usd / price
}

pub fn crypto_to_usd(crypto: f64, price: f64) -> f64 {
    crypto * price
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Source that counts fetches and can be switched into failure mode
    struct FlakySource {
        price: f64,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl FlakySource {
        fn new(price: f64) -> Self {
            Self {
                price,
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl QuoteSource for &'static FlakySource {
        async fn fetch_usd_price(&self, _currency: Currency) -> Result<f64, QuoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(QuoteError::Http("connection refused".into()))
            } else {
                Ok(self.price)
            }
        }
    }

    fn leak(source: FlakySource) -> &'static FlakySource {
        Box::leak(Box::new(source))
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_fetch() {
        let source = leak(FlakySource::new(40_000.0));
        let cache = QuoteCache::new(Box::new(source), Duration::from_secs(10));

        assert_eq!(cache.get(Currency::Btc).await, 40_000.0);
        assert_eq!(cache.get(Currency::Btc).await, 40_000.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_on_failure() {
        let source = leak(FlakySource::new(3_200.0));
        let cache = QuoteCache::new(Box::new(source), Duration::from_millis(0));

        // Prime, then fail: the expired entry still backs the answer.
        assert_eq!(cache.get(Currency::Eth).await, 3_200.0);
        source.failing.store(true, Ordering::SeqCst);
        assert_eq!(cache.get(Currency::Eth).await, 3_200.0);
    }

    #[tokio::test]
    async fn test_fallback_constant_when_nothing_cached() {
        let source = leak(FlakySource::new(0.0));
        source.failing.store(true, Ordering::SeqCst);
        let cache = QuoteCache::new(Box::new(source), Duration::from_secs(10));

        assert_eq!(cache.get(Currency::Ltc).await, 100.0);
        assert_eq!(cache.get(Currency::Ada).await, 0.5);
    }

    #[tokio::test]
    async fn test_get_all_covers_every_currency() {
        let cache = QuoteCache::new(
            Box::new(StaticQuoteSource::fallback_table()),
            Duration::from_secs(10),
        );

        let prices = cache.get_all().await;
        assert_eq!(prices.len(), Currency::ALL.len());
        assert_eq!(prices[&Currency::Btc], 45_000.0);
        assert_eq!(prices[&Currency::Dot], 7.0);
    }

    #[tokio::test]
    async fn test_reset_forces_refetch() {
        let source = leak(FlakySource::new(95.0));
        let cache = QuoteCache::new(Box::new(source), Duration::from_secs(10));

        cache.get(Currency::Ltc).await;
        cache.reset();
        cache.get(Currency::Ltc).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(usd_to_crypto(20.0, 40_000.0), 0.0005);
        assert_eq!(crypto_to_usd(0.001, 40_000.0), 40.0);
    }
}
