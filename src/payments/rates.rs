//! Exchange rates
//!
//! USD prices come from a CoinMarketCap-compatible quote API and are cached
//! per coin:
//!
//! - a price younger than the refresh window is served without a lookup
//! - on lookup failure, a cached non-zero price younger than the staleness
//!   bound is served instead (degraded, logged at warn)
//! - otherwise the call fails with `rate-lookup-failed`
//!
//! The platform token is not listed anywhere and has a configured price.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::types::{Result, TollgateError};

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Current USD price of the coin identified by `slug`
    async fn usd_price(&self, slug: &str) -> Result<Decimal>;
}

#[derive(Deserialize)]
struct QuoteResponse {
    data: HashMap<String, QuoteEntry>,
}

#[derive(Deserialize)]
struct QuoteEntry {
    slug: String,
    quote: HashMap<String, QuotePrice>,
}

#[derive(Deserialize)]
struct QuotePrice {
    price: f64,
}

/// `GET /v1/cryptocurrency/quotes/latest?slug=...`
pub struct QuoteApiSource {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QuoteApiSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TollgateError::Config(format!("Failed to build quote client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl RateSource for QuoteApiSource {
    async fn usd_price(&self, slug: &str) -> Result<Decimal> {
        let mut request = self
            .http
            .get(format!("{}/v1/cryptocurrency/quotes/latest", self.base_url))
            .query(&[("slug", slug), ("convert", "USD")]);
        if let Some(key) = &self.api_key {
            request = request.header("X-CMC_PRO_API_KEY", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TollgateError::RateLookup(format!("quote request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(TollgateError::RateLookup(format!(
                "quote API returned {} for {}",
                response.status(),
                slug
            )));
        }

        let body: QuoteResponse = response
            .json()
            .await
            .map_err(|e| TollgateError::RateLookup(format!("bad quote response: {}", e)))?;

        let price = body
            .data
            .values()
            .find(|entry| entry.slug == slug)
            .and_then(|entry| entry.quote.get("USD"))
            .map(|usd| usd.price)
            .ok_or_else(|| TollgateError::RateLookup(format!("no USD quote for {}", slug)))?;

        Decimal::from_str(&price.to_string())
            .map_err(|e| TollgateError::RateLookup(format!("unusable price {} for {}: {}", price, slug, e)))
    }
}

/// Fixed prices, for dev mode and tests
#[derive(Default)]
pub struct StaticRates {
    prices: DashMap<String, Decimal>,
}

impl StaticRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, slug: &str, price: Decimal) -> Self {
        self.prices.insert(slug.to_string(), price);
        self
    }

    pub fn set_price(&self, slug: &str, price: Decimal) {
        self.prices.insert(slug.to_string(), price);
    }

    pub fn remove(&self, slug: &str) {
        self.prices.remove(slug);
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn usd_price(&self, slug: &str) -> Result<Decimal> {
        self.prices
            .get(slug)
            .map(|price| *price)
            .ok_or_else(|| TollgateError::RateLookup(format!("no price for {}", slug)))
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    price: Decimal,
    fetched_at: Instant,
}

pub struct RateOracle {
    source: Arc<dyn RateSource>,
    cache: DashMap<String, CachedRate>,
    refresh: Duration,
    max_staleness: Duration,
    token_usd_price: Decimal,
}

impl RateOracle {
    pub fn new(
        source: Arc<dyn RateSource>,
        refresh: Duration,
        max_staleness: Duration,
        token_usd_price: Decimal,
    ) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            refresh,
            max_staleness,
            token_usd_price,
        }
    }

    /// Fixed USD price of the platform token
    pub fn token_usd_price(&self) -> Decimal {
        self.token_usd_price
    }

    pub async fn usd_price(&self, slug: &str) -> Result<Decimal> {
        let cached = self.cache.get(slug).map(|entry| *entry);

        if let Some(rate) = cached {
            if rate.fetched_at.elapsed() < self.refresh {
                return Ok(rate.price);
            }
        }

        let failure = match self.source.usd_price(slug).await {
            Ok(price) if price > Decimal::ZERO => {
                debug!(slug = %slug, price = %price, "rate refreshed");
                self.cache.insert(
                    slug.to_string(),
                    CachedRate {
                        price,
                        fetched_at: Instant::now(),
                    },
                );
                return Ok(price);
            }
            Ok(price) => format!("non-positive price {}", price),
            Err(e) => e.to_string(),
        };

        match cached {
            Some(rate) if rate.price > Decimal::ZERO && rate.fetched_at.elapsed() <= self.max_staleness => {
                warn!(
                    slug = %slug,
                    price = %rate.price,
                    age_secs = rate.fetched_at.elapsed().as_secs(),
                    error = %failure,
                    "rate lookup failed, using cached rate"
                );
                Ok(rate.price)
            }
            _ => Err(TollgateError::RateLookup(format!("{}: {}", slug, failure))),
        }
    }

    /// Backdate a cache entry. `false` when the monotonic clock is younger
    /// than `age`, so the entry cannot be placed.
    #[cfg(test)]
    fn seed(&self, slug: &str, price: Decimal, age: Duration) -> bool {
        let Some(fetched_at) = Instant::now().checked_sub(age) else {
            return false;
        };
        self.cache.insert(slug.to_string(), CachedRate { price, fetched_at });
        true
    }
}
