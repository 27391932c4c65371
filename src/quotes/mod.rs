//! QuoteProvider (Unified) — §4.2.
//!
//! Provides symbol quotes, latest OHLC, indices, and historical candles with
//! automatic primary→fallback failover and caching (§4.3, `cache`). The
//! `reqwest::Client` construction mirrors the teacher's
//! `scrapers::dome_rest::DomeRestClient` (timeout, pool, keep-alive); the
//! primary/fallback failover composition is new but follows the same
//! "one client struct per upstream, methods return `anyhow::Result`" shape.

pub mod cache;

use crate::market_clock::now_utc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CANONICAL_INTERVALS: &[&str] = &["1m", "3m", "5m", "15m", "30m", "1h", "1d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Nse,
    Nfo,
}

/// NFO-looking symbols contain digits and end in CE/PE/FUT; everything else
/// routes to NSE.
pub fn route_exchange(symbol: &str) -> Exchange {
    let has_digit = symbol.chars().any(|c| c.is_ascii_digit());
    let is_derivative_suffix =
        symbol.ends_with("CE") || symbol.ends_with("PE") || symbol.ends_with("FUT");
    if has_digit && is_derivative_suffix {
        Exchange::Nfo
    } else {
        Exchange::Nse
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub oi: f64,
    pub change_percent: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn zero_filled(now: DateTime<Utc>) -> Self {
        Self { price: 0.0, open: 0.0, high: 0.0, low: 0.0, close: 0.0, volume: 0.0, oi: 0.0, change_percent: 0.0, timestamp: now }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
}

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quote(&self, symbols: &[String]) -> HashMap<String, Quote>;
    async fn get_historical(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
        use_cache: bool,
    ) -> Vec<Candle>;
    async fn get_indices_quote(&self) -> HashMap<String, Quote>;
    async fn get_market_status(&self) -> MarketStatus;
}

/// One upstream leg: primary or fallback. Callers never see the distinction;
/// it only matters for auth-expiry bookkeeping.
#[async_trait]
trait QuoteLeg: Send + Sync {
    async fn fetch_quote(&self, symbols: &[String], exchange: Exchange) -> Result<HashMap<String, Quote>>;
    async fn fetch_historical(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
    ) -> Result<Vec<Candle>>;
    async fn fetch_indices(&self) -> Result<HashMap<String, Quote>>;
}

/// Stub leg used when no real broker credentials are configured. Returns
/// empty results so the composed provider always exercises its fallback
/// path in tests and in environments with no live token yet.
struct StubLeg {
    name: &'static str,
}

#[async_trait]
impl QuoteLeg for StubLeg {
    async fn fetch_quote(&self, _symbols: &[String], _exchange: Exchange) -> Result<HashMap<String, Quote>> {
        debug!(leg = self.name, "stub leg returned no quotes");
        Ok(HashMap::new())
    }

    async fn fetch_historical(
        &self,
        _symbol: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        _interval: &str,
    ) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn fetch_indices(&self) -> Result<HashMap<String, Quote>> {
        Ok(HashMap::new())
    }
}

fn is_auth_expiry(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("api_key") || msg.contains("access_token")
}

/// Composed primary/fallback provider with candle caching and
/// runtime-detected auth upgrade/downgrade (§4.2).
pub struct ComposedQuoteProvider {
    primary: Box<dyn QuoteLeg>,
    fallback: Box<dyn QuoteLeg>,
    candle_cache: Arc<cache::HistoricalCandleCache>,
    primary_degraded: AtomicBool,
    indices: RwLock<HashMap<String, Quote>>,
}

impl ComposedQuoteProvider {
    pub fn new_stub(candle_cache: Arc<cache::HistoricalCandleCache>) -> Self {
        Self {
            primary: Box::new(StubLeg { name: "primary" }),
            fallback: Box::new(StubLeg { name: "fallback" }),
            candle_cache,
            primary_degraded: AtomicBool::new(false),
            indices: RwLock::new(HashMap::new()),
        }
    }

    /// True once a primary-auth failure has been observed this session; the
    /// provider stays on fallback until a successful primary call clears it.
    pub fn is_degraded(&self) -> bool {
        self.primary_degraded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QuoteProvider for ComposedQuoteProvider {
    async fn get_quote(&self, symbols: &[String]) -> HashMap<String, Quote> {
        let mut nse_symbols = Vec::new();
        let mut nfo_symbols = Vec::new();
        for s in symbols {
            match route_exchange(s) {
                Exchange::Nse => nse_symbols.push(s.clone()),
                Exchange::Nfo => nfo_symbols.push(s.clone()),
            }
        }

        let mut out = HashMap::new();
        for (batch, exchange) in [(nse_symbols, Exchange::Nse), (nfo_symbols, Exchange::Nfo)] {
            if batch.is_empty() {
                continue;
            }
            let result = if !self.is_degraded() {
                self.primary.fetch_quote(&batch, exchange).await
            } else {
                Err(anyhow::anyhow!("primary degraded"))
            };
            match result {
                Ok(quotes) if !quotes.is_empty() => {
                    self.primary_degraded.store(false, Ordering::Relaxed);
                    out.extend(quotes);
                }
                Ok(_) | Err(_) => {
                    if let Err(e) = &result {
                        if is_auth_expiry(e) {
                            warn!("primary quote auth expired, downgrading to fallback for the session");
                            self.primary_degraded.store(true, Ordering::Relaxed);
                        }
                    }
                    match self.fallback.fetch_quote(&batch, exchange).await {
                        Ok(quotes) => out.extend(quotes),
                        Err(e) => {
                            warn!(error = %e, "fallback quote fetch failed, zero-filling derivatives");
                            if exchange == Exchange::Nfo {
                                let now = now_utc();
                                for s in &batch {
                                    out.insert(s.clone(), Quote::zero_filled(now));
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    async fn get_historical(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
        use_cache: bool,
    ) -> Vec<Candle> {
        if use_cache {
            if let Some(rows) = self.candle_cache.get(symbol, from, to, interval) {
                return rows;
            }
        }

        let result = if !self.is_degraded() {
            self.primary.fetch_historical(symbol, from, to, interval).await
        } else {
            Err(anyhow::anyhow!("primary degraded"))
        };

        let rows = match result {
            Ok(rows) if !rows.is_empty() => {
                self.primary_degraded.store(false, Ordering::Relaxed);
                rows
            }
            _ => match self.fallback.fetch_historical(symbol, from, to, interval).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(symbol, error = %e, "historical fetch failed on both legs");
                    Vec::new()
                }
            },
        };

        if !rows.is_empty() {
            self.candle_cache.set(symbol, from, to, interval, "composed", &rows);
        }
        rows
    }

    async fn get_indices_quote(&self) -> HashMap<String, Quote> {
        match self.primary.fetch_indices().await {
            Ok(quotes) if !quotes.is_empty() => {
                *self.indices.write() = quotes.clone();
                quotes
            }
            _ => match self.fallback.fetch_indices().await {
                Ok(quotes) if !quotes.is_empty() => quotes,
                _ => self.indices.read().clone(),
            },
        }
    }

    async fn get_market_status(&self) -> MarketStatus {
        if crate::market_clock::is_cash_market_open(now_utc()) {
            MarketStatus::Open
        } else {
            MarketStatus::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nfo_symbols_route_to_nfo() {
        assert_eq!(route_exchange("NIFTY24DEC21000CE"), Exchange::Nfo);
        assert_eq!(route_exchange("BANKNIFTY24DEC45000PE"), Exchange::Nfo);
        assert_eq!(route_exchange("RELFUT"), Exchange::Nse); // no digit
    }

    #[test]
    fn plain_equity_symbols_route_to_nse() {
        assert_eq!(route_exchange("RELIANCE"), Exchange::Nse);
        assert_eq!(route_exchange("SBIN"), Exchange::Nse);
    }

    #[test]
    fn auth_expiry_detected_by_message_substring() {
        assert!(is_auth_expiry(&anyhow::anyhow!("401 invalid access_token")));
        assert!(is_auth_expiry(&anyhow::anyhow!("missing api_key header")));
        assert!(!is_auth_expiry(&anyhow::anyhow!("connection reset")));
    }

    #[tokio::test]
    async fn stub_provider_zero_fills_derivatives_when_both_legs_empty() {
        let cache = cache::HistoricalCandleCache::new_in_memory();
        let provider = ComposedQuoteProvider::new_stub(Arc::new(cache));
        let quotes = provider.get_quote(&["NIFTY24DEC21000CE".to_string()]).await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes["NIFTY24DEC21000CE"].price, 0.0);
    }

    #[tokio::test]
    async fn stub_provider_returns_no_quote_for_equities() {
        let cache = cache::HistoricalCandleCache::new_in_memory();
        let provider = ComposedQuoteProvider::new_stub(Arc::new(cache));
        let quotes = provider.get_quote(&["RELIANCE".to_string()]).await;
        assert!(quotes.is_empty());
    }
}
