//! Support/resistance levels service — §4.7/§3.
//!
//! Floor-pivot levels over a trailing window keyed by `(symbol, SrScope)`,
//! backed by a two-tier cache: an in-process map for hot reads and a SQLite
//! table (`support_resistance_levels`) so a restart doesn't force every
//! scope to recompute cold. Grounded on
//! `original_source/app/services/support_resistance_service.py`.

use crate::market_clock::ist_date_of;
use crate::models::{SrLevels, SrScope};
use crate::quotes::{Candle, QuoteProvider};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS support_resistance_levels (
    symbol TEXT NOT NULL,
    scope TEXT NOT NULL,
    p REAL NOT NULL,
    r1 REAL NOT NULL,
    r2 REAL NOT NULL,
    r3 REAL NOT NULL,
    s1 REAL NOT NULL,
    s2 REAL NOT NULL,
    s3 REAL NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (symbol, scope)
) WITHOUT ROWID;
";

#[derive(Debug, Clone)]
struct CacheEntry {
    levels: SrLevels,
    computed_at: DateTime<Utc>,
}

/// How long a cached value for a scope may be served without recomputing.
/// Per §3's SRLevels invariant: yearly/monthly levels barely move intraday,
/// weekly levels drift over hours, daily levels should refresh every IST
/// trading session.
fn staleness_threshold(scope: SrScope) -> Duration {
    match scope {
        SrScope::Y => Duration::days(7),
        SrScope::M => Duration::days(1),
        SrScope::W => Duration::hours(6),
        SrScope::D => Duration::hours(1),
    }
}

fn is_stale(entry: &CacheEntry, scope: SrScope, now: DateTime<Utc>) -> bool {
    if scope == SrScope::D && ist_date_of(entry.computed_at) != ist_date_of(now) {
        return true;
    }
    now - entry.computed_at > staleness_threshold(scope)
}

/// Floor pivot formula: `p=(h+l+c)/3`, `r1=2p-l`, `s1=2p-h`,
/// `r2=p+(h-l)`, `s2=p-(h-l)`, `r3=h+2(p-l)`, `s3=l-2(h-p)`.
fn floor_pivot(high: f64, low: f64, close: f64) -> SrLevels {
    let p = (high + low + close) / 3.0;
    SrLevels {
        p,
        r1: 2.0 * p - low,
        r2: p + (high - low),
        r3: high + 2.0 * (p - low),
        s1: 2.0 * p - high,
        s2: p - (high - low),
        s3: low - 2.0 * (high - p),
    }
}

fn pivot_from_window(candles: &[Candle]) -> Option<SrLevels> {
    let high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let close = candles.last()?.close;
    if !high.is_finite() || !low.is_finite() {
        return None;
    }
    Some(floor_pivot(high, low, close))
}

pub struct SupportResistanceService {
    db_path: PathBuf,
    memory: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl SupportResistanceService {
    pub fn new(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { db_path, memory: RwLock::new(HashMap::new()) })
    }

    fn load_from_db(&self, symbol: &str, scope: SrScope) -> Option<CacheEntry> {
        let conn = Connection::open(&self.db_path).ok()?;
        conn.query_row(
            "SELECT p, r1, r2, r3, s1, s2, s3, computed_at FROM support_resistance_levels WHERE symbol = ?1 AND scope = ?2",
            params![symbol, scope.as_str()],
            |row| {
                let computed_at: String = row.get(7)?;
                Ok(CacheEntry {
                    levels: SrLevels {
                        p: row.get(0)?,
                        r1: row.get(1)?,
                        r2: row.get(2)?,
                        r3: row.get(3)?,
                        s1: row.get(4)?,
                        s2: row.get(5)?,
                        s3: row.get(6)?,
                    },
                    computed_at: computed_at.parse().unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .ok()
    }

    fn persist(&self, symbol: &str, scope: SrScope, entry: &CacheEntry) {
        let result = (|| -> anyhow::Result<()> {
            let conn = Connection::open(&self.db_path)?;
            conn.execute(
                "INSERT INTO support_resistance_levels (symbol, scope, p, r1, r2, r3, s1, s2, s3, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(symbol, scope) DO UPDATE SET
                    p=excluded.p, r1=excluded.r1, r2=excluded.r2, r3=excluded.r3,
                    s1=excluded.s1, s2=excluded.s2, s3=excluded.s3, computed_at=excluded.computed_at",
                params![
                    symbol,
                    scope.as_str(),
                    entry.levels.p,
                    entry.levels.r1,
                    entry.levels.r2,
                    entry.levels.r3,
                    entry.levels.s1,
                    entry.levels.s2,
                    entry.levels.s3,
                    entry.computed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, symbol, scope = scope.as_str(), "failed to persist support/resistance levels");
        }
    }

    /// Returns fresh levels for `(symbol, scope)`, recomputing from history
    /// when the cached value is missing or stale. Falls back to the last
    /// known value — memory, then SQLite — if recomputation fails for any
    /// reason (empty candle window, provider error), so a transient data
    /// outage never removes a symbol's levels entirely.
    pub async fn get_levels(
        &self,
        symbol: &str,
        scope: SrScope,
        quote_provider: &Arc<dyn QuoteProvider>,
        now: DateTime<Utc>,
    ) -> Option<SrLevels> {
        let key = (symbol.to_string(), scope.as_str().to_string());
        if let Some(entry) = self.memory.read().get(&key).cloned() {
            if !is_stale(&entry, scope, now) {
                return Some(entry.levels);
            }
        }

        let from = now - Duration::days(scope.window() as i64 * 2);
        let candles = quote_provider.get_historical(symbol, from, now, "1d", true).await;
        let recent: Vec<Candle> = candles.into_iter().rev().take(scope.window()).collect();

        if let Some(levels) = pivot_from_window(&recent) {
            let entry = CacheEntry { levels, computed_at: now };
            self.memory.write().insert(key.clone(), entry.clone());
            self.persist(symbol, scope, &entry);
            return Some(levels);
        }

        if let Some(entry) = self.memory.read().get(&key).cloned() {
            return Some(entry.levels);
        }
        if let Some(entry) = self.load_from_db(symbol, scope) {
            self.memory.write().insert(key, entry.clone());
            return Some(entry.levels);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: DateTime<Utc>, h: f64, l: f64, c: f64) -> Candle {
        Candle { ts, open: c, high: h, low: l, close: c, volume: 0.0 }
    }

    #[test]
    fn floor_pivot_matches_known_formula() {
        let levels = floor_pivot(110.0, 90.0, 100.0);
        assert!((levels.p - 100.0).abs() < 1e-9);
        assert!((levels.r1 - 110.0).abs() < 1e-9);
        assert!((levels.s1 - 90.0).abs() < 1e-9);
        assert!((levels.r2 - 120.0).abs() < 1e-9);
        assert!((levels.s2 - 80.0).abs() < 1e-9);
    }

    #[test]
    fn pivot_from_window_uses_window_high_low_and_last_close() {
        let now = Utc::now();
        let candles = vec![candle(now - Duration::days(2), 105.0, 95.0, 100.0), candle(now - Duration::days(1), 112.0, 98.0, 108.0)];
        let levels = pivot_from_window(&candles).unwrap();
        let expected = floor_pivot(112.0, 95.0, 108.0);
        assert!((levels.p - expected.p).abs() < 1e-9);
    }

    #[test]
    fn pivot_from_window_returns_none_for_empty_window() {
        assert!(pivot_from_window(&[]).is_none());
    }

    #[test]
    fn daily_scope_entry_from_previous_ist_date_is_stale() {
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        let entry = CacheEntry { levels: floor_pivot(1.0, 1.0, 1.0), computed_at: yesterday };
        assert!(is_stale(&entry, SrScope::D, now));
    }

    #[test]
    fn yearly_scope_entry_within_week_is_fresh() {
        let now = Utc::now();
        let entry = CacheEntry { levels: floor_pivot(1.0, 1.0, 1.0), computed_at: now - Duration::hours(12) };
        assert!(!is_stale(&entry, SrScope::Y, now));
    }
}
