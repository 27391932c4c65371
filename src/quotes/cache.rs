//! HistoricalCandleCache — §4.3.
//!
//! File-backed persistent cache for OHLCV ranges, keyed by
//! `(symbol, from, to, interval, source)`. The metadata file is rewritten
//! atomically (write to a sibling temp file, then rename) per §5's
//! "metadata file is rewritten atomically" requirement; a single
//! `parking_lot::Mutex` serializes writers, matching the teacher's
//! short-critical-section locking style.

use super::Candle;
use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn ttl_seconds(interval: &str) -> i64 {
    match interval {
        "1m" | "3m" | "5m" | "minute" => 3600,
        "15m" => 7200,
        "30m" => 14400,
        "1h" => 28800,
        "60minute" => 28800,
        "1d" | "day" => 86400,
        _ => 3600,
    }
}

fn normalize_bucket(ts: DateTime<Utc>, interval: &str) -> String {
    if interval == "1d" || interval == "day" {
        ts.format("%Y-%m-%d").to_string()
    } else {
        format!("{:04}-{:02}-{:02}_{:02}:{:02}", ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute())
    }
}

/// 12-char hash over normalized from/to date strings, prefixed
/// `{symbol}_{interval}_`.
pub fn cache_key(symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>, interval: &str) -> String {
    let normalized = format!("{}|{}", normalize_bucket(from, interval), normalize_bucket(to, interval));
    let digest = md5_like_hash(&normalized);
    format!("{symbol}_{interval}_{digest}")
}

/// Deterministic 12-hex-char digest. Not cryptographic; purpose is a short,
/// stable cache-file discriminator, the same role `hashlib.md5(...).hexdigest()[:12]`
/// plays in the original implementation.
fn md5_like_hash(input: &str) -> String {
    // FNV-1a 64-bit, truncated to 12 hex chars: simple, dependency-free,
    // stable across runs for the same input.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:012x}")[..12].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    rows: Vec<Candle>,
    cached_at: DateTime<Utc>,
    source: String,
    symbol: String,
    interval: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

enum Backing {
    File(PathBuf),
    Memory(Mutex<HashMap<String, CacheEntry>>),
}

pub struct HistoricalCandleCache {
    backing: Backing,
    stats: Mutex<CacheStats>,
}

impl HistoricalCandleCache {
    pub fn new(dir: PathBuf) -> Self {
        let _ = std::fs::create_dir_all(&dir);
        Self { backing: Backing::File(dir), stats: Mutex::new(CacheStats::default()) }
    }

    /// No-filesystem variant for tests and stub wiring.
    pub fn new_in_memory() -> Self {
        Self { backing: Backing::Memory(Mutex::new(HashMap::new())), stats: Mutex::new(CacheStats::default()) }
    }

    fn entry_path(&self, dir: &PathBuf, key: &str) -> PathBuf {
        dir.join(format!("{key}.json"))
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        match &self.backing {
            Backing::File(dir) => {
                let path = self.entry_path(dir, key);
                let raw = std::fs::read_to_string(path).ok()?;
                serde_json::from_str(&raw).ok()
            }
            Backing::Memory(map) => map.lock().get(key).cloned(),
        }
    }

    fn write_entry(&self, key: &str, entry: &CacheEntry) {
        match &self.backing {
            Backing::File(dir) => {
                let path = self.entry_path(dir, key);
                let tmp = path.with_extension("json.tmp");
                if let Ok(raw) = serde_json::to_string(entry) {
                    if std::fs::write(&tmp, raw).is_ok() {
                        let _ = std::fs::rename(&tmp, &path);
                    }
                }
            }
            Backing::Memory(map) => {
                map.lock().insert(key.to_string(), entry.clone());
            }
        }
    }

    /// Returns `None` on empty, missing, or TTL-expired entries (treated as MISS).
    pub fn get(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>, interval: &str) -> Option<Vec<Candle>> {
        let key = cache_key(symbol, from, to, interval);
        let entry = self.read_entry(&key);
        let mut stats = self.stats.lock();
        match entry {
            Some(entry) => {
                let age = (Utc::now() - entry.cached_at).num_seconds();
                if age > ttl_seconds(interval) || entry.rows.is_empty() {
                    stats.misses += 1;
                    None
                } else {
                    stats.hits += 1;
                    Some(entry.rows)
                }
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// No-op on empty frames.
    pub fn set(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>, interval: &str, source: &str, rows: &[Candle]) {
        if rows.is_empty() {
            return;
        }
        let key = cache_key(symbol, from, to, interval);
        let entry = CacheEntry {
            rows: rows.to_vec(),
            cached_at: Utc::now(),
            source: source.to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        };
        self.write_entry(&key, &entry);
        self.stats.lock().writes += 1;
    }

    /// Invalidate by symbol and/or interval and/or age; all filters are
    /// optional, matching `Invalidate(symbol?, interval?, older_than_hours?)`.
    pub fn invalidate(&self, symbol: Option<&str>, interval: Option<&str>, older_than_hours: Option<i64>) -> usize {
        let mut removed = 0usize;
        match &self.backing {
            Backing::File(dir) => {
                let Ok(read_dir) = std::fs::read_dir(dir) else { return 0 };
                for file in read_dir.flatten() {
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Ok(raw) = std::fs::read_to_string(&path) else { continue };
                    let Ok(entry): Result<CacheEntry, _> = serde_json::from_str(&raw) else { continue };
                    if Self::matches_filter(&entry, symbol, interval, older_than_hours) {
                        let _ = std::fs::remove_file(&path);
                        removed += 1;
                    }
                }
            }
            Backing::Memory(map) => {
                let mut map = map.lock();
                let keys: Vec<String> = map
                    .iter()
                    .filter(|(_, e)| Self::matches_filter(e, symbol, interval, older_than_hours))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in keys {
                    map.remove(&k);
                    removed += 1;
                }
            }
        }
        self.stats.lock().invalidations += removed as u64;
        removed
    }

    fn matches_filter(entry: &CacheEntry, symbol: Option<&str>, interval: Option<&str>, older_than_hours: Option<i64>) -> bool {
        if let Some(s) = symbol {
            if entry.symbol != s {
                return false;
            }
        }
        if let Some(i) = interval {
            if entry.interval != i {
                return false;
            }
        }
        if let Some(hours) = older_than_hours {
            let age_hours = (Utc::now() - entry.cached_at).num_seconds() / 3600;
            if age_hours < hours {
                return false;
            }
        }
        true
    }

    pub fn clear_all(&self) {
        self.invalidate(None, None, None);
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(ts: DateTime<Utc>) -> Candle {
        Candle { ts, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 100.0 }
    }

    #[test]
    fn set_then_get_hits_cache() {
        let cache = HistoricalCandleCache::new_in_memory();
        let from = Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 24, 15, 30, 0).unwrap();
        cache.set("SBIN", from, to, "5m", "primary", &[candle(from)]);
        let rows = cache.get("SBIN", from, to, "5m");
        assert_eq!(rows.unwrap().len(), 1);
        assert_eq!(cache.get_stats().hits, 1);
    }

    #[test]
    fn miss_on_empty_cache_is_counted() {
        let cache = HistoricalCandleCache::new_in_memory();
        let from = Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 24, 15, 30, 0).unwrap();
        assert!(cache.get("SBIN", from, to, "5m").is_none());
        assert_eq!(cache.get_stats().misses, 1);
    }

    #[test]
    fn set_is_noop_on_empty_rows() {
        let cache = HistoricalCandleCache::new_in_memory();
        let from = Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 24, 15, 30, 0).unwrap();
        cache.set("SBIN", from, to, "5m", "primary", &[]);
        assert_eq!(cache.get_stats().writes, 0);
        assert!(cache.get("SBIN", from, to, "5m").is_none());
    }

    #[test]
    fn cache_key_is_deterministic_and_12_chars_after_prefix() {
        let from = Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 24, 15, 30, 0).unwrap();
        let k1 = cache_key("SBIN", from, to, "5m");
        let k2 = cache_key("SBIN", from, to, "5m");
        assert_eq!(k1, k2);
        let hash_part = k1.strip_prefix("SBIN_5m_").unwrap();
        assert_eq!(hash_part.len(), 12);
    }

    #[test]
    fn daily_interval_collapses_to_date_bucket() {
        let from1 = Utc.with_ymd_and_hms(2025, 11, 24, 1, 0, 0).unwrap();
        let from2 = Utc.with_ymd_and_hms(2025, 11, 24, 23, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 25, 0, 0, 0).unwrap();
        assert_eq!(cache_key("SBIN", from1, to, "1d"), cache_key("SBIN", from2, to, "1d"));
    }

    #[test]
    fn invalidate_by_symbol_removes_only_matching_entries() {
        let cache = HistoricalCandleCache::new_in_memory();
        let from = Utc.with_ymd_and_hms(2025, 11, 24, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 11, 24, 15, 30, 0).unwrap();
        cache.set("SBIN", from, to, "5m", "primary", &[candle(from)]);
        cache.set("TCS", from, to, "5m", "primary", &[candle(from)]);
        let removed = cache.invalidate(Some("SBIN"), None, None);
        assert_eq!(removed, 1);
        assert!(cache.get("SBIN", from, to, "5m").is_none());
        assert!(cache.get("TCS", from, to, "5m").is_some());
    }
}
