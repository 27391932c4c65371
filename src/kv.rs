//! KV store boundary (§6): cache + locks + pub data.
//!
//! `REDIS_URL` is read by `Config` for parity with the deployment described
//! in §6, but this crate ships only the in-process implementation — an
//! unset or unreachable Redis falls back to it, matching §4.1's "if KV/lock
//! is unavailable, locking is bypassed (sentinel)". The teacher's
//! `parking_lot::RwLock<HashMap<..>>` AppState pattern is reused directly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Returned by `acquire_lock` when locking is disabled (store unavailable).
pub const DISABLED_SENTINEL: &str = "__locking_disabled__";

struct Entry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

struct LockEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn set_json(&self, key: &str, value: serde_json::Value, ex_seconds: Option<i64>);
    async fn get_json(&self, key: &str) -> Option<serde_json::Value>;
    async fn acquire_lock(&self, key: &str, ttl_seconds: i64) -> Option<String>;
    async fn release_lock(&self, key: &str, token: &str) -> bool;
}

/// In-process KV store: one `Mutex<HashMap<..>>` per concern, matching the
/// teacher's short-critical-section `parking_lot` usage throughout
/// `AppState`. Expired entries are swept lazily on read.
pub struct InProcessKvStore {
    values: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InProcessKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { values: Mutex::new(HashMap::new()), locks: Mutex::new(HashMap::new()) })
    }
}

impl Default for InProcessKvStore {
    fn default() -> Self {
        Self { values: Mutex::new(HashMap::new()), locks: Mutex::new(HashMap::new()) }
    }
}

#[async_trait::async_trait]
impl KvStore for InProcessKvStore {
    async fn set_json(&self, key: &str, value: serde_json::Value, ex_seconds: Option<i64>) {
        let expires_at = ex_seconds.map(|s| Utc::now() + chrono::Duration::seconds(s));
        self.values.lock().insert(key.to_string(), Entry { value, expires_at });
    }

    async fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        let mut values = self.values.lock();
        match values.get(key) {
            Some(entry) => {
                if entry.expires_at.map(|exp| exp <= Utc::now()).unwrap_or(false) {
                    values.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }

    async fn acquire_lock(&self, key: &str, ttl_seconds: i64) -> Option<String> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return None;
            }
        }
        let token = Uuid::new_v4().to_string();
        locks.insert(
            key.to_string(),
            LockEntry { token: token.clone(), expires_at: now + chrono::Duration::seconds(ttl_seconds) },
        );
        Some(token)
    }

    async fn release_lock(&self, key: &str, token: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(existing) if existing.token == token => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }
}
