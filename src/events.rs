//! Structured event logger — §4.9.
//!
//! Appends JSONL events to `data/events/{event_type}/YYYY/MM/DD/events.jsonl`
//! through a bounded queue drained by a single writer task, so a slow disk
//! never blocks the caller. Grounded on `original_source/app/services/event_logger.py`'s
//! `_is_event_enabled` gating and queue-with-drop-newest overflow policy.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
struct Event {
    id: String,
    event_type: String,
    source: String,
    ts: chrono::DateTime<Utc>,
    payload: serde_json::Value,
}

/// Per-event-type enable/disable map plus a global on/off switch.
///
/// Resolution order mirrors `_is_event_enabled`: global off always wins;
/// an empty type map defaults everything to enabled; an explicit entry (or
/// the `"*"` wildcard) for the type wins; otherwise default-enabled.
#[derive(Debug, Clone, Default)]
pub struct EventLoggingConfig {
    pub global_enabled: bool,
    pub per_type: HashMap<String, bool>,
}

impl EventLoggingConfig {
    pub fn enabled_by_default() -> Self {
        Self { global_enabled: true, per_type: HashMap::new() }
    }

    fn is_enabled(&self, event_type: &str) -> bool {
        if !self.global_enabled {
            return false;
        }
        if self.per_type.is_empty() {
            return true;
        }
        if let Some(v) = self.per_type.get(event_type) {
            return *v;
        }
        if let Some(v) = self.per_type.get("*") {
            return *v;
        }
        true
    }
}

/// Handle shared across the process; `log_event` is cheap and non-blocking.
pub struct EventLogger {
    sender: mpsc::Sender<Event>,
    config: Arc<RwLock<EventLoggingConfig>>,
}

impl EventLogger {
    /// Spawns the single writer task rooted at `data_dir/events`.
    pub fn spawn(data_dir: PathBuf, config: EventLoggingConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let config = Arc::new(RwLock::new(config));
        tokio::spawn(writer_loop(data_dir, receiver));
        Arc::new(Self { sender, config })
    }

    pub fn set_config(&self, config: EventLoggingConfig) {
        *self.config.write() = config;
    }

    /// Enqueues an event if its type is enabled; drops newest (with a log
    /// line) if the queue is full rather than blocking the caller.
    pub fn log_event(&self, event_type: &str, source: &str, payload: serde_json::Value) {
        if !self.config.read().is_enabled(event_type) {
            return;
        }
        let event = Event {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            ts: Utc::now(),
            payload,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.sender.try_send(event) {
            warn!(event_type, "event queue full, dropping newest event");
        }
    }
}

async fn writer_loop(data_dir: PathBuf, mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        if let Err(e) = write_event(&data_dir, &event) {
            error!(error = %e, event_type = event.event_type, "failed to persist event, dropping");
        }
    }
}

fn write_event(data_dir: &std::path::Path, event: &Event) -> std::io::Result<()> {
    use chrono::Datelike;
    let dir = data_dir
        .join("events")
        .join(&event.event_type)
        .join(format!("{:04}", event.ts.year()))
        .join(format!("{:02}", event.ts.month()))
        .join(format!("{:02}", event.ts.day()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("events.jsonl");
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event).unwrap_or_default();
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_off_disables_every_type() {
        let cfg = EventLoggingConfig { global_enabled: false, per_type: HashMap::new() };
        assert!(!cfg.is_enabled("tick"));
    }

    #[test]
    fn empty_type_map_defaults_enabled() {
        let cfg = EventLoggingConfig::enabled_by_default();
        assert!(cfg.is_enabled("top_picks_update"));
    }

    #[test]
    fn explicit_entry_overrides_default() {
        let mut per_type = HashMap::new();
        per_type.insert("tick".to_string(), false);
        let cfg = EventLoggingConfig { global_enabled: true, per_type };
        assert!(!cfg.is_enabled("tick"));
        assert!(cfg.is_enabled("top_picks_update"));
    }

    #[test]
    fn wildcard_entry_applies_when_no_explicit_entry() {
        let mut per_type = HashMap::new();
        per_type.insert("*".to_string(), false);
        per_type.insert("tick".to_string(), true);
        let cfg = EventLoggingConfig { global_enabled: true, per_type };
        assert!(cfg.is_enabled("tick"));
        assert!(!cfg.is_enabled("scalping_monitor_update"));
    }

    #[tokio::test]
    async fn logged_event_is_written_to_daily_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::spawn(dir.path().to_path_buf(), EventLoggingConfig::enabled_by_default());
        logger.log_event("tick", "ws_hub", serde_json::json!({"symbol": "SBIN"}));
        // give the writer task a chance to drain the channel
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let now = Utc::now();
        use chrono::Datelike;
        let path = dir
            .path()
            .join("events")
            .join("tick")
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()))
            .join("events.jsonl");
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("SBIN"));
    }

    #[test]
    fn disabled_event_type_is_never_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let mut per_type = HashMap::new();
        per_type.insert("tick".to_string(), false);
        let logger = EventLogger::spawn(dir.path().to_path_buf(), EventLoggingConfig { global_enabled: true, per_type });
        logger.log_event("tick", "ws_hub", serde_json::json!({}));
        // no panic, no queue growth; nothing to assert on the filesystem side
        // since the event was never enqueued at all.
        drop(logger);
    }
}
