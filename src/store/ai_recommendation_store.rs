//! AiRecommendationStore — SPEC_FULL supplement, grounded on
//! `original_source/app/services/ai_recommendation_store.py`.
//!
//! At most one row per `pick_uuid`; both `apply_scalping_exit` (monitor
//! plane) and `OutcomeEvaluator` upsert it best-effort.

use crate::models::{AiRecommendation, Direction, Mode};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use tracing::warn;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ai_recommendations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pick_uuid TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    mode TEXT NOT NULL,
    direction TEXT NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL,
    pnl_pct REAL,
    evaluated INTEGER NOT NULL DEFAULT 0,
    policy_version TEXT,
    data_source TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

pub struct AiRecommendationStore {
    db_path: PathBuf,
}

impl AiRecommendationStore {
    pub fn new(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { db_path })
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    pub fn insert(&self, pick_uuid: &str, symbol: &str, mode: Mode, direction: Direction, entry_price: f64, data_source: &str) {
        if let Err(e) = self.try_insert(pick_uuid, symbol, mode, direction, entry_price, data_source) {
            warn!(pick_uuid, error = %e, "failed to insert ai recommendation, continuing");
        }
    }

    fn try_insert(&self, pick_uuid: &str, symbol: &str, mode: Mode, direction: Direction, entry_price: f64, data_source: &str) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO ai_recommendations
                (pick_uuid, symbol, mode, direction, entry_price, evaluated, data_source, created_at)
             VALUES (?1,?2,?3,?4,?5,0,?6,?7)",
            params![pick_uuid, symbol, mode.as_str(), direction_str(direction), entry_price, data_source, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Best-effort row update, as required by ScalpingMonitor/OutcomeEvaluator
    /// when a position closes (§4.6a, §4.12). Does not block the caller.
    pub fn record_exit(&self, pick_uuid: &str, exit_price: f64, pnl_pct: f64, policy_version: Option<&str>) {
        if let Err(e) = self.try_record_exit(pick_uuid, exit_price, pnl_pct, policy_version) {
            warn!(pick_uuid, error = %e, "failed to record ai recommendation exit, continuing");
        }
    }

    fn try_record_exit(&self, pick_uuid: &str, exit_price: f64, pnl_pct: f64, policy_version: Option<&str>) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE ai_recommendations SET exit_price = ?1, pnl_pct = ?2, evaluated = 1, policy_version = ?3
             WHERE pick_uuid = ?4",
            params![exit_price, pnl_pct, policy_version, pick_uuid],
        )?;
        Ok(())
    }

    /// Rows excluding the `"Mock Data"` sentinel (§7), for scorecards.
    pub fn evaluated_non_mock(&self, mode: Mode) -> anyhow::Result<Vec<AiRecommendation>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, pick_uuid, symbol, mode, direction, entry_price, exit_price, pnl_pct,
                    evaluated, policy_version, data_source, created_at
             FROM ai_recommendations
             WHERE mode = ?1 AND evaluated = 1 AND data_source != ?2",
        )?;
        let rows = stmt.query_map(params![mode.as_str(), AiRecommendation::MOCK_DATA_SENTINEL], row_to_recommendation)?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

fn row_to_recommendation(row: &rusqlite::Row) -> rusqlite::Result<AiRecommendation> {
    let mode_raw: String = row.get(3)?;
    let direction_raw: String = row.get(4)?;
    Ok(AiRecommendation {
        id: row.get(0)?,
        pick_uuid: row.get(1)?,
        symbol: row.get(2)?,
        mode: mode_from_str(&mode_raw),
        direction: direction_from_raw(&direction_raw),
        entry_price: row.get(5)?,
        exit_price: row.get(6)?,
        pnl_pct: row.get(7)?,
        evaluated: row.get::<_, i64>(8)? != 0,
        policy_version: row.get(9)?,
        data_source: row.get(10)?,
        created_at: row.get::<_, String>(11)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "LONG",
        Direction::Short => "SHORT",
    }
}

fn direction_from_raw(raw: &str) -> Direction {
    match raw {
        "SHORT" => Direction::Short,
        _ => Direction::Long,
    }
}

fn mode_from_str(raw: &str) -> Mode {
    match raw {
        "Scalping" => Mode::Scalping,
        "Swing" => Mode::Swing,
        "Options" => Mode::Options,
        "Futures" => Mode::Futures,
        _ => Mode::Intraday,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluated_non_mock_excludes_sentinel_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = AiRecommendationStore::new(dir.path().join("arise.db")).unwrap();
        store.insert("p1", "SBIN", Mode::Intraday, Direction::Long, 100.0, "broker");
        store.insert("p2", "TCS", Mode::Intraday, Direction::Long, 200.0, AiRecommendation::MOCK_DATA_SENTINEL);
        store.record_exit("p1", 103.0, 3.0, Some("v1"));
        store.record_exit("p2", 205.0, 2.5, Some("v1"));
        let rows = store.evaluated_non_mock(Mode::Intraday).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pick_uuid, "p1");
    }

    #[test]
    fn insert_is_unique_per_pick_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = AiRecommendationStore::new(dir.path().join("arise.db")).unwrap();
        store.insert("p1", "SBIN", Mode::Intraday, Direction::Long, 100.0, "broker");
        store.insert("p1", "SBIN", Mode::Intraday, Direction::Long, 999.0, "broker");
        let conn = Connection::open(dir.path().join("arise.db")).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ai_recommendations", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
