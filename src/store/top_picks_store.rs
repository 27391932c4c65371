//! TopPicksStore — §4.11. Append-only run history with a retention sweep.
//!
//! Grounded on `original_source/app/services/top_picks_store.py`: run_id
//! format `"{universe}:{mode}:{generated_at_utc}"`, `GetLatestRunFor` filters
//! to `picks_count>0`, and a retention cleanup runs on every insert.

use crate::models::{Mode, RunTrigger, TopPicksRun};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use tracing::warn;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS top_picks_runs (
    run_id TEXT PRIMARY KEY,
    universe TEXT NOT NULL,
    mode TEXT NOT NULL,
    generated_at_utc TEXT NOT NULL,
    trigger_label TEXT NOT NULL,
    total_analyzed INTEGER NOT NULL,
    filtered_count INTEGER NOT NULL,
    picks_count INTEGER NOT NULL,
    elapsed_sec REAL NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_top_picks_runs_universe_mode
    ON top_picks_runs(universe, mode, generated_at_utc DESC);
"#;

pub struct TopPicksStore {
    db_path: PathBuf,
    retention_days: u32,
}

impl TopPicksStore {
    pub fn new(db_path: impl Into<PathBuf>, retention_days: u32) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { db_path, retention_days })
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    pub fn run_id_for(universe: &str, mode: Mode, generated_at_utc: chrono::DateTime<chrono::Utc>) -> String {
        format!("{universe}:{}:{}", mode.as_str(), generated_at_utc.to_rfc3339())
    }

    pub fn store_run(&self, run: &TopPicksRun) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO top_picks_runs (
                run_id, universe, mode, generated_at_utc, trigger_label, total_analyzed,
                filtered_count, picks_count, elapsed_sec, payload
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                run.run_id,
                run.universe,
                run.mode.as_str(),
                run.generated_at_utc.to_rfc3339(),
                serde_json::to_string(&run.trigger)?,
                run.total_analyzed,
                run.filtered_count,
                run.picks_count,
                run.elapsed_sec,
                run.payload.to_string(),
            ],
        )?;
        if let Err(e) = self.cleanup_retention(&conn) {
            warn!(error = %e, "top picks retention cleanup failed, continuing");
        }
        Ok(())
    }

    fn cleanup_retention(&self, conn: &Connection) -> anyhow::Result<()> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.retention_days as i64);
        conn.execute("DELETE FROM top_picks_runs WHERE generated_at_utc < ?1", params![cutoff.to_rfc3339()])?;
        Ok(())
    }

    pub fn get_latest_run_for(&self, universe: &str, mode: Mode) -> anyhow::Result<Option<TopPicksRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, universe, mode, generated_at_utc, trigger_label, total_analyzed,
                    filtered_count, picks_count, elapsed_sec, payload
             FROM top_picks_runs
             WHERE universe = ?1 AND mode = ?2 AND picks_count > 0
             ORDER BY generated_at_utc DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![universe, mode.as_str()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_run(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_run_by_id(&self, run_id: &str) -> anyhow::Result<Option<TopPicksRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, universe, mode, generated_at_utc, trigger_label, total_analyzed,
                    filtered_count, picks_count, elapsed_sec, payload
             FROM top_picks_runs WHERE run_id = ?1",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_run(row)?))
        } else {
            Ok(None)
        }
    }

    /// `limit` is clamped to 5000 per §4.11.
    pub fn query_runs(&self, universe: Option<&str>, mode: Option<Mode>, limit: usize) -> anyhow::Result<Vec<TopPicksRun>> {
        let limit = limit.min(5000);
        let conn = self.connect()?;
        let mut sql = "SELECT run_id, universe, mode, generated_at_utc, trigger_label, total_analyzed,
                    filtered_count, picks_count, elapsed_sec, payload FROM top_picks_runs WHERE 1=1"
            .to_string();
        if universe.is_some() {
            sql.push_str(" AND universe = ?1");
        }
        if mode.is_some() {
            sql.push_str(if universe.is_some() { " AND mode = ?2" } else { " AND mode = ?1" });
        }
        sql.push_str(" ORDER BY generated_at_utc DESC LIMIT ?");
        let limit_placeholder = if universe.is_some() && mode.is_some() {
            "?3"
        } else if universe.is_some() || mode.is_some() {
            "?2"
        } else {
            "?1"
        };
        let sql = sql.replace("LIMIT ?", &format!("LIMIT {limit_placeholder}"));
        let mut stmt = conn.prepare(&sql)?;

        let mode_str = mode.map(|m| m.as_str().to_string());
        let rows = match (universe, &mode_str) {
            (Some(u), Some(m)) => stmt.query_map(params![u, m, limit], row_to_run)?.collect::<Vec<_>>(),
            (Some(u), None) => stmt.query_map(params![u, limit], row_to_run)?.collect::<Vec<_>>(),
            (None, Some(m)) => stmt.query_map(params![m, limit], row_to_run)?.collect::<Vec<_>>(),
            (None, None) => stmt.query_map(params![limit], row_to_run)?.collect::<Vec<_>>(),
        };
        Ok(rows.into_iter().filter_map(|r| r.ok()).collect())
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<TopPicksRun> {
    let mode_raw: String = row.get(2)?;
    let trigger_raw: String = row.get(4)?;
    let payload_raw: String = row.get(9)?;
    Ok(TopPicksRun {
        run_id: row.get(0)?,
        universe: row.get(1)?,
        mode: mode_from_str(&mode_raw),
        generated_at_utc: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
        trigger: serde_json::from_str(&trigger_raw).unwrap_or(RunTrigger::Manual),
        total_analyzed: row.get(5)?,
        filtered_count: row.get(6)?,
        picks_count: row.get(7)?,
        elapsed_sec: row.get(8)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
    })
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
    use chrono::Utc;

    fn sample_run(universe: &str, mode: Mode, picks_count: usize, generated_at: chrono::DateTime<Utc>) -> TopPicksRun {
        TopPicksRun {
            run_id: TopPicksStore::run_id_for(universe, mode, generated_at),
            universe: universe.to_string(),
            mode,
            generated_at_utc: generated_at,
            trigger: RunTrigger::Hourly,
            total_analyzed: 50,
            filtered_count: 10,
            picks_count,
            elapsed_sec: 1.2,
            payload: serde_json::json!({"picks": []}),
        }
    }

    #[test]
    fn latest_run_for_ignores_empty_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopPicksStore::new(dir.path().join("arise.db"), 90).unwrap();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = Utc::now();
        store.store_run(&sample_run("nifty50", Mode::Intraday, 0, t1)).unwrap();
        store.store_run(&sample_run("nifty50", Mode::Intraday, 5, t0)).unwrap();
        let latest = store.get_latest_run_for("nifty50", Mode::Intraday).unwrap().unwrap();
        assert_eq!(latest.picks_count, 5);
    }

    #[test]
    fn get_run_by_id_returns_canonical_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopPicksStore::new(dir.path().join("arise.db"), 90).unwrap();
        let run = sample_run("nifty50", Mode::Intraday, 3, Utc::now());
        store.store_run(&run).unwrap();
        let fetched = store.get_run_by_id(&run.run_id).unwrap().unwrap();
        assert_eq!(fetched.payload, run.payload);
    }

    #[test]
    fn query_runs_clamps_limit_to_5000() {
        let dir = tempfile::tempdir().unwrap();
        let store = TopPicksStore::new(dir.path().join("arise.db"), 90).unwrap();
        store.store_run(&sample_run("nifty50", Mode::Intraday, 1, Utc::now())).unwrap();
        let runs = store.query_runs(Some("nifty50"), Some(Mode::Intraday), 10_000).unwrap();
        assert_eq!(runs.len(), 1);
    }
}
