//! PickEventLog & OutcomeEvaluator persistence — §4.12.
//!
//! Append-only PickEvent/AgentContribution rows plus upserted PickOutcome
//! rows. Writes are best-effort: any failure is logged and swallowed so the
//! trading flow is never interrupted (§7 "Persistence failure").

use crate::models::{AgentContribution, Direction, Mode, OutcomeLabel, PickEvent, PickOutcome};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::warn;

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "LONG",
        Direction::Short => "SHORT",
    }
}

fn direction_from_str(raw: &str) -> Direction {
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

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS pick_events (
    pick_uuid TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    source TEXT NOT NULL,
    mode TEXT NOT NULL,
    signal_ts TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    signal_price REAL NOT NULL,
    recommended_entry REAL,
    recommended_target REAL,
    recommended_stop REAL,
    time_horizon TEXT,
    blend_score REAL NOT NULL,
    recommendation TEXT NOT NULL,
    confidence TEXT NOT NULL,
    regime_bucket TEXT NOT NULL,
    vol_bucket TEXT NOT NULL,
    user_risk_bucket TEXT NOT NULL,
    universe TEXT NOT NULL,
    extra_context TEXT NOT NULL,
    run_id TEXT NOT NULL,
    inserted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_pick_events_trade_date ON pick_events(trade_date, mode);
CREATE INDEX IF NOT EXISTS idx_pick_events_run_id ON pick_events(run_id);

CREATE TABLE IF NOT EXISTS agent_contributions (
    pick_uuid TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    score REAL,
    confidence TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (pick_uuid, agent_name)
);

CREATE TABLE IF NOT EXISTS pick_outcomes (
    pick_uuid TEXT NOT NULL,
    evaluation_horizon TEXT NOT NULL,
    horizon_end_ts TEXT NOT NULL,
    price_close REAL NOT NULL,
    price_high REAL NOT NULL,
    price_low REAL NOT NULL,
    ret_close_pct REAL NOT NULL,
    max_runup_pct REAL NOT NULL,
    max_drawdown_pct REAL NOT NULL,
    benchmark_symbol TEXT,
    benchmark_ret_pct REAL,
    hit_target INTEGER NOT NULL,
    hit_stop INTEGER NOT NULL,
    outcome_label TEXT NOT NULL,
    notes TEXT NOT NULL,
    PRIMARY KEY (pick_uuid, evaluation_horizon)
);
"#;

pub struct PickEventLog {
    db_path: PathBuf,
}

impl PickEventLog {
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

    /// Best-effort: write together with a run's AgentContributions inside one
    /// transaction; unique on `pick_uuid` by construction (PickEvent::new
    /// mints a fresh UUID every call).
    pub fn log_pick(&self, pick: &PickEvent, contributions: &[AgentContribution]) {
        if let Err(e) = self.try_log_pick(pick, contributions) {
            warn!(pick_uuid = %pick.pick_uuid, error = %e, "failed to persist pick event, continuing");
        }
    }

    fn try_log_pick(&self, pick: &PickEvent, contributions: &[AgentContribution]) -> anyhow::Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO pick_events (
                pick_uuid, symbol, direction, source, mode, signal_ts, trade_date,
                signal_price, recommended_entry, recommended_target, recommended_stop,
                time_horizon, blend_score, recommendation, confidence, regime_bucket,
                vol_bucket, user_risk_bucket, universe, extra_context, run_id
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            params![
                pick.pick_uuid,
                pick.symbol,
                direction_str(pick.direction),
                pick.source,
                pick.mode.as_str(),
                pick.signal_ts.to_rfc3339(),
                pick.trade_date.to_string(),
                pick.signal_price,
                pick.recommended_entry,
                pick.recommended_target,
                pick.recommended_stop,
                pick.time_horizon,
                pick.blend_score,
                pick.recommendation,
                pick.confidence,
                pick.regime_bucket,
                pick.vol_bucket,
                pick.user_risk_bucket,
                pick.universe,
                serde_json::to_string(&pick.extra_context)?,
                pick.run_id,
            ],
        )?;
        for contribution in contributions {
            tx.execute(
                "INSERT OR REPLACE INTO agent_contributions (pick_uuid, agent_name, score, confidence, metadata)
                 VALUES (?1,?2,?3,?4,?5)",
                params![
                    contribution.pick_uuid,
                    contribution.agent_name,
                    contribution.score,
                    contribution.confidence,
                    serde_json::to_string(&contribution.metadata)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Idempotent on `(pick_uuid, evaluation_horizon)`: replaying the same
    /// outcome twice yields an identical row (invariant #3).
    pub fn upsert_outcome(&self, outcome: &PickOutcome) {
        if let Err(e) = self.try_upsert_outcome(outcome) {
            warn!(pick_uuid = %outcome.pick_uuid, error = %e, "failed to persist pick outcome, continuing");
        }
    }

    fn try_upsert_outcome(&self, outcome: &PickOutcome) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO pick_outcomes (
                pick_uuid, evaluation_horizon, horizon_end_ts, price_close, price_high,
                price_low, ret_close_pct, max_runup_pct, max_drawdown_pct, benchmark_symbol,
                benchmark_ret_pct, hit_target, hit_stop, outcome_label, notes
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
            ON CONFLICT(pick_uuid, evaluation_horizon) DO UPDATE SET
                horizon_end_ts=excluded.horizon_end_ts,
                price_close=excluded.price_close,
                price_high=excluded.price_high,
                price_low=excluded.price_low,
                ret_close_pct=excluded.ret_close_pct,
                max_runup_pct=excluded.max_runup_pct,
                max_drawdown_pct=excluded.max_drawdown_pct,
                benchmark_symbol=excluded.benchmark_symbol,
                benchmark_ret_pct=excluded.benchmark_ret_pct,
                hit_target=excluded.hit_target,
                hit_stop=excluded.hit_stop,
                outcome_label=excluded.outcome_label,
                notes=excluded.notes",
            params![
                outcome.pick_uuid,
                outcome.evaluation_horizon,
                outcome.horizon_end_ts.to_rfc3339(),
                outcome.price_close,
                outcome.price_high,
                outcome.price_low,
                outcome.ret_close_pct,
                outcome.max_runup_pct,
                outcome.max_drawdown_pct,
                outcome.benchmark_symbol,
                outcome.benchmark_ret_pct,
                outcome.hit_target,
                outcome.hit_stop,
                serde_json::to_string(&outcome.outcome_label)?,
                outcome.notes.to_string(),
            ],
        )?;
        Ok(())
    }

    /// PickEvents for a given IST trade date and mode that have no matching
    /// PickOutcome row for `evaluation_horizon` yet (used by OutcomeEvaluator).
    pub fn picks_without_outcome(&self, trade_date: &str, mode: &str, evaluation_horizon: &str) -> anyhow::Result<Vec<PickEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT pick_uuid, symbol, direction, source, mode, signal_ts, trade_date,
                    signal_price, recommended_entry, recommended_target, recommended_stop,
                    time_horizon, blend_score, recommendation, confidence, regime_bucket,
                    vol_bucket, user_risk_bucket, universe, extra_context, run_id
             FROM pick_events
             WHERE trade_date = ?1 AND mode = ?2
               AND pick_uuid NOT IN (
                   SELECT pick_uuid FROM pick_outcomes WHERE evaluation_horizon = ?3
               )",
        )?;
        let rows = stmt.query_map(params![trade_date, mode, evaluation_horizon], |row| {
            let direction_raw: String = row.get(2)?;
            let mode_raw: String = row.get(4)?;
            let extra_raw: String = row.get(19)?;
            Ok(PickEvent {
                pick_uuid: row.get(0)?,
                symbol: row.get(1)?,
                direction: direction_from_str(&direction_raw),
                source: row.get(3)?,
                mode: mode_from_str(&mode_raw),
                signal_ts: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
                trade_date: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| chrono::Utc::now().date_naive()),
                signal_price: row.get(7)?,
                recommended_entry: row.get(8)?,
                recommended_target: row.get(9)?,
                recommended_stop: row.get(10)?,
                time_horizon: row.get(11)?,
                blend_score: row.get(12)?,
                recommendation: row.get(13)?,
                confidence: row.get(14)?,
                regime_bucket: row.get(15)?,
                vol_bucket: row.get(16)?,
                user_risk_bucket: row.get(17)?,
                universe: row.get(18)?,
                extra_context: serde_json::from_str(&extra_raw).unwrap_or_default(),
                run_id: row.get(20)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

pub fn path_or_default(path: &Path) -> PathBuf {
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExtraContext, Mode};
    use chrono::Utc;

    fn temp_log() -> (PickEventLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = PickEventLog::new(dir.path().join("arise.db")).unwrap();
        (log, dir)
    }

    #[test]
    fn logged_pick_is_persisted_and_findable_without_outcome() {
        let (log, _dir) = temp_log();
        let pick = PickEvent::new(
            "SBIN", Direction::Long, "engine", Mode::Intraday, Utc::now(), 625.5, 72.0,
            "Buy", "High", "nifty50", ExtraContext::default(), "run-1",
        );
        log.log_pick(&pick, &[]);
        let trade_date = pick.trade_date.to_string();
        let found = log.picks_without_outcome(&trade_date, "Intraday", "EOD").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pick_uuid, pick.pick_uuid);
    }

    #[test]
    fn upsert_outcome_twice_with_same_inputs_is_idempotent() {
        let (log, _dir) = temp_log();
        let pick = PickEvent::new(
            "SBIN", Direction::Long, "engine", Mode::Intraday, Utc::now(), 100.0, 72.0,
            "Buy", "High", "nifty50", ExtraContext::default(), "run-1",
        );
        log.log_pick(&pick, &[]);
        let outcome = PickOutcome {
            pick_uuid: pick.pick_uuid.clone(),
            evaluation_horizon: "EOD".to_string(),
            horizon_end_ts: Utc::now(),
            price_close: 103.0,
            price_high: 105.0,
            price_low: 99.5,
            ret_close_pct: 3.0,
            max_runup_pct: 5.0,
            max_drawdown_pct: -0.5,
            benchmark_symbol: Some("NIFTY".to_string()),
            benchmark_ret_pct: Some(0.5),
            hit_target: false,
            hit_stop: false,
            outcome_label: OutcomeLabel::Win,
            notes: serde_json::json!({"capture_ratio": 0.6}),
        };
        log.upsert_outcome(&outcome);
        log.upsert_outcome(&outcome);
        let remaining = log.picks_without_outcome(&pick.trade_date.to_string(), "Intraday", "EOD").unwrap();
        assert!(remaining.is_empty());
    }
}
