//! Strategy-level exit advisory tracker — §4.7.
//!
//! One JSON file per IST trading day, `data/strategy_exits/strategy_exits_{YYYYMMDD}.json`,
//! shaped `{date, exits: [StrategyAdvisory]}`. Appends are deduplicated by an
//! exact match on `(symbol, strategy_id, kind, recommended_exit_price)` so a
//! monitor tick that recomputes the same advisory twice in a row is a no-op.
//! Grounded on `original_source/app/services/strategy_exit_tracker.py`.

use crate::market_clock::ist_date_of;
use crate::models::StrategyAdvisory;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DayFile {
    date: String,
    exits: Vec<StrategyAdvisory>,
}

pub struct StrategyExitTracker {
    data_dir: PathBuf,
}

impl StrategyExitTracker {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join("strategy_exits").join(format!("strategy_exits_{}.json", date.format("%Y%m%d")))
    }

    fn load(&self, date: NaiveDate) -> DayFile {
        let path = self.path_for(date);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "corrupt strategy exits file, starting fresh");
                DayFile { date: date.format("%Y-%m-%d").to_string(), exits: Vec::new() }
            }),
            Err(_) => DayFile { date: date.format("%Y-%m-%d").to_string(), exits: Vec::new() },
        }
    }

    fn save(&self, date: NaiveDate, file: &DayFile) -> anyhow::Result<()> {
        let dir = self.data_dir.join("strategy_exits");
        std::fs::create_dir_all(&dir)?;
        let path = self.path_for(date);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Best-effort append; a write failure is logged and swallowed so a
    /// monitor tick never aborts over disk trouble.
    pub fn record(&self, advisory: &StrategyAdvisory, now: DateTime<Utc>) {
        if let Err(e) = self.try_record(advisory, now) {
            warn!(error = %e, symbol = advisory.symbol, "failed to record strategy exit advisory");
        }
    }

    fn try_record(&self, advisory: &StrategyAdvisory, now: DateTime<Utc>) -> anyhow::Result<()> {
        let date = ist_date_of(now);
        let mut file = self.load(date);
        let duplicate = file.exits.iter().any(|e| {
            e.symbol == advisory.symbol
                && e.strategy_id == advisory.strategy_id
                && e.kind == advisory.kind
                && e.recommended_exit_price == advisory.recommended_exit_price
        });
        if duplicate {
            return Ok(());
        }
        file.exits.push(advisory.clone());
        self.save(date, &file)
    }

    /// Returns the highest-priority matching advisory for `symbol` on
    /// `date`, optionally narrowed by `strategy_id`/`mode`. Ties broken by
    /// most recently generated. Never raises — an IO/parse failure reads as
    /// "no advisory found".
    pub fn get_exit_for(
        &self,
        symbol: &str,
        date: NaiveDate,
        strategy_id: Option<&str>,
        mode: Option<crate::models::Mode>,
    ) -> Option<StrategyAdvisory> {
        let file = self.load(date);
        let mut candidates: Vec<&StrategyAdvisory> = file
            .exits
            .iter()
            .filter(|e| e.symbol == symbol)
            .filter(|e| strategy_id.map_or(true, |id| e.strategy_id == id))
            .filter(|e| mode.map_or(true, |m| e.mode == m))
            .collect();
        candidates.sort_by(|a, b| {
            a.kind.priority_rank().cmp(&b.kind.priority_rank()).then(b.generated_at.cmp(&a.generated_at))
        });
        candidates.into_iter().next().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdvisoryKind, Direction, Mode, Severity};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample(symbol: &str, kind: AdvisoryKind, price: f64, generated_at: DateTime<Utc>) -> StrategyAdvisory {
        StrategyAdvisory {
            id: Uuid::new_v4().to_string(),
            strategy_id: "strategy-1".to_string(),
            kind,
            severity: Severity::Warning,
            is_exit: true,
            symbol: symbol.to_string(),
            direction: Direction::Long,
            price,
            entry_price: price - 1.0,
            initial_sl: None,
            rr_multiple: None,
            indicators: HashMap::new(),
            message: "test advisory".to_string(),
            recommended_actions: Vec::new(),
            recommended_exit_price: Some(price),
            generated_at,
            mode: Mode::Intraday,
            source: "strategy_exit_tracker".to_string(),
            sr_reason: None,
            news_reason: None,
            news_risk_score: None,
        }
    }

    #[test]
    fn duplicate_advisory_is_not_appended_twice() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StrategyExitTracker::new(dir.path());
        let now = Utc::now();
        let advisory = sample("SBIN", AdvisoryKind::PartialProfit, 100.0, now);
        tracker.record(&advisory, now);
        tracker.record(&advisory, now);
        let date = ist_date_of(now);
        let file = tracker.load(date);
        assert_eq!(file.exits.len(), 1);
    }

    #[test]
    fn get_exit_for_prefers_higher_priority_kind() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StrategyExitTracker::new(dir.path());
        let now = Utc::now();
        let low_priority = sample("SBIN", AdvisoryKind::VolumeFade, 101.0, now);
        let high_priority = sample("SBIN", AdvisoryKind::ContextInvalidated, 102.0, now);
        tracker.record(&low_priority, now);
        tracker.record(&high_priority, now);

        let date = ist_date_of(now);
        let best = tracker.get_exit_for("SBIN", date, None, None).unwrap();
        assert_eq!(best.kind, AdvisoryKind::ContextInvalidated);
    }

    #[test]
    fn get_exit_for_returns_none_when_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StrategyExitTracker::new(dir.path());
        let date = ist_date_of(Utc::now());
        assert!(tracker.get_exit_for("UNKNOWN", date, None, None).is_none());
    }
}
