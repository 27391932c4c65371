//! ScalpingMonitor — §4.6a.
//!
//! Every 5 minutes during the cash-open or EOD window, walks the scalping
//! positions derived from recent Top Picks runs and evaluates exits in
//! strict priority order. Grounded on
//! `original_source/app/services/scalping_exit_tracker.py` and
//! `scalping_monitor_scheduler.py`.

use crate::engine::PickPayload;
use crate::market_clock::{self, ist_date_of};
use crate::models::{Direction, ExitReason, Mode, OutcomeLabel, PickOutcome, ScalpingExit};
use crate::store::ai_recommendation_store::AiRecommendationStore;
use crate::store::pick_event_log::PickEventLog;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Only positions derived within this lookback carry an active scalping
/// exit strategy worth monitoring (§4.6a).
pub const LOOKBACK: Duration = Duration::hours(2);

#[derive(Debug, Clone)]
pub struct ScalpingPosition {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub target_price: f64,
    pub stop_loss_price: f64,
    pub max_hold_mins: u32,
    pub recommendation: String,
    pub mode: Mode,
}

fn direction_sign(direction: Direction) -> f64 {
    if direction == Direction::Long {
        1.0
    } else {
        -1.0
    }
}

/// Derives monitorable scalping positions from a run's picks: only
/// Scalping-mode picks within `LOOKBACK` whose `exit_strategy` resolved a
/// stop and target price.
pub fn derive_positions(picks: &[PickPayload], now: DateTime<Utc>) -> Vec<ScalpingPosition> {
    picks
        .iter()
        .filter(|p| p.mode == Mode::Scalping && now - p.entry_time <= LOOKBACK)
        .filter_map(|p| {
            let stop = p.stop_price?;
            let target = p.target_price?;
            Some(ScalpingPosition {
                symbol: p.symbol.clone(),
                direction: p.direction,
                entry_price: p.entry_price,
                entry_time: p.entry_time,
                target_price: target,
                stop_loss_price: stop,
                max_hold_mins: 60,
                recommendation: p.recommendation.clone(),
                mode: p.mode,
            })
        })
        .collect()
}

/// Priority: TARGET_HIT → STOP_LOSS → TIME_EXIT → TRAILING_STOP →
/// EOD_AUTO_EXIT. The first condition that fires wins; `exit_price` is
/// clamped to the configured target/stop when those fire.
///
/// `best_price_since_entry` is the most favorable price observed since
/// entry; the trailing check is a no-op when the caller has no such series
/// to offer (state is not persisted across monitor ticks in this build).
pub fn evaluate_exit(position: &ScalpingPosition, current_price: f64, now: DateTime<Utc>, best_price_since_entry: Option<f64>) -> Option<(ExitReason, f64)> {
    let sign = direction_sign(position.direction);

    let target_hit = sign * (current_price - position.target_price) >= 0.0;
    if target_hit {
        return Some((ExitReason::TargetHit, position.target_price));
    }

    let stop_hit = sign * (current_price - position.stop_loss_price) <= 0.0;
    if stop_hit {
        return Some((ExitReason::StopLoss, position.stop_loss_price));
    }

    let elapsed_mins = (now - position.entry_time).num_seconds() as f64 / 60.0;
    if elapsed_mins >= position.max_hold_mins as f64 {
        return Some((ExitReason::TimeExit, current_price));
    }

    if let Some(best) = best_price_since_entry {
        let activation_dist = position.entry_price * 0.01;
        let favorable = sign * (best - position.entry_price);
        if favorable >= activation_dist {
            let trail_distance = activation_dist * 0.5;
            let trailing_stop = best - sign * trail_distance;
            if sign * (current_price - trailing_stop) <= 0.0 {
                return Some((ExitReason::TrailingStop, trailing_stop));
            }
        }
    }

    if market_clock::is_eod_window(now) {
        return Some((ExitReason::EodAutoExit, current_price));
    }

    None
}

fn return_pct(direction: Direction, entry_price: f64, exit_price: f64) -> f64 {
    direction_sign(direction) * (exit_price - entry_price) / entry_price * 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DayFile {
    date: String,
    exits: Vec<ScalpingExit>,
}

/// Per-IST-day append log of realized scalping exits, deduplicated by
/// `(symbol, entry_time)`.
pub struct ScalpingExitTracker {
    data_dir: PathBuf,
}

impl ScalpingExitTracker {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join("scalping_exits").join(format!("exits_{}.json", date.format("%Y%m%d")))
    }

    fn load(&self, date: NaiveDate) -> DayFile {
        let path = self.path_for(date);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| DayFile { date: date.format("%Y-%m-%d").to_string(), exits: Vec::new() })
    }

    fn save(&self, date: NaiveDate, file: &DayFile) -> anyhow::Result<()> {
        let dir = self.data_dir.join("scalping_exits");
        std::fs::create_dir_all(&dir)?;
        let path = self.path_for(date);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Best-effort, deduplicated append; returns `true` if a new row was
    /// written (callers use this to decide whether to chain the
    /// AiRecommendationStore/PickOutcome hooks).
    pub fn record(&self, exit: &ScalpingExit) -> bool {
        match self.try_record(exit) {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, symbol = exit.symbol, "failed to record scalping exit");
                false
            }
        }
    }

    fn try_record(&self, exit: &ScalpingExit) -> anyhow::Result<bool> {
        let date = ist_date_of(exit.exit_time);
        let mut file = self.load(date);
        let duplicate = file.exits.iter().any(|e| e.symbol == exit.symbol && e.entry_time == exit.entry_time);
        if duplicate {
            return Ok(false);
        }
        file.exits.push(exit.clone());
        self.save(date, &file)?;
        Ok(true)
    }
}

/// One monitor tick: evaluates every derived position, records realized
/// exits, and best-effort updates the AI recommendation row and matching
/// PickOutcome row (nearest `signal_price` for the symbol/trade-date/mode,
/// per §4.6a).
pub fn run_tick(
    positions: &[ScalpingPosition],
    current_prices: &std::collections::HashMap<String, f64>,
    now: DateTime<Utc>,
    tracker: &ScalpingExitTracker,
    ai_recommendation_store: &AiRecommendationStore,
    pick_event_log: &PickEventLog,
) {
    for position in positions {
        let Some(&price) = current_prices.get(&position.symbol) else { continue };
        let Some((reason, exit_price)) = evaluate_exit(position, price, now, None) else { continue };

        let ret = return_pct(position.direction, position.entry_price, exit_price);
        let exit = ScalpingExit {
            symbol: position.symbol.clone(),
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: now,
            exit_price,
            exit_reason: reason,
            return_pct: ret,
            hold_duration_mins: (now - position.entry_time).num_seconds() as f64 / 60.0,
            mode: position.mode,
            recommendation: position.recommendation.clone(),
        };

        if !tracker.record(&exit) {
            continue;
        }

        let trade_date = ist_date_of(now);
        if let Ok(candidates) = pick_event_log.picks_without_outcome(&trade_date.to_string(), position.mode.as_str(), "scalping") {
            if let Some(nearest) = candidates
                .iter()
                .filter(|p| p.symbol == position.symbol)
                .min_by(|a, b| (a.signal_price - position.entry_price).abs().partial_cmp(&(b.signal_price - position.entry_price).abs()).unwrap())
            {
                let outcome = PickOutcome {
                    pick_uuid: nearest.pick_uuid.clone(),
                    evaluation_horizon: "scalping".to_string(),
                    horizon_end_ts: now,
                    price_close: exit_price,
                    price_high: exit_price.max(position.entry_price),
                    price_low: exit_price.min(position.entry_price),
                    ret_close_pct: ret,
                    max_runup_pct: ret.max(0.0),
                    max_drawdown_pct: ret.min(0.0),
                    benchmark_symbol: None,
                    benchmark_ret_pct: None,
                    hit_target: reason == ExitReason::TargetHit,
                    hit_stop: reason == ExitReason::StopLoss,
                    outcome_label: OutcomeLabel::from_ret_pct(ret),
                    notes: serde_json::json!({ "exit_reason": reason.as_str() }),
                };
                pick_event_log.upsert_outcome(&outcome);
                ai_recommendation_store.record_exit(&nearest.pick_uuid, exit_price, ret, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> ScalpingPosition {
        ScalpingPosition {
            symbol: "SBIN".to_string(),
            direction: Direction::Long,
            entry_price: 625.50,
            entry_time: Utc::now(),
            target_price: 628.63,
            stop_loss_price: 623.00,
            max_hold_mins: 60,
            recommendation: "Buy".to_string(),
            mode: Mode::Scalping,
        }
    }

    #[test]
    fn target_hit_clamps_exit_price_to_target() {
        let p = position();
        let now = p.entry_time + Duration::minutes(25);
        let (reason, exit_price) = evaluate_exit(&p, 629.10, now, None).unwrap();
        assert_eq!(reason, ExitReason::TargetHit);
        assert!((exit_price - 628.63).abs() < 1e-9);
        let ret = return_pct(p.direction, p.entry_price, exit_price);
        assert!((ret - 0.50).abs() < 0.01);
    }

    #[test]
    fn stop_loss_beats_time_exit_when_both_eligible() {
        let p = position();
        let now = p.entry_time + Duration::minutes(90);
        let (reason, exit_price) = evaluate_exit(&p, 620.0, now, None).unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
        assert!((exit_price - 623.00).abs() < 1e-9);
    }

    #[test]
    fn time_exit_fires_past_max_hold_with_no_other_condition() {
        let p = position();
        let now = p.entry_time + Duration::minutes(61);
        let (reason, exit_price) = evaluate_exit(&p, 626.0, now, None).unwrap();
        assert_eq!(reason, ExitReason::TimeExit);
        assert!((exit_price - 626.0).abs() < 1e-9);
    }

    #[test]
    fn no_exit_fires_when_nothing_eligible() {
        let p = position();
        let now = p.entry_time + Duration::minutes(10);
        assert!(evaluate_exit(&p, 626.0, now, None).is_none());
    }

    #[test]
    fn scalping_exit_tracker_dedups_by_symbol_and_entry_time() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ScalpingExitTracker::new(dir.path());
        let p = position();
        let exit = ScalpingExit {
            symbol: p.symbol.clone(),
            entry_time: p.entry_time,
            entry_price: p.entry_price,
            exit_time: p.entry_time + Duration::minutes(25),
            exit_price: 628.63,
            exit_reason: ExitReason::TargetHit,
            return_pct: 0.5,
            hold_duration_mins: 25.0,
            mode: Mode::Scalping,
            recommendation: "Buy".to_string(),
        };
        assert!(tracker.record(&exit));
        assert!(!tracker.record(&exit));
    }
}
