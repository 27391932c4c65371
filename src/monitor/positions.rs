//! Top-Picks-derived positions monitor (non-scalping) — §4.6b.
//!
//! Every 5 minutes while the market is open, derives logical positions from
//! the latest {Intraday, Swing} Top Picks runs and runs AutoMonitoringAgent
//! over each one. Grounded on
//! `original_source/app/services/top_picks_positions_monitor_scheduler.py`.

use crate::engine::PickPayload;
use crate::models::{AdvisoryKind, Direction, Mode, Severity, StrategyAdvisory};
use crate::monitor::auto_monitoring::{self, MonitoredPosition};
use crate::strategy_exit_tracker::StrategyExitTracker;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub const MONITORED_MODES: [Mode; 2] = [Mode::Intraday, Mode::Swing];

/// Positions carried forward from Top Picks picks still within scope for
/// AutoMonitoringAgent review: direction from the recommendation, entry
/// price from the pick price, stop/target from the synthesized exit
/// strategy.
pub fn derive_positions(picks: &[PickPayload]) -> Vec<MonitoredPosition> {
    picks
        .iter()
        .filter(|p| MONITORED_MODES.contains(&p.mode))
        .map(|p| MonitoredPosition {
            symbol: p.symbol.clone(),
            direction: p.direction,
            entry_price: p.entry_price,
            stop_price: p.stop_price,
            target_price: p.target_price,
        })
        .collect()
}

fn advisory_from_alert(position: &MonitoredPosition, alert: &auto_monitoring::Alert, strategy_id: &str, mode: Mode, now: DateTime<Utc>) -> StrategyAdvisory {
    StrategyAdvisory {
        id: uuid::Uuid::new_v4().to_string(),
        strategy_id: strategy_id.to_string(),
        kind: alert.kind.clone(),
        severity: alert.severity,
        is_exit: alert.kind == AdvisoryKind::ContextInvalidated,
        symbol: position.symbol.clone(),
        direction: position.direction,
        price: position.entry_price,
        entry_price: position.entry_price,
        initial_sl: position.stop_price,
        rr_multiple: None,
        indicators: HashMap::new(),
        message: alert.message.clone(),
        recommended_actions: Vec::new(),
        recommended_exit_price: alert.recommended_exit_price,
        generated_at: now,
        mode,
        source: "top_picks_positions_monitor".to_string(),
        sr_reason: None,
        news_reason: None,
        news_risk_score: None,
    }
}

/// One monitor tick. `sr_proximity`/`news_risk_score` are supplied per
/// symbol by the caller (SupportResistanceService / sentiment provider are
/// out of this module's concern). Any alert carrying a
/// `recommended_exit_price` is persisted via StrategyExitTracker per §4.6b.
pub fn run_tick(
    positions: &[MonitoredPosition],
    current_prices: &HashMap<String, f64>,
    vol_buckets: &HashMap<String, String>,
    sr_proximity: &HashMap<String, bool>,
    news_risk_scores: &HashMap<String, f64>,
    mode: Mode,
    now: DateTime<Utc>,
    tracker: &StrategyExitTracker,
) {
    for position in positions {
        let Some(&price) = current_prices.get(&position.symbol) else { continue };
        let vol_bucket = vol_buckets.get(&position.symbol).map(String::as_str).unwrap_or("Normal");
        let proximity = sr_proximity.get(&position.symbol).copied().unwrap_or(false);
        let news_risk = news_risk_scores.get(&position.symbol).copied();

        let assessment = auto_monitoring::evaluate(position, price, vol_bucket, proximity, news_risk);
        for alert in &assessment.alerts {
            if alert.recommended_exit_price.is_some() {
                let advisory = advisory_from_alert(position, alert, "top_picks_positions_monitor", mode, now);
                tracker.record(&advisory, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::exit_strategy::ExitStrategy;

    fn payload(mode: Mode, stop: Option<f64>, target: Option<f64>) -> PickPayload {
        PickPayload {
            pick_uuid: "u1".to_string(),
            symbol: "SBIN".to_string(),
            direction: Direction::Long,
            mode,
            recommendation: "Buy".to_string(),
            blend_score: 70.0,
            confidence: "High".to_string(),
            entry_price: 600.0,
            entry_time: Utc::now(),
            stop_price: stop,
            target_price: target,
            exit_strategy: ExitStrategy::Profile(crate::models::ExitProfile {
                id: "p1".to_string(),
                name: "p".to_string(),
                stop: None,
                target: None,
                trailing: crate::models::TrailingConfig {
                    enabled: false,
                    activation_type: crate::models::ActivationType::Percent,
                    activation_value: 0.0,
                    trail_type: "percent".to_string(),
                    trail_value: 0.0,
                },
                time_stop: crate::models::TimeStopConfig { enabled: false, max_hold_minutes: None },
                exit_priority: crate::models::ExitPriority::default(),
            }),
            regime_bucket: "Trending".to_string(),
            vol_bucket: "Normal".to_string(),
            user_risk_bucket: "Default".to_string(),
            session_segment: None,
            value_bucket: None,
            bandit_ctx: "ctx".to_string(),
            entry_action_id: "standard".to_string(),
            exit_profile_id: Some("p1".to_string()),
        }
    }

    #[test]
    fn derive_positions_filters_to_intraday_and_swing() {
        let picks = vec![payload(Mode::Intraday, Some(590.0), Some(620.0)), payload(Mode::Scalping, Some(595.0), Some(605.0))];
        let positions = derive_positions(&picks);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "SBIN");
    }

    #[test]
    fn run_tick_persists_advisories_with_recommended_exit_price() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StrategyExitTracker::new(dir.path());
        let positions = vec![MonitoredPosition { symbol: "SBIN".to_string(), direction: Direction::Long, entry_price: 600.0, stop_price: Some(590.0), target_price: Some(620.0) }];
        let mut prices = HashMap::new();
        prices.insert("SBIN".to_string(), 591.0);
        let now = Utc::now();
        run_tick(&positions, &prices, &HashMap::new(), &HashMap::new(), &HashMap::new(), Mode::Intraday, now, &tracker);

        let date = crate::market_clock::ist_date_of(now);
        let advisory = tracker.get_exit_for("SBIN", date, None, None);
        assert!(advisory.is_some());
    }
}
