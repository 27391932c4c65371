//! Offline exit-profile simulation — §4.10 ExitProfileEvaluator.
//!
//! Grounded on `original_source/app/services/exit_policy_evaluator.py`'s
//! `simulate_exit_for_pick`: same priority-ordered exit checks, same
//! trailing-stop activation math, same metric definitions.

use crate::models::{Direction, ExitEvent, ExitProfile};
use crate::quotes::Candle;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stop,
    Trail,
    Target,
    Time,
    None,
}

#[derive(Debug, Clone)]
pub struct ExitSimulationResult {
    pub pick_uuid: String,
    pub exit_ts: DateTime<Utc>,
    pub exit_price: f64,
    pub ret_close_pct: f64,
    pub max_runup_pct: f64,
    pub max_drawdown_pct: f64,
    pub hit_target: bool,
    pub hit_stop: bool,
    pub hit_trailing: bool,
    pub time_exit: bool,
    pub exit_reason: ExitReason,
    pub bars_held: u32,
}

impl ExitSimulationResult {
    /// `clip(ret/runup, 0, 1)`; undefined runup (<=0) yields 0 capture.
    pub fn capture_ratio(&self) -> f64 {
        if self.max_runup_pct <= 0.0 {
            0.0
        } else {
            (self.ret_close_pct / self.max_runup_pct).clamp(0.0, 1.0)
        }
    }
}

fn direction_sign(direction: Direction) -> f64 {
    match direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
    }
}

/// Pure simulation of one exit profile over one pick's candle path, step 1-5
/// of §4.10. `candles` must already be restricted/sorted to `[entry_ts,
/// horizon_end_ts]` in time order (the caller's `HistoricalCandleCache`
/// fetch does this filtering); an empty path yields `None`.
pub fn simulate_exit_for_pick(
    pick_uuid: &str,
    direction: Direction,
    entry_price: f64,
    entry_ts: DateTime<Utc>,
    profile: &ExitProfile,
    candles: &[Candle],
) -> Option<ExitSimulationResult> {
    if entry_price <= 0.0 || candles.is_empty() {
        return None;
    }
    let sign = direction_sign(direction);
    let (stop_price, target_price) = profile.resolve_stop_target(direction, entry_price);

    let mut best_price = entry_price;
    let mut worst_price = entry_price;
    let mut trailing_active = false;
    let mut trailing_stop_price: Option<f64> = None;
    let mut bars_held = 0u32;

    let mut exit_ts = None;
    let mut exit_price = None;
    let mut hit_target = false;
    let mut hit_stop = false;
    let mut hit_trailing = false;
    let mut time_exit = false;
    let mut exit_reason = ExitReason::None;

    for c in candles {
        bars_held += 1;
        let (high, low, close) = (c.high, c.low, c.close);

        if sign > 0.0 {
            best_price = best_price.max(high);
            worst_price = worst_price.min(low);
        } else {
            best_price = best_price.min(low);
            worst_price = worst_price.max(high);
        }

        if profile.trailing.enabled && !trailing_active {
            let unrealized_pct = if sign > 0.0 {
                (high - entry_price) / entry_price * 100.0
            } else {
                (entry_price - low) / entry_price * 100.0
            };
            if profile.trailing.activation_value > 0.0 {
                use crate::models::ActivationType;
                trailing_active = match profile.trailing.activation_type {
                    ActivationType::Percent => unrealized_pct >= profile.trailing.activation_value,
                    ActivationType::RrMultiple => stop_price.is_some_and(|sp| {
                        let stop_dist_pct = (entry_price - sp).abs() / entry_price * 100.0;
                        stop_dist_pct > 0.0 && unrealized_pct / stop_dist_pct >= profile.trailing.activation_value
                    }),
                };
            }
            if trailing_active && profile.trailing.trail_type == "percent" && profile.trailing.trail_value > 0.0 {
                trailing_stop_price = Some(if sign > 0.0 {
                    high * (1.0 - profile.trailing.trail_value / 100.0)
                } else {
                    low * (1.0 + profile.trailing.trail_value / 100.0)
                });
            }
        }

        if trailing_active && profile.trailing.trail_value > 0.0 && profile.trailing.trail_type == "percent" {
            if let Some(ref mut tsp) = trailing_stop_price {
                if sign > 0.0 && high > best_price {
                    *tsp = high * (1.0 - profile.trailing.trail_value / 100.0);
                } else if sign < 0.0 && low < best_price {
                    *tsp = low * (1.0 + profile.trailing.trail_value / 100.0);
                }
            }
        }

        'priority: for ev in &profile.exit_priority.order {
            match ev {
                ExitEvent::Stop => {
                    if let Some(sp) = stop_price {
                        if (sign > 0.0 && low <= sp) || (sign < 0.0 && high >= sp) {
                            exit_ts = Some(c.ts);
                            exit_price = Some(sp);
                            hit_stop = true;
                            exit_reason = ExitReason::Stop;
                            break 'priority;
                        }
                    }
                }
                ExitEvent::Trail => {
                    if trailing_active {
                        if let Some(tsp) = trailing_stop_price {
                            if (sign > 0.0 && low <= tsp) || (sign < 0.0 && high >= tsp) {
                                exit_ts = Some(c.ts);
                                exit_price = Some(tsp);
                                hit_trailing = true;
                                exit_reason = ExitReason::Trail;
                                break 'priority;
                            }
                        }
                    }
                }
                ExitEvent::Target => {
                    if let Some(tp) = target_price {
                        if (sign > 0.0 && high >= tp) || (sign < 0.0 && low <= tp) {
                            exit_ts = Some(c.ts);
                            exit_price = Some(tp);
                            hit_target = true;
                            exit_reason = ExitReason::Target;
                            break 'priority;
                        }
                    }
                }
                ExitEvent::Time => {
                    if profile.time_stop.enabled {
                        if let Some(max_hold) = profile.time_stop.max_hold_minutes {
                            let minutes_held = (c.ts - entry_ts).num_seconds() as f64 / 60.0;
                            if minutes_held >= max_hold {
                                exit_ts = Some(c.ts);
                                exit_price = Some(close);
                                time_exit = true;
                                exit_reason = ExitReason::Time;
                                break 'priority;
                            }
                        }
                    }
                }
            }
        }

        if exit_ts.is_some() {
            break;
        }
    }

    let (exit_ts, exit_price) = match (exit_ts, exit_price) {
        (Some(ts), Some(p)) => (ts, p),
        _ => {
            let last = candles.last().unwrap();
            (last.ts, last.close)
        }
    };

    let (max_runup_pct, max_drawdown_pct) = if sign > 0.0 {
        ((best_price - entry_price) / entry_price * 100.0, (worst_price - entry_price) / entry_price * 100.0)
    } else {
        ((entry_price - best_price) / entry_price * 100.0, (entry_price - worst_price) / entry_price * 100.0)
    };

    let ret_close_pct = (exit_price - entry_price) / entry_price * 100.0 * sign;

    Some(ExitSimulationResult {
        pick_uuid: pick_uuid.to_string(),
        exit_ts,
        exit_price,
        ret_close_pct,
        max_runup_pct,
        max_drawdown_pct,
        hit_target,
        hit_stop,
        hit_trailing,
        time_exit,
        exit_reason,
        bars_held,
    })
}

/// Per-profile aggregate over a batch of simulations, §4.10's `score`
/// formula: `1.0·avg_ret + 0.5·avg_capture − 0.5·avg_dd − 0.3·hit_stop_rate·100`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProfileAggregate {
    pub trades: u32,
    pub avg_ret: f64,
    pub avg_dd: f64,
    pub win_rate: f64,
    pub hit_target_rate: f64,
    pub hit_stop_rate: f64,
    pub avg_capture_ratio: f64,
    pub score: f64,
}

pub fn aggregate(results: &[ExitSimulationResult]) -> ProfileAggregate {
    let trades = results.len() as u32;
    if trades == 0 {
        return ProfileAggregate::default();
    }
    let n = trades as f64;
    let avg_ret = results.iter().map(|r| r.ret_close_pct).sum::<f64>() / n;
    let avg_dd = results.iter().map(|r| r.max_drawdown_pct).sum::<f64>() / n;
    let wins = results.iter().filter(|r| r.ret_close_pct > 0.0).count() as f64;
    let hit_target = results.iter().filter(|r| r.hit_target).count() as f64;
    let hit_stop = results.iter().filter(|r| r.hit_stop).count() as f64;
    let avg_capture = results.iter().map(|r| r.capture_ratio()).sum::<f64>() / n;
    let hit_stop_rate = hit_stop / n;

    ProfileAggregate {
        trades,
        avg_ret,
        avg_dd,
        win_rate: wins / n,
        hit_target_rate: hit_target / n,
        hit_stop_rate,
        avg_capture_ratio: avg_capture,
        score: avg_ret + 0.5 * avg_capture - 0.5 * avg_dd - 0.3 * hit_stop_rate * 100.0,
    }
}

/// argmax(score) over a mode's configured profiles; `None` if none traded.
pub fn best_profile(aggregates: &[(String, ProfileAggregate)]) -> Option<&str> {
    aggregates
        .iter()
        .filter(|(_, agg)| agg.trades > 0)
        .max_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(id, _)| id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivationType, ExitPriority, StopConfig, StopType, TargetConfig, TargetType, TimeStopConfig, TrailingConfig};
    use chrono::Duration;

    fn candle(minute: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts: Utc::now() - Duration::days(1) + Duration::minutes(minute),
            open: close,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    fn profile_with_stop_target(stop_pct: f64, target_pct: f64) -> ExitProfile {
        ExitProfile {
            id: "test".into(),
            name: "test".into(),
            stop: Some(StopConfig { kind: StopType::Percent, value: stop_pct }),
            target: Some(TargetConfig { kind: TargetType::Percent, value: target_pct }),
            trailing: TrailingConfig {
                enabled: false,
                activation_type: ActivationType::Percent,
                activation_value: 0.0,
                trail_type: "percent".into(),
                trail_value: 0.0,
            },
            time_stop: TimeStopConfig { enabled: true, max_hold_minutes: Some(60.0) },
            exit_priority: ExitPriority::default(),
        }
    }

    #[test]
    fn long_pick_exits_at_target_when_high_reaches_it() {
        let profile = profile_with_stop_target(1.0, 2.0);
        let entry_ts = Utc::now() - Duration::days(1);
        let candles = vec![candle(1, 100.5, 99.8, 100.2), candle(2, 102.5, 100.0, 102.1)];
        let result = simulate_exit_for_pick("p1", Direction::Long, 100.0, entry_ts, &profile, &candles).unwrap();
        assert!(result.hit_target);
        assert_eq!(result.exit_reason, ExitReason::Target);
        assert!((result.exit_price - 102.0).abs() < 1e-9);
    }

    #[test]
    fn long_pick_exits_at_stop_before_target_by_priority() {
        let profile = profile_with_stop_target(1.0, 2.0);
        let entry_ts = Utc::now() - Duration::days(1);
        // Same bar touches both stop (99.0) and target (102.0); STOP wins by priority order.
        let candles = vec![candle(1, 103.0, 98.5, 100.0)];
        let result = simulate_exit_for_pick("p1", Direction::Long, 100.0, entry_ts, &profile, &candles).unwrap();
        assert!(result.hit_stop);
        assert_eq!(result.exit_reason, ExitReason::Stop);
    }

    #[test]
    fn time_stop_closes_at_last_close_when_no_other_exit_fires() {
        let mut profile = profile_with_stop_target(5.0, 5.0);
        profile.time_stop.max_hold_minutes = Some(2.0);
        let entry_ts = Utc::now() - Duration::days(1);
        let candles = vec![candle(1, 100.3, 99.9, 100.1), candle(3, 100.4, 99.8, 100.2)];
        let result = simulate_exit_for_pick("p1", Direction::Long, 100.0, entry_ts, &profile, &candles).unwrap();
        assert!(result.time_exit);
        assert!((result.exit_price - 100.2).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_last_close_when_no_exit_triggers_by_horizon_end() {
        let profile = profile_with_stop_target(50.0, 50.0);
        let entry_ts = Utc::now() - Duration::days(1);
        let candles = vec![candle(1, 100.5, 99.8, 100.2), candle(2, 100.6, 100.0, 100.4)];
        let result = simulate_exit_for_pick("p1", Direction::Long, 100.0, entry_ts, &profile, &candles).unwrap();
        assert!(!result.hit_stop && !result.hit_target && !result.time_exit);
        assert!((result.exit_price - 100.4).abs() < 1e-9);
    }

    #[test]
    fn capture_ratio_clips_to_zero_one() {
        let mut result = ExitSimulationResult {
            pick_uuid: "p".into(),
            exit_ts: Utc::now(),
            exit_price: 100.0,
            ret_close_pct: 3.0,
            max_runup_pct: 1.0,
            max_drawdown_pct: 0.0,
            hit_target: false,
            hit_stop: false,
            hit_trailing: false,
            time_exit: false,
            exit_reason: ExitReason::None,
            bars_held: 1,
        };
        assert!((result.capture_ratio() - 1.0).abs() < 1e-9);
        result.max_runup_pct = 0.0;
        assert_eq!(result.capture_ratio(), 0.0);
    }

    #[test]
    fn best_profile_is_argmax_score_among_traded_profiles() {
        let aggs = vec![
            ("safe".to_string(), ProfileAggregate { trades: 10, score: 0.5, ..Default::default() }),
            ("balanced".to_string(), ProfileAggregate { trades: 10, score: 1.2, ..Default::default() }),
            ("untested".to_string(), ProfileAggregate { trades: 0, score: 99.0, ..Default::default() }),
        ];
        assert_eq!(best_profile(&aggs), Some("balanced"));
    }
}
