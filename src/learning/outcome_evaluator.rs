//! OutcomeEvaluator — §4.12.
//!
//! Runs once per trading day (EOD at 16:00 IST, per mode horizon) and walks
//! every pick still missing a `PickOutcome` row for its horizon, fetches the
//! realized price path and the NIFTY50 benchmark over the same window,
//! computes the return/runup/drawdown/outcome-label quintet, upserts the
//! outcome, best-effort marks the AI recommendation exited, and feeds the
//! entry/exit bandits a reward. Grounded on
//! `original_source/app/services/outcome_evaluator.py`.

use crate::config::{HorizonKind, PerformanceHorizonsConfig};
use crate::learning::bandit;
use crate::market_clock::ist_naive_to_utc;
use crate::models::{Direction, Mode, OutcomeLabel, PickEvent, PickOutcome};
use crate::quotes::{Candle, QuoteProvider};
use crate::store::ai_recommendation_store::AiRecommendationStore;
use crate::store::pick_event_log::PickEventLog;
use crate::store::policy::PolicyRegistry;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::warn;

pub const BENCHMARK_SYMBOL: &str = "NIFTY50";

/// Which `evaluation_horizon` label a mode's picks are queued under, and
/// the UTC instant its horizon closes for a pick signaled on `trade_date`.
/// `ExitOnly` modes (Scalping) have no EOD evaluator pass: their outcomes
/// are recorded directly by `monitor::scalping` as positions exit.
fn horizon_window(kind: &HorizonKind, trade_date: NaiveDate) -> Option<(String, DateTime<Utc>)> {
    match kind {
        HorizonKind::ExitOnly => None,
        HorizonKind::EodClose => Some(("EOD".to_string(), ist_naive_to_utc(trade_date, 15, 30))),
        HorizonKind::FixedDays { days } => {
            let end_date = trade_date + Duration::days(*days as i64);
            Some((format!("FIXED_DAYS_{days}"), ist_naive_to_utc(end_date, 15, 30)))
        }
    }
}

struct PriceStats {
    close_last: f64,
    high_max: f64,
    low_min: f64,
}

fn stats_from_candles(candles: &[Candle]) -> Option<PriceStats> {
    let last = candles.last()?;
    let high_max = candles.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
    let low_min = candles.iter().fold(f64::MAX, |acc, c| acc.min(c.low));
    Some(PriceStats { close_last: last.close, high_max, low_min })
}

/// Signed so a favorable move is always positive, regardless of direction.
fn signed_pct(direction: Direction, reference: f64, moved_to: f64) -> f64 {
    let sign = if direction == Direction::Long { 1.0 } else { -1.0 };
    if reference == 0.0 {
        return 0.0;
    }
    sign * (moved_to - reference) / reference * 100.0
}

#[derive(Debug, Clone, Copy)]
struct ComputedOutcome {
    ret_close_pct: f64,
    max_runup_pct: f64,
    max_drawdown_pct: f64,
    hit_target: bool,
    hit_stop: bool,
    capture_ratio: f64,
    benchmark_ret_pct: Option<f64>,
    ret_vs_benchmark_pct: Option<f64>,
}

/// Core arithmetic, grounded on the four S3 scenario numbers (§8): for a
/// Long pick with signal_price=100, close_last=103, high_max=105,
/// low_min=99.5, this yields ret_close_pct=3.00, max_runup_pct=5.00,
/// max_drawdown_pct=-0.50.
fn compute_outcome(
    direction: Direction,
    signal_price: f64,
    stats: &PriceStats,
    recommended_target: Option<f64>,
    recommended_stop: Option<f64>,
    benchmark: Option<(f64, f64)>,
) -> ComputedOutcome {
    let ret_close_pct = signed_pct(direction, signal_price, stats.close_last);
    let runup_from_high = signed_pct(direction, signal_price, stats.high_max);
    let runup_from_low = signed_pct(direction, signal_price, stats.low_min);
    let max_runup_pct = runup_from_high.max(runup_from_low);
    let max_drawdown_pct = runup_from_high.min(runup_from_low);

    let hit_target = recommended_target.map(|t| match direction {
        Direction::Long => stats.high_max >= t,
        Direction::Short => stats.low_min <= t,
    }).unwrap_or(false);
    let hit_stop = recommended_stop.map(|s| match direction {
        Direction::Long => stats.low_min <= s,
        Direction::Short => stats.high_max >= s,
    }).unwrap_or(false);

    let capture_ratio = if max_runup_pct > 0.0 { (ret_close_pct / max_runup_pct).max(0.0).min(1.0) } else { 0.0 };

    let (benchmark_ret_pct, ret_vs_benchmark_pct) = match benchmark {
        Some((first, last)) if first != 0.0 => {
            let bench_ret = (last - first) / first * 100.0;
            (Some(bench_ret), Some(ret_close_pct - bench_ret))
        }
        _ => (None, None),
    };

    ComputedOutcome { ret_close_pct, max_runup_pct, max_drawdown_pct, hit_target, hit_stop, capture_ratio, benchmark_ret_pct, ret_vs_benchmark_pct }
}

pub struct OutcomeEvaluator {
    quote_provider: Arc<dyn QuoteProvider>,
    pick_event_log: Arc<PickEventLog>,
    ai_recommendation_store: Arc<AiRecommendationStore>,
    policy_registry: Arc<PolicyRegistry>,
    performance_horizons: PerformanceHorizonsConfig,
}

impl OutcomeEvaluator {
    pub fn new(
        quote_provider: Arc<dyn QuoteProvider>,
        pick_event_log: Arc<PickEventLog>,
        ai_recommendation_store: Arc<AiRecommendationStore>,
        policy_registry: Arc<PolicyRegistry>,
        performance_horizons: PerformanceHorizonsConfig,
    ) -> Self {
        Self { quote_provider, pick_event_log, ai_recommendation_store, policy_registry, performance_horizons }
    }

    /// Evaluates every not-yet-scored pick for `mode` whose horizon closes
    /// at or before `now`. Returns the number of picks evaluated. A mode
    /// with an `exit_only` horizon (or none configured) is skipped outright.
    pub async fn run(&self, mode: Mode, trade_date: NaiveDate, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let Some(kind) = self.performance_horizons.for_mode(mode.as_str()) else { return Ok(0) };
        let Some((horizon_label, horizon_end)) = horizon_window(kind, trade_date) else { return Ok(0) };
        if horizon_end > now {
            return Ok(0);
        }

        let picks = self.pick_event_log.picks_without_outcome(&trade_date.to_string(), mode.as_str(), &horizon_label)?;
        let mut evaluated = 0;
        for pick in &picks {
            if self.evaluate_pick(pick, horizon_end, &horizon_label).await {
                evaluated += 1;
            }
        }
        Ok(evaluated)
    }

    async fn evaluate_pick(&self, pick: &PickEvent, horizon_end: DateTime<Utc>, horizon_label: &str) -> bool {
        let day_start = ist_naive_to_utc(pick.trade_date, 9, 15);

        let candles = self.quote_provider.get_historical(&pick.symbol, day_start, horizon_end, "1d", true).await;
        let Some(stats) = stats_from_candles(&candles) else {
            warn!(symbol = %pick.symbol, pick_uuid = %pick.pick_uuid, "no candles available for outcome evaluation, skipping");
            return false;
        };

        let benchmark_candles = self.quote_provider.get_historical(BENCHMARK_SYMBOL, day_start, horizon_end, "1d", true).await;
        let benchmark = match (benchmark_candles.first(), benchmark_candles.last()) {
            (Some(first), Some(last)) => Some((first.close, last.close)),
            _ => None,
        };

        let outcome = compute_outcome(pick.direction, pick.signal_price, &stats, pick.recommended_target, pick.recommended_stop, benchmark);

        let pick_outcome = PickOutcome {
            pick_uuid: pick.pick_uuid.clone(),
            evaluation_horizon: horizon_label.to_string(),
            horizon_end_ts: horizon_end,
            price_close: stats.close_last,
            price_high: stats.high_max,
            price_low: stats.low_min,
            ret_close_pct: outcome.ret_close_pct,
            max_runup_pct: outcome.max_runup_pct,
            max_drawdown_pct: outcome.max_drawdown_pct,
            benchmark_symbol: benchmark.map(|_| BENCHMARK_SYMBOL.to_string()),
            benchmark_ret_pct: outcome.benchmark_ret_pct,
            hit_target: outcome.hit_target,
            hit_stop: outcome.hit_stop,
            outcome_label: OutcomeLabel::from_ret_pct(outcome.ret_close_pct),
            notes: serde_json::json!({
                "capture_ratio": outcome.capture_ratio,
                "ret_vs_benchmark_pct": outcome.ret_vs_benchmark_pct,
            }),
        };
        self.pick_event_log.upsert_outcome(&pick_outcome);
        self.ai_recommendation_store.record_exit(&pick.pick_uuid, stats.close_last, outcome.ret_close_pct, None);

        self.update_bandits(pick, &outcome);
        true
    }

    fn update_bandits(&self, pick: &PickEvent, outcome: &ComputedOutcome) {
        if let Some(entry_action_id) = &pick.extra_context.entry_action_id {
            if let Some(entry_ctx) = &pick.extra_context.bandit_ctx {
                let reward = bandit::entry_reward(outcome.ret_close_pct, outcome.max_drawdown_pct, outcome.hit_stop);
                self.apply_bandit_update(pick.mode, "entry_bandit", entry_ctx, entry_action_id, reward);
            }
        }
        if let Some(exit_profile_id) = &pick.extra_context.exit_profile_id {
            let exit_ctx = bandit::exit_context_key(
                pick.mode,
                &pick.regime_bucket,
                &pick.vol_bucket,
                &pick.user_risk_bucket,
                pick.extra_context.session_segment.as_deref(),
                pick.extra_context.value_bucket.as_deref(),
            );
            let reward = bandit::exit_reward(outcome.ret_close_pct, outcome.capture_ratio, outcome.max_drawdown_pct, outcome.hit_stop);
            self.apply_bandit_update(pick.mode, "exit_bandit", &exit_ctx, exit_profile_id, reward);
        }
    }

    fn apply_bandit_update(&self, mode: Mode, bandit_kind: &str, ctx: &str, action: &str, reward: f64) {
        let prior = self
            .policy_registry
            .load_bandit_contexts(mode.as_str(), bandit_kind)
            .ok()
            .and_then(|contexts| contexts.get(ctx).and_then(|actions| actions.get(action)).copied());
        let next = bandit::update_action(prior, reward);
        if let Err(e) = self.policy_registry.update_bandit_action(mode.as_str(), bandit_kind, ctx, action, next) {
            warn!(mode = mode.as_str(), bandit_kind, ctx, action, error = %e, "failed to persist bandit update, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { ts, open, high, low, close, volume: 0.0 }
    }

    #[test]
    fn scenario_s3_long_pick_matches_spec_numbers() {
        let stats = PriceStats { close_last: 103.0, high_max: 105.0, low_min: 99.5 };
        let outcome = compute_outcome(Direction::Long, 100.0, &stats, None, None, Some((20000.0, 20100.0)));
        assert!((outcome.ret_close_pct - 3.00).abs() < 1e-9);
        assert!((outcome.max_runup_pct - 5.00).abs() < 1e-9);
        assert!((outcome.max_drawdown_pct - (-0.50)).abs() < 1e-9);
        assert!((outcome.benchmark_ret_pct.unwrap() - 0.50).abs() < 1e-9);
        assert!((outcome.ret_vs_benchmark_pct.unwrap() - 2.50).abs() < 1e-9);
        assert_eq!(OutcomeLabel::from_ret_pct(outcome.ret_close_pct), OutcomeLabel::Win);
    }

    #[test]
    fn short_pick_inverts_the_favorable_direction() {
        let stats = PriceStats { close_last: 97.0, high_max: 100.5, low_min: 95.0 };
        let outcome = compute_outcome(Direction::Short, 100.0, &stats, None, None, None);
        assert!((outcome.ret_close_pct - 3.00).abs() < 1e-9);
        assert!((outcome.max_runup_pct - 5.00).abs() < 1e-9);
        assert!((outcome.max_drawdown_pct - (-0.50)).abs() < 1e-9);
    }

    #[test]
    fn hit_target_and_hit_stop_respect_direction() {
        let stats = PriceStats { close_last: 103.0, high_max: 108.0, low_min: 98.0 };
        let outcome = compute_outcome(Direction::Long, 100.0, &stats, Some(107.0), Some(99.0), None);
        assert!(outcome.hit_target);
        assert!(outcome.hit_stop);
    }

    #[test]
    fn stats_from_candles_takes_last_close_and_window_extremes() {
        let now = Utc::now();
        let candles = vec![candle(now, 100.0, 102.0, 99.0, 101.0), candle(now, 101.0, 105.0, 99.5, 103.0)];
        let stats = stats_from_candles(&candles).unwrap();
        assert_eq!(stats.close_last, 103.0);
        assert_eq!(stats.high_max, 105.0);
        assert_eq!(stats.low_min, 99.0);
    }

    #[test]
    fn horizon_window_skips_exit_only() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(horizon_window(&HorizonKind::ExitOnly, date).is_none());
        let (label, _) = horizon_window(&HorizonKind::EodClose, date).unwrap();
        assert_eq!(label, "EOD");
        let (label, _) = horizon_window(&HorizonKind::FixedDays { days: 5 }, date).unwrap();
        assert_eq!(label, "FIXED_DAYS_5");
    }
}
