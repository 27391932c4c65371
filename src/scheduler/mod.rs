//! Scheduler plane (§6 "Scheduling"): the cron table that drives
//! `TopPicksEngine`, the position monitors, `OutcomeEvaluator`, and
//! `PolicyLearner` off `tokio::time::interval` loops, gated by the IST
//! session windows in `market_clock`. Grounded on the teacher's polling-task
//! idiom (`main.rs`'s `tokio::spawn` + `interval.tick()` jobs) and on
//! `original_source/app/services/top_picks_scheduler.py`,
//! `scalping_monitor_scheduler.py`, `top_picks_positions_monitor_scheduler.py`.
//!
//! Every job here is a fire-and-forget `tokio::spawn`'d loop: a single
//! misbehaving tick (a failed quote fetch, a poisoned lock attempt) is
//! logged and the loop continues rather than unwinding the process. No job
//! ever panics across a tick boundary.

use crate::engine::{PickPayload, TopPicksEngine};
use crate::kv::KvStore;
use crate::learning::outcome_evaluator::OutcomeEvaluator;
use crate::learning::policy_learner::PolicyLearner;
use crate::market_clock;
use crate::models::{Mode, RunTrigger, SrScope};
use crate::monitor::scalping::{self, ScalpingExitTracker};
use crate::monitor::{auto_monitoring, positions};
use crate::quotes::QuoteProvider;
use crate::sentiment::SentimentProvider;
use crate::store::ai_recommendation_store::AiRecommendationStore;
use crate::store::pick_event_log::PickEventLog;
use crate::store::top_picks_store::TopPicksStore;
use crate::strategy_exit_tracker::StrategyExitTracker;
use crate::support_resistance::SupportResistanceService;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How close (in percent of price) a quote must sit to a pivot level to
/// count as "near support/resistance" for the position monitors.
const SR_PROXIMITY_PCT: f64 = 0.5;

const TOP_PICKS_LOCK_TTL_SECONDS: i64 = 900;

fn top_picks_lock_key(universe: &str, mode: Mode) -> String {
    format!("lock:top_picks:{universe}:{}", mode.as_str())
}

/// One (universe, mode) entry in the Top Picks cron table.
struct TopPicksJob {
    universe: &'static str,
    mode: Mode,
    poll_interval: Duration,
}

fn top_picks_job_table() -> Vec<TopPicksJob> {
    let universes = ["nifty50", "banknifty"];
    let mut jobs = Vec::new();
    for universe in universes {
        jobs.push(TopPicksJob { universe, mode: Mode::Scalping, poll_interval: Duration::from_secs(60) });
        jobs.push(TopPicksJob { universe, mode: Mode::Intraday, poll_interval: Duration::from_secs(15 * 60) });
        jobs.push(TopPicksJob { universe, mode: Mode::Options, poll_interval: Duration::from_secs(15 * 60) });
        jobs.push(TopPicksJob { universe, mode: Mode::Futures, poll_interval: Duration::from_secs(15 * 60) });
        jobs.push(TopPicksJob { universe, mode: Mode::Swing, poll_interval: Duration::from_secs(60 * 60) });
    }
    jobs
}

/// Is `mode` in its runnable session window right now? Swing is not gated
/// to the cash session (§4.1: "Swing is not subject to the hard cutoff");
/// it is left to run on its own hourly cadence around the clock so a
/// restarted process always catches up.
fn in_run_window(mode: Mode, now: DateTime<Utc>) -> bool {
    match mode {
        Mode::Scalping => market_clock::is_scalping_cycle_window(now),
        Mode::Intraday | Mode::Options | Mode::Futures => market_clock::is_cash_market_open(now),
        Mode::Swing => market_clock::is_trading_weekday_ist(now),
    }
}

#[allow(clippy::too_many_arguments)]
pub struct Scheduler {
    engine: Arc<TopPicksEngine>,
    top_picks_store: Arc<TopPicksStore>,
    outcome_evaluator: Arc<OutcomeEvaluator>,
    policy_learner: Arc<PolicyLearner>,
    quote_provider: Arc<dyn QuoteProvider>,
    support_resistance: Arc<SupportResistanceService>,
    sentiment_provider: Arc<dyn SentimentProvider>,
    kv: Arc<dyn KvStore>,
    scalping_tracker: Arc<ScalpingExitTracker>,
    strategy_exit_tracker: Arc<StrategyExitTracker>,
    ai_recommendation_store: Arc<AiRecommendationStore>,
    pick_event_log: Arc<PickEventLog>,
    universes: Vec<&'static str>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<TopPicksEngine>,
        top_picks_store: Arc<TopPicksStore>,
        outcome_evaluator: Arc<OutcomeEvaluator>,
        policy_learner: Arc<PolicyLearner>,
        quote_provider: Arc<dyn QuoteProvider>,
        support_resistance: Arc<SupportResistanceService>,
        sentiment_provider: Arc<dyn SentimentProvider>,
        kv: Arc<dyn KvStore>,
        scalping_tracker: Arc<ScalpingExitTracker>,
        strategy_exit_tracker: Arc<StrategyExitTracker>,
        ai_recommendation_store: Arc<AiRecommendationStore>,
        pick_event_log: Arc<PickEventLog>,
    ) -> Self {
        Self {
            engine,
            top_picks_store,
            outcome_evaluator,
            policy_learner,
            quote_provider,
            support_resistance,
            sentiment_provider,
            kv,
            scalping_tracker,
            strategy_exit_tracker,
            ai_recommendation_store,
            pick_event_log,
            universes: vec!["nifty50", "banknifty"],
        }
    }

    /// Spawns every cron job as its own detached task. Returns immediately;
    /// the caller (the binary's composition root) keeps the process alive
    /// via the WebSocket/HTTP server.
    pub fn spawn_all(self: &Arc<Self>) {
        for job in top_picks_job_table() {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_top_picks_job(job).await });
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_scalping_monitor().await });

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_positions_monitor().await });

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_outcome_evaluator().await });

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_policy_learner().await });
    }

    async fn run_top_picks_job(&self, job: TopPicksJob) {
        let mut ticker = tokio::time::interval(job.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !in_run_window(job.mode, now) {
                continue;
            }

            let lock_key = top_picks_lock_key(job.universe, job.mode);
            let Some(token) = self.kv.acquire_lock(&lock_key, TOP_PICKS_LOCK_TTL_SECONDS).await else {
                // Another worker (or an overrunning previous tick) already
                // holds this (universe, mode) slot; skip rather than queue.
                continue;
            };

            let trigger = if job.mode.is_scalping() { RunTrigger::ScalpingCycle } else { RunTrigger::Hourly };
            match self.engine.run(job.universe, job.mode, trigger, now).await {
                Ok(Some(run)) => info!(universe = job.universe, mode = job.mode.as_str(), picks = run.picks_count, "top picks run completed"),
                Ok(None) => {}
                Err(err) => warn!(universe = job.universe, mode = job.mode.as_str(), error = %err, "top picks run failed"),
            }

            self.kv.release_lock(&lock_key, &token).await;
        }
    }

    /// Latest run's picks for `(universe, mode)`, decoded back out of
    /// `TopPicksRun::payload`. An absent/unparsable run yields an empty set
    /// rather than erroring the caller's tick.
    async fn latest_picks(&self, universe: &str, mode: Mode) -> Vec<PickPayload> {
        let run = match self.top_picks_store.get_latest_run_for(universe, mode) {
            Ok(Some(run)) => run,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(universe, mode = mode.as_str(), error = %err, "failed to load latest top picks run");
                return Vec::new();
            }
        };
        match run.payload.get("picks").cloned() {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn quotes_for(&self, symbols: &[String]) -> HashMap<String, f64> {
        self.quote_provider.get_quote(symbols).await.into_iter().map(|(symbol, quote)| (symbol, quote.price)).collect()
    }

    /// Per-symbol "is the current price close to an S/R pivot" and "what is
    /// the news risk score" context, shared by the scalping and non-scalping
    /// position monitors (§4.6b/§4.6c both consume the same two signals).
    async fn monitor_context(&self, symbols: &[String], current_prices: &HashMap<String, f64>, now: DateTime<Utc>) -> (HashMap<String, bool>, HashMap<String, f64>) {
        let mut sr_proximity = HashMap::new();
        let mut news_risk_scores = HashMap::new();

        for symbol in symbols {
            let Some(&price) = current_prices.get(symbol) else { continue };
            if price <= 0.0 {
                continue;
            }
            if let Some(levels) = self.support_resistance.get_levels(symbol, SrScope::D, &self.quote_provider, now).await {
                let nearest_pct = [levels.r1, levels.r2, levels.r3, levels.s1, levels.s2, levels.s3]
                    .into_iter()
                    .map(|level| ((level - price).abs() / price) * 100.0)
                    .fold(f64::MAX, f64::min);
                sr_proximity.insert(symbol.clone(), nearest_pct <= SR_PROXIMITY_PCT);
            }

            match self.sentiment_provider.analyze_news_sentiment(symbol).await {
                Ok(result) => {
                    news_risk_scores.insert(symbol.clone(), (100.0 - result.score).max(0.0));
                }
                Err(err) => warn!(symbol, error = %err, "sentiment lookup failed"),
            }
        }

        (sr_proximity, news_risk_scores)
    }

    /// Every tick while the scalping cycle window is open: re-derives
    /// scalping positions from the latest Scalping-mode run, evaluates each
    /// one's exit conditions, and records any fired exit.
    async fn run_scalping_monitor(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !market_clock::is_scalping_cycle_window(now) && !market_clock::is_eod_window(now) {
                continue;
            }

            for universe in &self.universes {
                let picks = self.latest_picks(universe, Mode::Scalping).await;
                if picks.is_empty() {
                    continue;
                }
                let positions = scalping::derive_positions(&picks, now);
                let symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
                let current_prices = self.quotes_for(&symbols).await;

                scalping::run_tick(&positions, &current_prices, now, &self.scalping_tracker, &self.ai_recommendation_store, &self.pick_event_log);
            }
        }
    }

    /// Every 5 minutes during the cash session: re-derives Intraday/Swing
    /// positions from the latest runs and checks each for stop/target/SR/news
    /// alerts via `auto_monitoring::evaluate`.
    async fn run_positions_monitor(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !market_clock::is_cash_market_open(now) {
                continue;
            }

            for universe in &self.universes {
                for mode in positions::MONITORED_MODES {
                    let picks = self.latest_picks(universe, mode).await;
                    if picks.is_empty() {
                        continue;
                    }
                    let monitored = positions::derive_positions(&picks);
                    let symbols: Vec<String> = monitored.iter().map(|p| p.symbol.clone()).collect();
                    let current_prices = self.quotes_for(&symbols).await;
                    let vol_buckets: HashMap<String, String> = picks.iter().map(|p| (p.symbol.clone(), p.vol_bucket.clone())).collect();
                    let (sr_proximity, news_risk_scores) = self.monitor_context(&symbols, &current_prices, now).await;

                    positions::run_tick(&monitored, &current_prices, &vol_buckets, &sr_proximity, &news_risk_scores, mode, now, &self.strategy_exit_tracker);
                }
            }
        }
    }

    /// Once a tick during the EOD window: scores every pick whose
    /// evaluation horizon has closed, per mode. `OutcomeEvaluator::run`
    /// itself skips `exit_only` modes and picks whose horizon hasn't closed
    /// yet, so calling it for every mode on every EOD tick is safe and
    /// idempotent.
    async fn run_outcome_evaluator(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !market_clock::is_eod_window(now) {
                continue;
            }
            let trade_date = market_clock::ist_date_of(now);
            for mode in [Mode::Scalping, Mode::Intraday, Mode::Swing, Mode::Options, Mode::Futures] {
                match self.outcome_evaluator.run(mode, trade_date, now).await {
                    Ok(0) => {}
                    Ok(n) => info!(mode = mode.as_str(), evaluated = n, "outcome evaluator scored pending picks"),
                    Err(err) => warn!(mode = mode.as_str(), error = %err, "outcome evaluator run failed"),
                }
            }
        }
    }

    /// Once every 24h: proposes (never activates) a best-performing exit
    /// profile candidate per mode, from the last 30 days of evaluated,
    /// non-mock recommendations. Candidates are logged for a human to act
    /// on via `PolicyRegistry::activate`; nothing here mutates policy.
    async fn run_policy_learner(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for mode in [Mode::Scalping, Mode::Intraday, Mode::Swing, Mode::Options, Mode::Futures] {
                match self.policy_learner.propose_candidates(mode, 30, now).await {
                    Ok(candidates) => {
                        for candidate in candidates {
                            info!(
                                mode = mode.as_str(),
                                policy_version = ?candidate.policy_version,
                                recommended_profile_id = ?candidate.recommended_profile_id,
                                review = %candidate.to_review_json(now),
                                "policy candidate proposed"
                            );
                        }
                    }
                    Err(err) => warn!(mode = mode.as_str(), error = %err, "policy learner proposal failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swing_run_window_ignores_clock_but_not_weekday() {
        use chrono::TimeZone;
        let sunday = Utc.with_ymd_and_hms(2025, 11, 23, 3, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2025, 11, 24, 3, 0, 0).unwrap();
        assert!(!in_run_window(Mode::Swing, sunday));
        assert!(in_run_window(Mode::Swing, monday));
    }

    #[test]
    fn scalping_run_window_follows_cycle_window() {
        use chrono::TimeZone;
        let before_open = Utc.with_ymd_and_hms(2025, 11, 24, 3, 30, 0).unwrap();
        assert!(!in_run_window(Mode::Scalping, before_open));
    }

    #[test]
    fn job_table_covers_every_mode_in_both_universes() {
        let jobs = top_picks_job_table();
        assert_eq!(jobs.len(), 10);
        assert!(jobs.iter().any(|j| j.universe == "nifty50" && j.mode == Mode::Swing));
        assert!(jobs.iter().any(|j| j.universe == "banknifty" && j.mode == Mode::Scalping));
    }

    #[test]
    fn lock_key_is_stable_per_universe_and_mode() {
        assert_eq!(top_picks_lock_key("nifty50", Mode::Intraday), "lock:top_picks:nifty50:Intraday");
    }
}
