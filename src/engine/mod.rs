//! TopPicksEngine — §4.5.
//!
//! Resolves a universe, fans agents out per symbol, blends scores into a
//! recommendation, synthesizes an exit strategy, enriches with bandit
//! context, and persists + broadcasts the run. Per-symbol agent fanout
//! (`AgentCoordinator::run_for_symbol`) already parallelizes via
//! `tokio::spawn`; the symbols themselves run concurrently via
//! `futures_util::future::join_all`, and the purely synchronous
//! ranking/enrichment pass afterward fans out across symbols with `rayon`.

pub mod exit_strategy;

use crate::agents::coordinator::{AgentCoordinator, BlendOutcome};
use crate::agents::{Agent, AgentContext, AgentResult};
use crate::kv::KvStore;
use crate::learning::bandit;
use crate::market_clock::{self};
use crate::models::{Direction, ExitProfile, ExtraContext, Mode, PickEvent, RunTrigger, TopPicksRun};
use crate::quotes::{Quote, QuoteProvider};
use crate::store::ai_recommendation_store::AiRecommendationStore;
use crate::store::pick_event_log::PickEventLog;
use crate::store::policy::{ModePolicy, PolicyRegistry};
use crate::store::top_picks_store::TopPicksStore;
use chrono::{DateTime, Timelike, Utc};
use futures_util::future::join_all;
use rand::thread_rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use exit_strategy::ExitStrategy;

/// Narrow interface the engine broadcasts run/pick updates through, so it
/// never depends on the WS hub directly (§9: inter-plane communication via
/// typed messages/narrow interfaces, never globals).
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, channel: &str, payload: serde_json::Value);
}

/// Denormalized per-pick row embedded in `TopPicksRun::payload`; this is
/// what the position monitors (§4.6) parse back out of the latest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickPayload {
    pub pick_uuid: String,
    pub symbol: String,
    pub direction: Direction,
    pub mode: Mode,
    pub recommendation: String,
    pub blend_score: f64,
    pub confidence: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub exit_strategy: ExitStrategy,
    pub regime_bucket: String,
    pub vol_bucket: String,
    pub user_risk_bucket: String,
    pub session_segment: Option<String>,
    pub value_bucket: Option<String>,
    pub bandit_ctx: String,
    pub entry_action_id: String,
    pub exit_profile_id: Option<String>,
}

fn recommendation_label(score: f64, thresholds: &crate::config::RecommendationThresholds) -> &'static str {
    if score >= thresholds.strong_buy {
        "Strong Buy"
    } else if score >= thresholds.buy {
        "Buy"
    } else if score <= thresholds.strong_sell {
        "Strong Sell"
    } else if score <= thresholds.sell {
        "Sell"
    } else {
        "Neutral"
    }
}

fn direction_for(recommendation: &str) -> Option<Direction> {
    match recommendation {
        "Strong Buy" | "Buy" => Some(Direction::Long),
        "Sell" | "Strong Sell" => Some(Direction::Short),
        _ => None,
    }
}

fn classify_regime(quote: &Quote) -> &'static str {
    if quote.change_percent.abs() >= 1.0 {
        "Trending"
    } else {
        "RangeBound"
    }
}

fn classify_vol(quote: &Quote) -> &'static str {
    if quote.close <= 0.0 {
        return "Normal";
    }
    let range_pct = (quote.high - quote.low) / quote.close * 100.0;
    if range_pct >= 2.0 {
        "High"
    } else if range_pct <= 0.5 {
        "Low"
    } else {
        "Normal"
    }
}

/// Opening (pre-10:30 IST) / Midday / Closing (post-14:30 IST) bucket, used
/// only by the Intraday exit bandit's extended context key.
fn session_segment(now: DateTime<Utc>) -> &'static str {
    let ist = market_clock::to_ist(now);
    let minutes = ist.hour() * 60 + ist.minute();
    if minutes < 10 * 60 + 30 {
        "Opening"
    } else if minutes >= 14 * 60 + 30 {
        "Closing"
    } else {
        "Midday"
    }
}

pub struct TopPicksEngine {
    agents: Vec<Arc<dyn Agent>>,
    quote_provider: Arc<dyn QuoteProvider>,
    kv: Arc<dyn KvStore>,
    mode_weights: crate::config::ModeWeightsConfig,
    policy_registry: Arc<PolicyRegistry>,
    top_picks_store: Arc<TopPicksStore>,
    pick_event_log: Arc<PickEventLog>,
    ai_recommendation_store: Arc<AiRecommendationStore>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    top_n: usize,
}

impl TopPicksEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Vec<Arc<dyn Agent>>,
        quote_provider: Arc<dyn QuoteProvider>,
        kv: Arc<dyn KvStore>,
        mode_weights: crate::config::ModeWeightsConfig,
        policy_registry: Arc<PolicyRegistry>,
        top_picks_store: Arc<TopPicksStore>,
        pick_event_log: Arc<PickEventLog>,
        ai_recommendation_store: Arc<AiRecommendationStore>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
    ) -> Self {
        Self {
            agents,
            quote_provider,
            kv,
            mode_weights,
            policy_registry,
            top_picks_store,
            pick_event_log,
            ai_recommendation_store,
            broadcaster,
            top_n: 10,
        }
    }

    /// Named universe membership. Real constituent lists live outside this
    /// crate's scope (§1); this returns the symbols a demo/backfill run
    /// would use, and an empty set (with a warning) for unknown universes.
    fn resolve_universe_symbols(&self, universe: &str) -> Vec<String> {
        match universe {
            "nifty50" | "NIFTY50" => vec![
                "RELIANCE", "TCS", "HDFCBANK", "INFY", "ICICIBANK", "SBIN", "BHARTIARTL", "ITC", "LT", "KOTAKBANK",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            "banknifty" | "BANKNIFTY" => {
                vec!["HDFCBANK", "ICICIBANK", "SBIN", "KOTAKBANK", "AXISBANK"].into_iter().map(String::from).collect()
            }
            other => {
                warn!(universe = other, "unknown universe, resolving to empty symbol set");
                Vec::new()
            }
        }
    }

    /// Runs one (universe, mode) cycle. Returns `Ok(None)` when the hard
    /// cutoff short-circuits the run to the cached snapshot, or when the
    /// universe resolves to no symbols.
    pub async fn run(&self, universe: &str, mode: Mode, trigger: RunTrigger, now: DateTime<Utc>) -> anyhow::Result<Option<TopPicksRun>> {
        if mode.hard_cutoff_applies() && market_clock::is_past_hard_cutoff(now) && trigger != RunTrigger::Backfill {
            let message = format!("Skipping {mode} run for {universe} after 15:15 IST");
            info!(universe, mode = mode.as_str(), "{}", message);
            return Ok(None);
        }

        let started = Instant::now();
        let symbols = self.resolve_universe_symbols(universe);
        let total_analyzed = symbols.len();
        if symbols.is_empty() {
            return Ok(None);
        }

        let quotes = self.quote_provider.get_quote(&symbols).await;
        let mode_policy = self.policy_registry.get_mode_policy(mode.as_str())?;
        let thresholds = self.mode_weights.modes.get(mode.as_str()).and_then(|entry| entry.thresholds).unwrap_or_default();

        let analyses = join_all(symbols.iter().map(|symbol| {
            let quote = quotes.get(symbol).copied().unwrap_or_else(|| Quote::zero_filled(now));
            let context = AgentContext { regime_bucket: classify_regime(&quote).to_string(), vol_bucket: classify_vol(&quote).to_string(), quote };
            let coordinator = AgentCoordinator::with_weights(self.agents.clone(), mode_policy.weights.clone());
            let symbol = symbol.clone();
            async move {
                let outcome = coordinator.run_for_symbol(&symbol, context.clone()).await;
                (symbol, context, outcome)
            }
        }))
        .await;

        let filtered_count = analyses.iter().filter(|(_, _, o)| direction_for(recommendation_label(o.blend_score, &thresholds)).is_some()).count();

        let run_id = TopPicksStore::run_id_for(universe, mode, now);
        let segment = session_segment(now);

        // Ranking/enrichment from here is purely synchronous, so it fans out
        // over rayon one layer above the agents' own tokio fanout.
        let mut picks: Vec<(PickEvent, Vec<crate::models::AgentContribution>, PickPayload)> = analyses
            .into_par_iter()
            .filter_map(|(symbol, context, outcome)| {
                let recommendation = recommendation_label(outcome.blend_score, &thresholds);
                let direction = direction_for(recommendation)?;
                Some(self.build_pick(universe, &run_id, mode, &symbol, direction, recommendation, &context, &outcome, &mode_policy, segment, now))
            })
            .collect();

        picks.sort_by(|a, b| b.0.blend_score.partial_cmp(&a.0.blend_score).unwrap_or(std::cmp::Ordering::Equal));
        picks.truncate(self.top_n);

        let payloads: Vec<&PickPayload> = picks.iter().map(|(_, _, p)| p).collect();
        let run = TopPicksRun {
            run_id,
            universe: universe.to_string(),
            mode,
            generated_at_utc: now,
            trigger,
            total_analyzed,
            filtered_count,
            picks_count: picks.len(),
            elapsed_sec: started.elapsed().as_secs_f64(),
            payload: serde_json::json!({ "picks": payloads }),
        };

        self.top_picks_store.store_run(&run)?;
        for (pick, contributions, _) in &picks {
            self.pick_event_log.log_pick(pick, contributions);
            self.ai_recommendation_store.insert(&pick.pick_uuid, &pick.symbol, mode, pick.direction, pick.signal_price, &pick.source);
        }

        let cache_key = format!("top_picks:{universe}:{}", mode.as_str());
        self.kv.set_json(&cache_key, run.payload.clone(), Some(3600)).await;
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast("top_picks_update", run.payload.clone());
        }

        Ok(Some(run))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_pick(
        &self,
        universe: &str,
        run_id: &str,
        mode: Mode,
        symbol: &str,
        direction: Direction,
        recommendation: &str,
        context: &AgentContext,
        outcome: &BlendOutcome,
        mode_policy: &ModePolicy,
        session_segment: &str,
        now: DateTime<Utc>,
    ) -> (PickEvent, Vec<crate::models::AgentContribution>, PickPayload) {
        let confidence = AgentCoordinator::confidence_label(&outcome.contributions);
        let confidence_str = format!("{confidence:?}");
        let user_risk_bucket = "Default".to_string();
        let entry_price = context.quote.price;

        let entry_bandit_ctx = bandit::entry_context_key(mode, &context.regime_bucket, &context.vol_bucket, &user_risk_bucket);
        let mut rng = thread_rng();
        let entry_action_id = match &mode_policy.entry_bandit {
            Some(cfg) if cfg.enabled => {
                let contexts = self.policy_registry.load_bandit_contexts(mode.as_str(), "entry_bandit").unwrap_or_default();
                bandit::select_entry_action(&mut rng, cfg, &contexts, &entry_bandit_ctx)
            }
            _ => "default".to_string(),
        };

        let (exit_strategy, exit_profile_id, stop_price, target_price) = if mode.is_scalping() {
            let scalping = exit_strategy::synthesize_scalping_exit(&context.vol_bucket);
            let sign = if direction == Direction::Long { 1.0 } else { -1.0 };
            let stop = entry_price - sign * entry_price * (scalping.stop_pct / 100.0);
            let target = entry_price + sign * entry_price * (scalping.target_pct / 100.0);
            (ExitStrategy::Scalping(scalping), None, Some(stop), Some(target))
        } else {
            let exit_ctx =
                bandit::exit_context_key(mode, &context.regime_bucket, &context.vol_bucket, &user_risk_bucket, Some(session_segment), Some("Core"));
            let profile_id = match &mode_policy.exit_bandit {
                Some(cfg) if cfg.enabled && !mode_policy.exit_profiles.is_empty() => {
                    let contexts = self.policy_registry.load_bandit_contexts(mode.as_str(), "exit_bandit").unwrap_or_default();
                    bandit::select_exit_action(&mut rng, cfg, &contexts, &exit_ctx)
                }
                _ => mode_policy.exit_profiles.keys().next().cloned().unwrap_or_default(),
            };
            let profile = mode_policy.exit_profiles.get(&profile_id).cloned().unwrap_or_else(|| default_fallback_profile(&profile_id));
            let (stop, target) = profile.resolve_stop_target(direction, entry_price);
            (ExitStrategy::Profile(profile), Some(profile_id), stop, target)
        };

        let extra_context = ExtraContext {
            bandit_ctx: Some(entry_bandit_ctx.clone()),
            exit_profile_id: exit_profile_id.clone(),
            entry_action_id: Some(entry_action_id.clone()),
            session_segment: Some(session_segment.to_string()),
            value_bucket: Some("Core".to_string()),
            extra: Default::default(),
        };

        let mut pick = PickEvent::new(
            symbol,
            direction,
            "top_picks_engine",
            mode,
            now,
            entry_price,
            outcome.blend_score,
            recommendation,
            confidence_str.clone(),
            universe,
            extra_context,
            run_id,
        );
        pick.recommended_entry = Some(entry_price);
        pick.recommended_target = target_price;
        pick.recommended_stop = stop_price;
        pick.regime_bucket = context.regime_bucket.clone();
        pick.vol_bucket = context.vol_bucket.clone();
        pick.user_risk_bucket = user_risk_bucket.clone();

        let contributions: Vec<crate::models::AgentContribution> = outcome
            .contributions
            .iter()
            .map(|r: &AgentResult| crate::models::AgentContribution {
                pick_uuid: pick.pick_uuid.clone(),
                agent_name: r.agent_type.clone(),
                score: r.score,
                confidence: format!("{:?}", r.confidence),
                metadata: r.metadata.clone(),
            })
            .collect();

        let payload = PickPayload {
            pick_uuid: pick.pick_uuid.clone(),
            symbol: symbol.to_string(),
            direction,
            mode,
            recommendation: recommendation.to_string(),
            blend_score: outcome.blend_score,
            confidence: confidence_str,
            entry_price,
            entry_time: now,
            stop_price,
            target_price,
            exit_strategy,
            regime_bucket: context.regime_bucket.clone(),
            vol_bucket: context.vol_bucket.clone(),
            user_risk_bucket,
            session_segment: Some(session_segment.to_string()),
            value_bucket: Some("Core".to_string()),
            bandit_ctx: entry_bandit_ctx,
            entry_action_id,
            exit_profile_id,
        };

        (pick, contributions, payload)
    }
}

fn default_fallback_profile(id: &str) -> ExitProfile {
    use crate::models::{ActivationType, ExitPriority, StopConfig, StopType, TargetConfig, TargetType, TimeStopConfig, TrailingConfig};
    ExitProfile {
        id: id.to_string(),
        name: "fallback".to_string(),
        stop: Some(StopConfig { kind: StopType::Percent, value: 1.0 }),
        target: Some(TargetConfig { kind: TargetType::Percent, value: 2.0 }),
        trailing: TrailingConfig { enabled: false, activation_type: ActivationType::Percent, activation_value: 0.0, trail_type: "percent".to_string(), trail_value: 0.0 },
        time_stop: TimeStopConfig { enabled: false, max_hold_minutes: None },
        exit_priority: ExitPriority::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecommendationThresholds;

    #[test]
    fn recommendation_label_respects_thresholds() {
        let thresholds = RecommendationThresholds::default();
        assert_eq!(recommendation_label(80.0, &thresholds), "Strong Buy");
        assert_eq!(recommendation_label(60.0, &thresholds), "Buy");
        assert_eq!(recommendation_label(50.0, &thresholds), "Neutral");
        assert_eq!(recommendation_label(40.0, &thresholds), "Sell");
        assert_eq!(recommendation_label(10.0, &thresholds), "Strong Sell");
    }

    #[test]
    fn direction_mapping_drops_neutral() {
        assert_eq!(direction_for("Buy"), Some(Direction::Long));
        assert_eq!(direction_for("Strong Sell"), Some(Direction::Short));
        assert_eq!(direction_for("Neutral"), None);
    }

    #[test]
    fn vol_bucket_classification_thresholds() {
        let now = Utc::now();
        let high = Quote { price: 100.0, open: 100.0, high: 103.0, low: 100.0, close: 100.0, volume: 0.0, oi: 0.0, change_percent: 0.0, timestamp: now };
        let low = Quote { price: 100.0, open: 100.0, high: 100.2, low: 100.0, close: 100.0, volume: 0.0, oi: 0.0, change_percent: 0.0, timestamp: now };
        assert_eq!(classify_vol(&high), "High");
        assert_eq!(classify_vol(&low), "Low");
    }
}
