//! PolicyLearner — SPEC_FULL supplement, grounded on
//! `original_source/app/services/policy_learner.py`.
//!
//! Re-simulates each mode's configured exit profiles over its recent
//! non-mock AI recommendations (§4.10's `ExitProfileEvaluator` machinery,
//! reused offline) and proposes a best-performing profile per
//! `(mode, policy_version)` group. This never mutates the active Policy
//! row; it only produces a reviewable JSON candidate for a human to
//! activate via `PolicyRegistry::activate`.

use crate::learning::exit_profile_evaluator::{aggregate, best_profile, simulate_exit_for_pick, ProfileAggregate};
use crate::models::AiRecommendation;
use crate::quotes::QuoteProvider;
use crate::store::ai_recommendation_store::AiRecommendationStore;
use crate::store::policy::PolicyRegistry;
use crate::models::Mode;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct PolicyCandidate {
    pub mode: String,
    pub policy_version: Option<String>,
    pub sample_size: usize,
    pub profile_aggregates: HashMap<String, ProfileAggregate>,
    pub recommended_profile_id: Option<String>,
}

impl PolicyCandidate {
    /// A reviewable artifact, never applied automatically: the active
    /// policy is only ever changed through `PolicyRegistry::activate`.
    pub fn to_review_json(&self, generated_at: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "mode": self.mode,
            "policy_version": self.policy_version,
            "generated_at": generated_at.to_rfc3339(),
            "sample_size": self.sample_size,
            "recommended_profile_id": self.recommended_profile_id,
            "profile_aggregates": self.profile_aggregates,
        })
    }
}

fn group_by_policy_version(rows: Vec<AiRecommendation>) -> HashMap<Option<String>, Vec<AiRecommendation>> {
    let mut groups: HashMap<Option<String>, Vec<AiRecommendation>> = HashMap::new();
    for row in rows {
        groups.entry(row.policy_version.clone()).or_default().push(row);
    }
    groups
}

pub struct PolicyLearner {
    ai_recommendation_store: Arc<AiRecommendationStore>,
    policy_registry: Arc<PolicyRegistry>,
    quote_provider: Arc<dyn QuoteProvider>,
}

impl PolicyLearner {
    pub fn new(ai_recommendation_store: Arc<AiRecommendationStore>, policy_registry: Arc<PolicyRegistry>, quote_provider: Arc<dyn QuoteProvider>) -> Self {
        Self { ai_recommendation_store, policy_registry, quote_provider }
    }

    /// One candidate per distinct `policy_version` seen among `mode`'s
    /// evaluated, non-mock recommendations created within `lookback_days`.
    pub async fn propose_candidates(&self, mode: Mode, lookback_days: u32, now: DateTime<Utc>) -> anyhow::Result<Vec<PolicyCandidate>> {
        let mode_policy = self.policy_registry.get_mode_policy(mode.as_str())?;
        if mode_policy.exit_profiles.is_empty() {
            return Ok(Vec::new());
        }
        let horizon_days = mode_policy.evaluation_horizon_days.unwrap_or(1).max(1);

        let cutoff = now - Duration::days(lookback_days as i64);
        let rows: Vec<AiRecommendation> =
            self.ai_recommendation_store.evaluated_non_mock(mode)?.into_iter().filter(|r| r.created_at >= cutoff).collect();

        let mut candidates = Vec::new();
        for (policy_version, group_rows) in group_by_policy_version(rows) {
            let mut aggregates = HashMap::new();
            for (profile_id, profile) in &mode_policy.exit_profiles {
                let mut results = Vec::new();
                for row in &group_rows {
                    let entry_ts = row.created_at;
                    let horizon_end = entry_ts + Duration::days(horizon_days as i64);
                    let candles = self.quote_provider.get_historical(&row.symbol, entry_ts, horizon_end, "1d", true).await;
                    if let Some(result) = simulate_exit_for_pick(&row.pick_uuid, row.direction, row.entry_price, entry_ts, profile, &candles) {
                        results.push(result);
                    }
                }
                aggregates.insert(profile_id.clone(), aggregate(&results));
            }

            let scored: Vec<(String, ProfileAggregate)> = aggregates.iter().map(|(id, agg)| (id.clone(), *agg)).collect();
            let recommended_profile_id = best_profile(&scored).map(String::from);

            candidates.push(PolicyCandidate {
                mode: mode.as_str().to_string(),
                sample_size: group_rows.len(),
                policy_version,
                profile_aggregates: aggregates,
                recommended_profile_id,
            });
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::quotes::cache::HistoricalCandleCache;
    use crate::quotes::ComposedQuoteProvider;
    use crate::store::policy::PolicyRegistry;

    #[test]
    fn groups_rows_by_policy_version_including_none() {
        let rows = vec![
            AiRecommendation {
                id: 1, pick_uuid: "p1".into(), symbol: "SBIN".into(), mode: Mode::Intraday, direction: Direction::Long,
                entry_price: 100.0, exit_price: Some(103.0), pnl_pct: Some(3.0), evaluated: true,
                policy_version: Some("v1".into()), data_source: "broker".into(), created_at: Utc::now(),
            },
            AiRecommendation {
                id: 2, pick_uuid: "p2".into(), symbol: "TCS".into(), mode: Mode::Intraday, direction: Direction::Long,
                entry_price: 200.0, exit_price: Some(198.0), pnl_pct: Some(-1.0), evaluated: true,
                policy_version: None, data_source: "broker".into(), created_at: Utc::now(),
            },
        ];
        let groups = group_by_policy_version(rows);
        assert_eq!(groups.len(), 2);
        assert!(groups.contains_key(&Some("v1".to_string())));
        assert!(groups.contains_key(&None));
    }

    #[tokio::test]
    async fn propose_candidates_is_empty_when_no_recommendations_exist() {
        let dir = tempfile::tempdir().unwrap();
        let ai_store = Arc::new(AiRecommendationStore::new(dir.path().join("ai.db")).unwrap());
        let registry = Arc::new(PolicyRegistry::new(dir.path().join("policy.db")).unwrap());
        registry.seed_default_if_absent().unwrap();
        let cache = HistoricalCandleCache::new_in_memory();
        let quote_provider: Arc<dyn QuoteProvider> = Arc::new(ComposedQuoteProvider::new_stub(Arc::new(cache)));

        let learner = PolicyLearner::new(ai_store, registry, quote_provider);
        let candidates = learner.propose_candidates(Mode::Intraday, 30, Utc::now()).await.unwrap();
        assert!(candidates.is_empty());
    }
}
