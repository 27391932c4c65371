//! AgentCoordinator — parallel agent fanout + weighted blend (§4.4).
//!
//! Agent fanout for a single symbol runs concurrently via `tokio::spawn`
//! with a per-agent timeout so a slow agent cannot stall a run (§5); the
//! teacher's `rayon::prelude::*` parallel-iterator usage is reused one
//! layer up, in `engine::TopPicksEngine`, to parallelize across symbols.

use super::{Agent, AgentContext, AgentResult, Confidence};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const AGENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BlendOutcome {
    pub blend_score: f64,
    pub contributions: Vec<AgentResult>,
}

pub struct AgentCoordinator {
    agents: Vec<Arc<dyn Agent>>,
    /// Mode-specific weight overrides keyed by agent name; reconfigured per
    /// run by `PolicyStore::get_mode_policy`, never reconstructed (SPEC_FULL §4).
    weight_overrides: HashMap<String, f64>,
}

impl AgentCoordinator {
    pub fn new(agents: Vec<Arc<dyn Agent>>) -> Self {
        Self { agents, weight_overrides: HashMap::new() }
    }

    pub fn with_weights(agents: Vec<Arc<dyn Agent>>, weight_overrides: HashMap<String, f64>) -> Self {
        Self { agents, weight_overrides }
    }

    pub fn reconfigure(&mut self, weight_overrides: HashMap<String, f64>) {
        self.weight_overrides = weight_overrides;
    }

    fn effective_weight(&self, agent: &dyn Agent) -> f64 {
        self.weight_overrides
            .get(agent.name())
            .copied()
            .unwrap_or_else(|| agent.default_weight())
    }

    /// Runs every registered agent against `symbol` concurrently, bounded by
    /// a per-agent timeout, and blends the resulting scores. The coordinator
    /// makes no assumption about completion ordering (§4.4).
    pub async fn run_for_symbol(&self, symbol: &str, context: AgentContext) -> BlendOutcome {
        let context = Arc::new(context);
        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let agent = Arc::clone(agent);
            let context = Arc::clone(&context);
            let symbol = symbol.to_string();
            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(AGENT_TIMEOUT, agent.analyze(&symbol, &context)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(agent = agent.name(), symbol, "agent timed out, using degraded result");
                        AgentResult::degraded(agent.name(), &symbol, "timeout")
                    }
                }
            }));
        }

        let mut contributions = Vec::with_capacity(handles.len());
        for (agent, handle) in self.agents.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(agent = agent.name(), symbol, error = %join_err, "agent task panicked, using degraded result");
                    AgentResult::degraded(agent.name(), symbol, "panicked")
                }
            };
            contributions.push(result);
        }

        let blend_score = self.blend(&contributions);
        BlendOutcome { blend_score, contributions }
    }

    /// `blend_score = Σ(score_i * weight_i) / Σ weight_i`; agents with no
    /// score (zero-weight utility agents) are excluded from the sum. Tie-break
    /// on declaration order is implicit: this fold visits `self.agents` in
    /// their registered order.
    fn blend(&self, contributions: &[AgentResult]) -> f64 {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (agent, result) in self.agents.iter().zip(contributions) {
            let Some(score) = result.score else { continue };
            let weight = self.effective_weight(agent.as_ref());
            if weight <= 0.0 {
                continue;
            }
            weighted_sum += score * weight;
            weight_total += weight;
        }
        if weight_total == 0.0 {
            50.0
        } else {
            weighted_sum / weight_total
        }
    }

    pub fn confidence_label(contributions: &[AgentResult]) -> Confidence {
        let high = contributions.iter().filter(|c| c.confidence == Confidence::High).count();
        let low = contributions.iter().filter(|c| c.confidence == Confidence::Low).count();
        if low > contributions.len() / 2 {
            Confidence::Low
        } else if high > contributions.len() / 2 {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentContext;
    use crate::quotes::Quote;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedAgent {
        name: &'static str,
        weight: f64,
        score: f64,
    }

    #[async_trait]
    impl Agent for FixedAgent {
        fn name(&self) -> &'static str {
            self.name
        }
        fn default_weight(&self) -> f64 {
            self.weight
        }
        async fn analyze(&self, symbol: &str, _context: &AgentContext) -> AgentResult {
            AgentResult {
                agent_type: self.name.to_string(),
                symbol: symbol.to_string(),
                score: Some(self.score),
                confidence: Confidence::Medium,
                signals: vec![],
                reasoning: String::new(),
                metadata: HashMap::new(),
            }
        }
    }

    fn ctx() -> AgentContext {
        AgentContext {
            quote: Quote { price: 100.0, open: 99.0, high: 101.0, low: 98.0, close: 100.0, volume: 1000.0, oi: 0.0, change_percent: 1.0, timestamp: Utc::now() },
            regime_bucket: "Trending".to_string(),
            vol_bucket: "Normal".to_string(),
        }
    }

    #[tokio::test]
    async fn blend_is_weighted_mean() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FixedAgent { name: "A", weight: 0.5, score: 80.0 }),
            Arc::new(FixedAgent { name: "B", weight: 0.5, score: 40.0 }),
        ];
        let coordinator = AgentCoordinator::new(agents);
        let outcome = coordinator.run_for_symbol("SBIN", ctx()).await;
        assert!((outcome.blend_score - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_weight_agents_excluded_from_blend() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FixedAgent { name: "A", weight: 1.0, score: 70.0 }),
            Arc::new(FixedAgent { name: "Utility", weight: 0.0, score: 0.0 }),
        ];
        let coordinator = AgentCoordinator::new(agents);
        let outcome = coordinator.run_for_symbol("SBIN", ctx()).await;
        assert!((outcome.blend_score - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mode_weight_override_changes_blend() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(FixedAgent { name: "A", weight: 0.5, score: 100.0 }),
            Arc::new(FixedAgent { name: "B", weight: 0.5, score: 0.0 }),
        ];
        let mut overrides = HashMap::new();
        overrides.insert("A".to_string(), 0.9);
        overrides.insert("B".to_string(), 0.1);
        let coordinator = AgentCoordinator::with_weights(agents, overrides);
        let outcome = coordinator.run_for_symbol("SBIN", ctx()).await;
        assert!((outcome.blend_score - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn all_degraded_without_weighted_score_falls_back_to_50() {
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(FixedAgent { name: "Utility", weight: 0.0, score: 0.0 })];
        let coordinator = AgentCoordinator::new(agents);
        let outcome = coordinator.run_for_symbol("SBIN", ctx()).await;
        assert_eq!(outcome.blend_score, 50.0);
    }
}
