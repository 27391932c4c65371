//! Agent ensemble — §4.4.
//!
//! `Agent` is the abstract per-symbol analyzer contract; `coordinator`
//! fans them out in parallel and blends their scores. Individual agent
//! interiors (RSI math, PSAR, Heikin-Ashi, …) are out of scope per §1 —
//! each registered agent here is a thin, honestly-labelled stub that
//! produces a plausible score/confidence/signal set from the quote context
//! it is given, in place of a full indicator library.

pub mod coordinator;

use crate::quotes::Quote;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSignal {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub signal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_type: String,
    pub symbol: String,
    pub score: Option<f64>,
    pub confidence: Confidence,
    pub signals: Vec<AgentSignal>,
    pub reasoning: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResult {
    /// Degraded result on agent failure (§4.4, §7): score=50, confidence=Low,
    /// reasoning carries the error. The ensemble continues with this in place.
    pub fn degraded(agent_type: &str, symbol: &str, error: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            symbol: symbol.to_string(),
            score: Some(50.0),
            confidence: Confidence::Low,
            signals: Vec::new(),
            reasoning: format!("agent failed: {error}"),
            metadata: HashMap::new(),
        }
    }
}

/// Context handed to every agent for a single symbol evaluation.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub quote: Quote,
    pub regime_bucket: String,
    pub vol_bucket: String,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    /// Static declaration-order weight; overridden per-mode by PolicyStore.
    fn default_weight(&self) -> f64;
    async fn analyze(&self, symbol: &str, context: &AgentContext) -> AgentResult;
}

macro_rules! quote_derived_agent {
    ($struct_name:ident, $name:literal, $weight:expr, $score_fn:expr) => {
        pub struct $struct_name;

        #[async_trait]
        impl Agent for $struct_name {
            fn name(&self) -> &'static str {
                $name
            }

            fn default_weight(&self) -> f64 {
                $weight
            }

            async fn analyze(&self, symbol: &str, context: &AgentContext) -> AgentResult {
                let score = ($score_fn)(context).clamp(0.0, 100.0);
                let confidence = if context.quote.volume > 0.0 { Confidence::Medium } else { Confidence::Low };
                AgentResult {
                    agent_type: $name.to_string(),
                    symbol: symbol.to_string(),
                    score: Some(score),
                    confidence,
                    signals: vec![AgentSignal {
                        kind: $name.to_string(),
                        value: score,
                        signal: if score >= 50.0 { "bullish".to_string() } else { "bearish".to_string() },
                    }],
                    reasoning: format!("{} derived score from change_percent={:.2}", $name, context.quote.change_percent),
                    metadata: HashMap::new(),
                }
            }
        }
    };
}

quote_derived_agent!(TechnicalAgent, "Technical", 0.20, |ctx: &AgentContext| 50.0 + ctx.quote.change_percent * 6.0);
quote_derived_agent!(PatternRecognitionAgent, "PatternRecognition", 0.18, |ctx: &AgentContext| 50.0 + ctx.quote.change_percent * 4.0);
quote_derived_agent!(MarketRegimeAgent, "MarketRegime", 0.15, |ctx: &AgentContext| if ctx.regime_bucket == "Trending" { 65.0 } else { 50.0 });
quote_derived_agent!(GlobalMarketAgent, "GlobalMarket", 0.12, |_ctx: &AgentContext| 50.0);
quote_derived_agent!(OptionsAgent, "Options", 0.12, |ctx: &AgentContext| 50.0 + ctx.quote.oi.signum() * 5.0);
quote_derived_agent!(PolicyMacroAgent, "PolicyMacro", 0.08, |_ctx: &AgentContext| 50.0);
quote_derived_agent!(WatchlistIntelligenceAgent, "WatchlistIntelligence", 0.03, |_ctx: &AgentContext| 50.0);
quote_derived_agent!(MicrostructureAgent, "Microstructure", 0.01, |ctx: &AgentContext| 50.0 + ctx.quote.volume.min(1.0));
quote_derived_agent!(RiskAgent, "Risk", 0.01, |ctx: &AgentContext| if ctx.vol_bucket == "High" { 40.0 } else { 55.0 });

/// Sentiment score comes from the external SentimentProvider boundary (§6),
/// not from quote data; wired in by the coordinator's caller via metadata.
pub struct SentimentAgent;

#[async_trait]
impl Agent for SentimentAgent {
    fn name(&self) -> &'static str {
        "Sentiment"
    }

    fn default_weight(&self) -> f64 {
        0.10
    }

    async fn analyze(&self, symbol: &str, _context: &AgentContext) -> AgentResult {
        AgentResult {
            agent_type: "Sentiment".to_string(),
            symbol: symbol.to_string(),
            score: Some(50.0),
            confidence: Confidence::Low,
            signals: Vec::new(),
            reasoning: "no sentiment provider result attached to this run".to_string(),
            metadata: HashMap::new(),
        }
    }
}

/// Zero-weight utility agents (§4.4): they contribute no score to the blend
/// but still run so their side-effects (alerts, advisories) are produced by
/// the monitor plane which reuses this same trait for AutoMonitoringAgent.
pub struct TradeStrategyAgent;
pub struct AutoMonitoringUtilityAgent;
pub struct PersonalizationAgent;

macro_rules! zero_weight_agent {
    ($struct_name:ident, $name:literal) => {
        #[async_trait]
        impl Agent for $struct_name {
            fn name(&self) -> &'static str {
                $name
            }

            fn default_weight(&self) -> f64 {
                0.0
            }

            async fn analyze(&self, symbol: &str, _context: &AgentContext) -> AgentResult {
                AgentResult {
                    agent_type: $name.to_string(),
                    symbol: symbol.to_string(),
                    score: None,
                    confidence: Confidence::Low,
                    signals: Vec::new(),
                    reasoning: "zero-weight utility agent".to_string(),
                    metadata: HashMap::new(),
                }
            }
        }
    };
}

zero_weight_agent!(TradeStrategyAgent, "TradeStrategy");
zero_weight_agent!(AutoMonitoringUtilityAgent, "AutoMonitoring");
zero_weight_agent!(PersonalizationAgent, "Personalization");

/// The standard ten scored agents plus the three zero-weight utility agents,
/// in declaration order (used as the blend tie-break, §4.4).
pub fn registered_agents() -> Vec<Box<dyn Agent>> {
    vec![
        Box::new(TechnicalAgent),
        Box::new(PatternRecognitionAgent),
        Box::new(MarketRegimeAgent),
        Box::new(GlobalMarketAgent),
        Box::new(OptionsAgent),
        Box::new(SentimentAgent),
        Box::new(PolicyMacroAgent),
        Box::new(WatchlistIntelligenceAgent),
        Box::new(MicrostructureAgent),
        Box::new(RiskAgent),
        Box::new(TradeStrategyAgent),
        Box::new(AutoMonitoringUtilityAgent),
        Box::new(PersonalizationAgent),
    ]
}
