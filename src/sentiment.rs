//! News sentiment provider boundary — §6 external interfaces.
//!
//! The live analyzer talks to a third-party news/sentiment API; only the
//! trait and a deterministic stub live in this crate (the boundary itself,
//! not the provider's internals, per §1's scope).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::AgentSignal;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentMetadata {
    pub news_count: u32,
    pub positive_count: u32,
    pub negative_count: u32,
    pub neutral_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentResult {
    pub score: f64,
    pub metadata: SentimentMetadata,
    pub signals: Vec<AgentSignal>,
}

impl SentimentResult {
    fn neutral() -> Self {
        Self {
            score: 50.0,
            metadata: SentimentMetadata { news_count: 0, positive_count: 0, negative_count: 0, neutral_count: 0 },
            signals: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SentimentProvider: Send + Sync {
    async fn analyze_news_sentiment(&self, symbol: &str) -> anyhow::Result<SentimentResult>;
}

/// No sentiment API is wired up in this build; returns a neutral score with
/// zeroed counts so `SentimentAgent` can always produce a well-formed
/// degraded-but-present contribution rather than erroring.
pub struct StubSentimentProvider;

#[async_trait]
impl SentimentProvider for StubSentimentProvider {
    async fn analyze_news_sentiment(&self, _symbol: &str) -> anyhow::Result<SentimentResult> {
        Ok(SentimentResult::neutral())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_returns_neutral_score_with_no_signals() {
        let provider = StubSentimentProvider;
        let result = provider.analyze_news_sentiment("SBIN").await.unwrap();
        assert_eq!(result.score, 50.0);
        assert_eq!(result.metadata.news_count, 0);
        assert!(result.signals.is_empty());
    }
}
