//! Process-wide configuration (§6 "Configuration").
//!
//! Loaded once in the composition root and passed by reference; nothing in
//! this crate re-reads the environment after startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: Option<String>,
    pub top_picks_retention_days: u32,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub db_path: PathBuf,
    pub mode_weights_path: PathBuf,
    pub performance_horizons_path: PathBuf,
    pub quote_provider_primary_token: Option<String>,
    pub quote_provider_fallback_token: Option<String>,
    pub sentiment_api_key: Option<String>,
    pub ws_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let data_dir = PathBuf::from(
            std::env::var("ARISE_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
        );
        let cache_dir = PathBuf::from(
            std::env::var("ARISE_CACHE_DIR").unwrap_or_else(|_| ".cache/historical".to_string()),
        );
        let db_path = PathBuf::from(
            std::env::var("ARISE_DB_PATH").unwrap_or_else(|_| "data/arise.db".to_string()),
        );
        let mode_weights_path = PathBuf::from(
            std::env::var("ARISE_MODE_WEIGHTS_PATH")
                .unwrap_or_else(|_| "config/mode_weights.json".to_string()),
        );
        let performance_horizons_path = PathBuf::from(
            std::env::var("ARISE_PERFORMANCE_HORIZONS_PATH")
                .unwrap_or_else(|_| "config/performance_horizons.json".to_string()),
        );

        let top_picks_retention_days = std::env::var("TOP_PICKS_RETENTION_DAYS")
            .unwrap_or_else(|_| "90".to_string())
            .parse()
            .unwrap_or(90);

        let ws_port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Ok(Self {
            redis_url: std::env::var("REDIS_URL").ok(),
            top_picks_retention_days,
            data_dir,
            cache_dir,
            db_path,
            mode_weights_path,
            performance_horizons_path,
            quote_provider_primary_token: std::env::var("QUOTE_PROVIDER_PRIMARY_TOKEN").ok(),
            quote_provider_fallback_token: std::env::var("QUOTE_PROVIDER_FALLBACK_TOKEN").ok(),
            sentiment_api_key: std::env::var("SENTIMENT_API_KEY").ok(),
            ws_port,
        })
    }
}

/// `mode_weights.json`: `{ version, modes:{ mode:{ weights, thresholds? } }, meta }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModeWeightsConfig {
    pub version: String,
    pub modes: HashMap<String, ModeWeightEntry>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeWeightEntry {
    pub weights: HashMap<String, f64>,
    #[serde(default)]
    pub thresholds: Option<RecommendationThresholds>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RecommendationThresholds {
    pub strong_buy: f64,
    pub buy: f64,
    pub sell: f64,
    pub strong_sell: f64,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self { strong_buy: 75.0, buy: 58.0, sell: 42.0, strong_sell: 25.0 }
    }
}

impl ModeWeightsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading mode weights config at {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing mode weights config at {}", path.display()))
    }
}

/// `performance_horizons.json`: `{ mode:{ type, days? } }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum HorizonKind {
    ExitOnly,
    EodClose,
    FixedDays { days: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceHorizonsConfig(pub HashMap<String, HorizonKind>);

impl PerformanceHorizonsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading performance horizons config at {}", path.display()))?;
        let map = serde_json::from_str(&raw)
            .with_context(|| format!("parsing performance horizons config at {}", path.display()))?;
        Ok(Self(map))
    }

    pub fn for_mode(&self, mode: &str) -> Option<&HorizonKind> {
        self.0.get(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_weights_parse_from_json() {
        let raw = r#"{
            "version": "1",
            "modes": { "Intraday": { "weights": { "Technical": 0.2 } } },
            "meta": {}
        }"#;
        let cfg: ModeWeightsConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.modes["Intraday"].weights["Technical"], 0.2);
    }

    #[test]
    fn performance_horizons_parse_variants() {
        let raw = r#"{
            "Scalping": {"type": "exit_only"},
            "Intraday": {"type": "eod_close"},
            "Swing": {"type": "fixed_days", "days": 5}
        }"#;
        let cfg: PerformanceHorizonsConfig = serde_json::from_str(raw).unwrap();
        match cfg.for_mode("Swing").unwrap() {
            HorizonKind::FixedDays { days } => assert_eq!(*days, 5),
            _ => panic!("expected FixedDays"),
        }
    }
}
