//! Shared data-model types for the Top Picks lifecycle.
//!
//! These mirror the append-only / upsert records described in the data
//! model: PickEvent, AgentContribution, PickOutcome, Policy, ExitProfile,
//! SRLevels, TopPicksRun, ScalpingExit, StrategyAdvisory, TickSubscription,
//! and the supplemental AiRecommendation row used by the learning plane.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::market_clock::ist_date_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Scalping,
    Intraday,
    Swing,
    Options,
    Futures,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Scalping => "Scalping",
            Mode::Intraday => "Intraday",
            Mode::Swing => "Swing",
            Mode::Options => "Options",
            Mode::Futures => "Futures",
        }
    }

    pub fn is_scalping(&self) -> bool {
        matches!(self, Mode::Scalping)
    }

    /// Scalping/Intraday/Options/Futures are subject to the 15:15 IST hard
    /// cutoff (§4.1, §4.5); Swing is not.
    pub fn hard_cutoff_applies(&self) -> bool {
        !matches!(self, Mode::Swing)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationHorizon {
    Eod,
    Scalping,
    FixedDays(u32),
}

impl EvaluationHorizon {
    pub fn label(&self) -> String {
        match self {
            EvaluationHorizon::Eod => "EOD".to_string(),
            EvaluationHorizon::Scalping => "SCALPING".to_string(),
            EvaluationHorizon::FixedDays(n) => format!("FIXED_DAYS_{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeLabel {
    Win,
    Loss,
    Breakeven,
}

impl OutcomeLabel {
    /// WIN (>0.5%), LOSS (<-0.5%), BREAKEVEN otherwise.
    pub fn from_ret_pct(ret_close_pct: f64) -> Self {
        if ret_close_pct > 0.5 {
            OutcomeLabel::Win
        } else if ret_close_pct < -0.5 {
            OutcomeLabel::Loss
        } else {
            OutcomeLabel::Breakeven
        }
    }
}

/// Immutable append record created by TopPicksEngine, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickEvent {
    pub pick_uuid: String,
    pub symbol: String,
    pub direction: Direction,
    pub source: String,
    pub mode: Mode,
    pub signal_ts: DateTime<Utc>,
    pub trade_date: NaiveDate,
    pub signal_price: f64,
    pub recommended_entry: Option<f64>,
    pub recommended_target: Option<f64>,
    pub recommended_stop: Option<f64>,
    pub time_horizon: Option<String>,
    pub blend_score: f64,
    pub recommendation: String,
    pub confidence: String,
    pub regime_bucket: String,
    pub vol_bucket: String,
    pub user_risk_bucket: String,
    pub universe: String,
    pub extra_context: ExtraContext,
    pub run_id: String,
}

impl PickEvent {
    /// Construct a new pick event. `signal_ts` must already be UTC-aware;
    /// `trade_date` is derived, never passed in, to preserve the invariant
    /// that it is always the IST calendar date of `signal_ts`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        source: impl Into<String>,
        mode: Mode,
        signal_ts: DateTime<Utc>,
        signal_price: f64,
        blend_score: f64,
        recommendation: impl Into<String>,
        confidence: impl Into<String>,
        universe: impl Into<String>,
        extra_context: ExtraContext,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            pick_uuid: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            direction,
            source: source.into(),
            mode,
            signal_ts,
            trade_date: ist_date_of(signal_ts),
            signal_price,
            recommended_entry: None,
            recommended_target: None,
            recommended_stop: None,
            time_horizon: None,
            blend_score,
            recommendation: recommendation.into(),
            confidence: confidence.into(),
            regime_bucket: "Unknown".to_string(),
            vol_bucket: "Unknown".to_string(),
            user_risk_bucket: "Default".to_string(),
            universe: universe.into(),
            extra_context,
            run_id: run_id.into(),
        }
    }
}

/// Opaque structured context map carried on a PickEvent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraContext {
    pub bandit_ctx: Option<String>,
    pub exit_profile_id: Option<String>,
    pub entry_action_id: Option<String>,
    pub session_segment: Option<String>,
    pub value_bucket: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContribution {
    pub pick_uuid: String,
    pub agent_name: String,
    pub score: Option<f64>,
    pub confidence: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickOutcome {
    pub pick_uuid: String,
    pub evaluation_horizon: String,
    pub horizon_end_ts: DateTime<Utc>,
    pub price_close: f64,
    pub price_high: f64,
    pub price_low: f64,
    pub ret_close_pct: f64,
    pub max_runup_pct: f64,
    pub max_drawdown_pct: f64,
    pub benchmark_symbol: Option<String>,
    pub benchmark_ret_pct: Option<f64>,
    pub hit_target: bool,
    pub hit_stop: bool,
    pub outcome_label: OutcomeLabel,
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyStatus {
    Draft,
    Active,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub name: String,
    pub description: String,
    pub status: PolicyStatus,
    pub config: serde_json::Value,
    pub metrics: serde_json::Value,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Percent,
    Price,
    AtrMultiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Percent,
    Price,
    RrMultiple,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StopConfig {
    #[serde(rename = "type")]
    pub kind: StopType,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    Percent,
    RrMultiple,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub enabled: bool,
    pub activation_type: ActivationType,
    pub activation_value: f64,
    pub trail_type: String,
    pub trail_value: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeStopConfig {
    pub enabled: bool,
    pub max_hold_minutes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitEvent {
    Stop,
    Trail,
    Target,
    Time,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPriority {
    pub order: Vec<ExitEvent>,
}

impl Default for ExitPriority {
    fn default() -> Self {
        Self {
            order: vec![ExitEvent::Stop, ExitEvent::Trail, ExitEvent::Target, ExitEvent::Time],
        }
    }
}

/// Parameterized rule set used by ExitProfileEvaluator and the online monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitProfile {
    pub id: String,
    pub name: String,
    pub stop: Option<StopConfig>,
    pub target: Option<TargetConfig>,
    pub trailing: TrailingConfig,
    pub time_stop: TimeStopConfig,
    pub exit_priority: ExitPriority,
}

impl ExitProfile {
    /// Resolve the profile's stop/target config into absolute prices for a
    /// given entry, exactly as `exit_policy_evaluator.py`'s
    /// `simulate_exit_for_pick` does it: percent distances are struck off
    /// `entry_price`, `rr_multiple` targets are struck off the resolved stop
    /// distance, `price`/`atr_multiple` types (ATR unavailable at this layer)
    /// are treated as already-absolute or as a percent distance respectively.
    pub fn resolve_stop_target(&self, direction: Direction, entry_price: f64) -> (Option<f64>, Option<f64>) {
        let sign = if direction == Direction::Long { 1.0 } else { -1.0 };

        let stop_price = self.stop.and_then(|stop| {
            if stop.value <= 0.0 {
                return None;
            }
            match stop.kind {
                StopType::Price => Some(stop.value),
                StopType::Percent | StopType::AtrMultiple => {
                    let dist = entry_price * (stop.value / 100.0);
                    Some(entry_price - sign * dist)
                }
            }
        });

        let target_price = self.target.and_then(|target| {
            if target.value <= 0.0 {
                return None;
            }
            match target.kind {
                TargetType::Price => Some(target.value),
                TargetType::Percent => {
                    let dist = entry_price * (target.value / 100.0);
                    Some(entry_price + sign * dist)
                }
                TargetType::RrMultiple => {
                    let stop_price = stop_price?;
                    let stop_dist = (entry_price - stop_price).abs();
                    Some(entry_price + sign * stop_dist * target.value)
                }
            }
        });

        (stop_price, target_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrScope {
    Y,
    M,
    W,
    D,
}

impl SrScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrScope::Y => "Y",
            SrScope::M => "M",
            SrScope::W => "W",
            SrScope::D => "D",
        }
    }

    /// Candle window (trading days) used to compute the pivot.
    pub fn window(&self) -> usize {
        match self {
            SrScope::Y => 252,
            SrScope::M => 22,
            SrScope::W => 5,
            SrScope::D => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SrLevels {
    pub p: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Preopen,
    Hourly,
    ScalpingCycle,
    Manual,
    Backfill,
    Warmup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopPicksRun {
    pub run_id: String,
    pub universe: String,
    pub mode: Mode,
    pub generated_at_utc: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub total_analyzed: usize,
    pub filtered_count: usize,
    pub picks_count: usize,
    pub elapsed_sec: f64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitReason {
    TargetHit,
    StopLoss,
    TimeExit,
    TrailingStop,
    EodAutoExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TimeExit => "TIME_EXIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::EodAutoExit => "EOD_AUTO_EXIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingExit {
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub return_pct: f64,
    pub hold_duration_mins: f64,
    pub mode: Mode,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvisoryKind {
    PartialProfit,
    ContextInvalidated,
    TrendWeakening,
    VolumeFade,
    PriceStretched,
}

impl AdvisoryKind {
    /// Ranking used by StrategyExitTracker::get_exit_for: CONTEXT_INVALIDATED
    /// < PARTIAL_PROFIT < everything else.
    pub fn priority_rank(&self) -> u8 {
        match self {
            AdvisoryKind::ContextInvalidated => 0,
            AdvisoryKind::PartialProfit => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAdvisory {
    pub id: String,
    pub strategy_id: String,
    pub kind: AdvisoryKind,
    pub severity: Severity,
    pub is_exit: bool,
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub entry_price: f64,
    pub initial_sl: Option<f64>,
    pub rr_multiple: Option<f64>,
    pub indicators: HashMap<String, serde_json::Value>,
    pub message: String,
    pub recommended_actions: Vec<String>,
    pub recommended_exit_price: Option<f64>,
    pub generated_at: DateTime<Utc>,
    pub mode: Mode,
    pub source: String,
    pub sr_reason: Option<String>,
    pub news_reason: Option<String>,
    pub news_risk_score: Option<f64>,
}

/// SPEC_FULL supplement: denormalized per-pick row for P&L realization and
/// the offline policy learner's performance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub id: i64,
    pub pick_uuid: String,
    pub symbol: String,
    pub mode: Mode,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub evaluated: bool,
    pub policy_version: Option<String>,
    pub data_source: String,
    pub created_at: DateTime<Utc>,
}

impl AiRecommendation {
    pub const MOCK_DATA_SENTINEL: &'static str = "Mock Data";

    pub fn is_mock(&self) -> bool {
        self.data_source == Self::MOCK_DATA_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_label_thresholds() {
        assert_eq!(OutcomeLabel::from_ret_pct(0.51), OutcomeLabel::Win);
        assert_eq!(OutcomeLabel::from_ret_pct(0.5), OutcomeLabel::Breakeven);
        assert_eq!(OutcomeLabel::from_ret_pct(-0.51), OutcomeLabel::Loss);
        assert_eq!(OutcomeLabel::from_ret_pct(0.0), OutcomeLabel::Breakeven);
    }

    #[test]
    fn advisory_priority_ranks_context_invalidated_first() {
        assert!(AdvisoryKind::ContextInvalidated.priority_rank() < AdvisoryKind::PartialProfit.priority_rank());
        assert!(AdvisoryKind::PartialProfit.priority_rank() < AdvisoryKind::TrendWeakening.priority_rank());
    }
}
