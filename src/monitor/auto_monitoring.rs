//! AutoMonitoringAgent alert logic, shared by every position monitor (§4.6).
//!
//! Read-only: a monitor calls `evaluate` once per open position/holding per
//! tick and gets back a health score, an urgency label, and zero or more
//! advisories. Nothing here places or cancels an order.

use crate::models::{AdvisoryKind, Direction, Severity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredPosition {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AdvisoryKind,
    pub severity: Severity,
    pub message: String,
    /// Non-`None` alerts are what §4.6b calls "enforcement=ADVISORY_ONLY":
    /// the monitor persists them via StrategyExitTracker.
    pub recommended_exit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub health_score: f64,
    pub urgency: Severity,
    pub alerts: Vec<Alert>,
}

fn bump_urgency(current: Severity, candidate: Severity) -> Severity {
    fn rank(s: Severity) -> u8 {
        match s {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
    if rank(candidate) > rank(current) {
        candidate
    } else {
        current
    }
}

/// Stop proximity ≤3% → CRITICAL, -40 health. Target proximity within 5% →
/// MEDIUM(=Warning). Volatility HIGH → Warning. SR proximity → Warning. A
/// `news_risk_score` ≥75 raises a CONTEXT_INVALIDATED exit advisory;
/// otherwise, when a risk score is present at all, a PARTIAL_PROFIT
/// scale-down suggestion. `CONTEXT_INVALIDATED` is always exit-driving;
/// `PARTIAL_PROFIT` only suggests scaling, never a hard exit.
pub fn evaluate(position: &MonitoredPosition, current_price: f64, vol_bucket: &str, sr_proximity: bool, news_risk_score: Option<f64>) -> HealthAssessment {
    let mut health_score = 100.0;
    let mut urgency = Severity::Info;
    let mut alerts = Vec::new();

    if let Some(stop) = position.stop_price {
        if current_price > 0.0 && ((current_price - stop).abs() / current_price) <= 0.03 {
            health_score -= 40.0;
            urgency = bump_urgency(urgency, Severity::Critical);
            alerts.push(Alert {
                kind: AdvisoryKind::ContextInvalidated,
                severity: Severity::Critical,
                message: format!("{} within 3% of stop {:.2}", position.symbol, stop),
                recommended_exit_price: Some(stop),
            });
        }
    }

    if let Some(target) = position.target_price {
        if current_price > 0.0 && ((target - current_price).abs() / current_price) <= 0.05 {
            urgency = bump_urgency(urgency, Severity::Warning);
            alerts.push(Alert {
                kind: AdvisoryKind::PartialProfit,
                severity: Severity::Warning,
                message: format!("{} within 5% of target {:.2}", position.symbol, target),
                recommended_exit_price: Some(target),
            });
        }
    }

    if vol_bucket == "High" {
        urgency = bump_urgency(urgency, Severity::Warning);
        alerts.push(Alert {
            kind: AdvisoryKind::TrendWeakening,
            severity: Severity::Warning,
            message: format!("{} volatility regime is High", position.symbol),
            recommended_exit_price: None,
        });
    }

    if sr_proximity {
        urgency = bump_urgency(urgency, Severity::Warning);
        alerts.push(Alert {
            kind: AdvisoryKind::PriceStretched,
            severity: Severity::Warning,
            message: format!("{} is near a support/resistance level", position.symbol),
            recommended_exit_price: None,
        });
    }

    if let Some(score) = news_risk_score {
        if score >= 75.0 {
            urgency = bump_urgency(urgency, Severity::Critical);
            alerts.push(Alert {
                kind: AdvisoryKind::ContextInvalidated,
                severity: Severity::Critical,
                message: format!("{} news risk score {:.0} invalidates context", position.symbol, score),
                recommended_exit_price: Some(current_price),
            });
        } else {
            urgency = bump_urgency(urgency, Severity::Warning);
            alerts.push(Alert {
                kind: AdvisoryKind::PartialProfit,
                severity: Severity::Warning,
                message: format!("{} elevated news risk score {:.0}, consider scaling down", position.symbol, score),
                recommended_exit_price: None,
            });
        }
    }

    HealthAssessment { health_score, urgency, alerts }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> MonitoredPosition {
        MonitoredPosition { symbol: "SBIN".to_string(), direction: Direction::Long, entry_price: 600.0, stop_price: Some(590.0), target_price: Some(620.0) }
    }

    #[test]
    fn stop_proximity_triggers_critical_and_deducts_health() {
        let assessment = evaluate(&position(), 591.0, "Normal", false, None);
        assert_eq!(assessment.urgency, Severity::Critical);
        assert_eq!(assessment.health_score, 60.0);
        assert!(assessment.alerts.iter().any(|a| a.kind == AdvisoryKind::ContextInvalidated));
    }

    #[test]
    fn target_proximity_triggers_warning_without_health_deduction() {
        let assessment = evaluate(&position(), 610.0, "Normal", false, None);
        assert_eq!(assessment.urgency, Severity::Warning);
        assert_eq!(assessment.health_score, 100.0);
    }

    #[test]
    fn high_news_risk_score_is_context_invalidated() {
        let assessment = evaluate(&position(), 605.0, "Normal", false, Some(80.0));
        assert!(assessment.alerts.iter().any(|a| a.kind == AdvisoryKind::ContextInvalidated && a.recommended_exit_price.is_some()));
    }

    #[test]
    fn moderate_news_risk_score_is_partial_profit_only() {
        let assessment = evaluate(&position(), 605.0, "Normal", false, Some(50.0));
        let news_alert = assessment.alerts.iter().find(|a| a.message.contains("news risk")).unwrap();
        assert_eq!(news_alert.kind, AdvisoryKind::PartialProfit);
        assert!(news_alert.recommended_exit_price.is_none());
    }

    #[test]
    fn calm_position_has_no_alerts() {
        let assessment = evaluate(&position(), 605.0, "Normal", false, None);
        assert!(assessment.alerts.is_empty());
        assert_eq!(assessment.urgency, Severity::Info);
    }
}
