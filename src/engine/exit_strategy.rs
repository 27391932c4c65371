//! Per-pick ExitStrategy synthesis — §4.5 step 6.
//!
//! Scalping picks get an ATR%-shaped ladder synthesized directly (agent
//! interiors, including ATR math, are out of scope per §1 and approximated
//! from `vol_bucket`); every other mode attaches a PolicyStore-configured
//! `ExitProfile` resolved by the exit bandit (§4.10).

use crate::models::ExitProfile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetsLadder {
    pub tp1_pct: f64,
    pub tp2_pct: f64,
    pub tp3_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalpingExitStrategy {
    pub target_pct: f64,
    pub stop_pct: f64,
    pub max_hold_mins: u32,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
    pub targets_ladder: TargetsLadder,
}

/// Approximate ATR% per §4.5: "ATR-based target_pct/stop_pct around ATR%".
/// Agent-interior ATR math is out of scope (§1); `vol_bucket` stands in as
/// the nearest available volatility proxy.
fn approx_atr_pct(vol_bucket: &str) -> f64 {
    match vol_bucket {
        "High" => 1.2,
        "Low" => 0.3,
        _ => 0.6,
    }
}

/// `max_hold_mins` defaults to 60 per §4.5.
pub fn synthesize_scalping_exit(vol_bucket: &str) -> ScalpingExitStrategy {
    let atr_pct = approx_atr_pct(vol_bucket);
    ScalpingExitStrategy {
        target_pct: atr_pct * 2.0,
        stop_pct: atr_pct,
        max_hold_mins: 60,
        trailing_activation_pct: atr_pct,
        trailing_distance_pct: atr_pct * 0.5,
        targets_ladder: TargetsLadder {
            tp1_pct: atr_pct * 0.75,
            tp2_pct: atr_pct * 1.5,
            tp3_pct: atr_pct * 2.5,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ExitStrategy {
    Scalping(ScalpingExitStrategy),
    Profile(ExitProfile),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_vol_bucket_widens_target_and_stop() {
        let low = synthesize_scalping_exit("Low");
        let high = synthesize_scalping_exit("High");
        assert!(high.target_pct > low.target_pct);
        assert!(high.stop_pct > low.stop_pct);
    }

    #[test]
    fn target_is_always_roughly_double_the_stop() {
        let s = synthesize_scalping_exit("Normal");
        assert!((s.target_pct - s.stop_pct * 2.0).abs() < 1e-9);
    }
}
