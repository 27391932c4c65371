//! Policy registry — §3 "Policy", seeded per
//! `original_source/app/jobs/seed_rl_policy.py`.
//!
//! At most one policy has `status=ACTIVE`; activation sets `activated_at`
//! and retires the current ACTIVE policy in the same transaction.

use crate::models::{ExitProfile, Policy, PolicyStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS policies (
    policy_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    config TEXT NOT NULL,
    metrics TEXT NOT NULL,
    activated_at TEXT,
    deactivated_at TEXT
);
"#;

pub struct PolicyRegistry {
    db_path: PathBuf,
    /// Guards the bandit metrics read-modify-write cycle (§5: shared state
    /// mutated from multiple tasks needs a mutex); the DB connection itself
    /// is still opened fresh per operation per the store-wide policy above.
    bandit_write_lock: parking_lot::Mutex<()>,
}

/// One `{n, q, last_update}` cell of `metrics.bandit[mode].contexts[ctx].actions[id]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BanditActionState {
    pub n: u64,
    pub q: f64,
    pub last_update: DateTime<Utc>,
}

impl Default for BanditActionState {
    fn default() -> Self {
        Self { n: 0, q: 0.0, last_update: Utc::now() }
    }
}

/// Per-mode view extracted from the active Policy's `config` blob: weight
/// vector, exit profiles, and bandit configuration. Mirrors what
/// `AgentCoordinator`/`TopPicksEngine`/`learning::bandit` each need.
#[derive(Debug, Clone, Default)]
pub struct ModePolicy {
    pub weights: HashMap<String, f64>,
    pub exit_profiles: HashMap<String, ExitProfile>,
    pub exit_bandit: Option<BanditConfig>,
    pub entry_bandit: Option<EntryBanditConfig>,
    pub evaluation_horizon_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BanditConfig {
    pub enabled: bool,
    pub epsilon: f64,
    pub min_trades_per_action: u32,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EntryBanditConfig {
    pub enabled: bool,
    pub epsilon: f64,
    pub min_trades_per_action: u32,
    pub actions: Vec<String>,
    pub default_action: String,
}

impl PolicyRegistry {
    pub fn new(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { db_path, bandit_write_lock: parking_lot::Mutex::new(()) })
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    /// All bandit action states under `metrics./{bandit_kind}/{mode}/contexts/{ctx}/actions`.
    pub fn load_bandit_contexts(&self, mode: &str, bandit_kind: &str) -> anyhow::Result<HashMap<String, HashMap<String, BanditActionState>>> {
        let policy = self.get_active_policy()?.ok_or_else(|| anyhow::anyhow!("no active policy"))?;
        let ptr = format!("/{bandit_kind}/{mode}/contexts");
        let Some(contexts) = policy.metrics.pointer(&ptr).and_then(|v| v.as_object()) else {
            return Ok(HashMap::new());
        };
        let mut out = HashMap::new();
        for (ctx, ctx_val) in contexts {
            let Some(actions) = ctx_val.get("actions").and_then(|a| a.as_object()) else { continue };
            let mut action_states = HashMap::new();
            for (action_id, state_val) in actions {
                if let Ok(state) = serde_json::from_value::<BanditActionState>(state_val.clone()) {
                    action_states.insert(action_id.clone(), state);
                }
            }
            out.insert(ctx.clone(), action_states);
        }
        Ok(out)
    }

    /// Read-modify-write of one `{n,q,last_update}` cell, serialized by
    /// `bandit_write_lock` against concurrent bandit updates in this process.
    pub fn update_bandit_action(&self, mode: &str, bandit_kind: &str, ctx: &str, action: &str, state: BanditActionState) -> anyhow::Result<()> {
        let _guard = self.bandit_write_lock.lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let (policy_id, metrics_raw): (String, String) = tx.query_row(
            "SELECT policy_id, metrics FROM policies WHERE status = 'ACTIVE' LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut metrics: serde_json::Value = serde_json::from_str(&metrics_raw).unwrap_or(serde_json::Value::Null);
        let ptr = format!("/{bandit_kind}/{mode}/contexts/{ctx}/actions/{action}");
        let slot = ensure_object(&mut metrics, &ptr);
        *slot = serde_json::to_value(state)?;
        tx.execute(
            "UPDATE policies SET metrics = ?1 WHERE policy_id = ?2",
            params![metrics.to_string(), policy_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Seeds the baseline policy once; no-op if any policy already exists.
    pub fn seed_default_if_absent(&self) -> anyhow::Result<()> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM policies", [], |r| r.get(0))?;
        if count > 0 {
            return Ok(());
        }
        let policy = default_baseline_policy();
        conn.execute(
            "INSERT INTO policies (policy_id, name, description, status, config, metrics, activated_at, deactivated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                policy.policy_id,
                policy.name,
                policy.description,
                "ACTIVE",
                policy.config.to_string(),
                policy.metrics.to_string(),
                chrono::Utc::now().to_rfc3339(),
                Option::<String>::None,
            ],
        )?;
        Ok(())
    }

    pub fn get_active_policy(&self) -> anyhow::Result<Option<Policy>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT policy_id, name, description, status, config, metrics, activated_at, deactivated_at
             FROM policies WHERE status = 'ACTIVE' LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_policy(row)?))
        } else {
            Ok(None)
        }
    }

    /// Activates `policy_id`, retiring whatever was ACTIVE, inside one
    /// transaction so "at most one ACTIVE policy" never transiently breaks.
    pub fn activate(&self, policy_id: &str) -> anyhow::Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE policies SET status = 'RETIRED', deactivated_at = ?1 WHERE status = 'ACTIVE'",
            params![now],
        )?;
        let updated = tx.execute(
            "UPDATE policies SET status = 'ACTIVE', activated_at = ?1, deactivated_at = NULL WHERE policy_id = ?2",
            params![now, policy_id],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("policy {policy_id} not found"));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_mode_policy(&self, mode: &str) -> anyhow::Result<ModePolicy> {
        let policy = self.get_active_policy()?;
        Ok(match policy {
            Some(p) => extract_mode_policy(&p.config, mode),
            None => ModePolicy::default(),
        })
    }
}

/// Deep-sets a `/a/b/c` JSON pointer path, creating missing objects along
/// the way, and returns a mutable reference to the final slot.
fn ensure_object<'a>(root: &'a mut serde_json::Value, pointer: &str) -> &'a mut serde_json::Value {
    if !root.is_object() {
        *root = serde_json::json!({});
    }
    let mut cur = root;
    for segment in pointer.trim_start_matches('/').split('/') {
        if !cur.is_object() {
            *cur = serde_json::json!({});
        }
        cur = cur.as_object_mut().unwrap().entry(segment.to_string()).or_insert(serde_json::json!({}));
    }
    cur
}

fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<Policy> {
    let status_raw: String = row.get(3)?;
    let config_raw: String = row.get(4)?;
    let metrics_raw: String = row.get(5)?;
    Ok(Policy {
        policy_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: match status_raw.as_str() {
            "ACTIVE" => PolicyStatus::Active,
            "RETIRED" => PolicyStatus::Retired,
            _ => PolicyStatus::Draft,
        },
        config: serde_json::from_str(&config_raw).unwrap_or(serde_json::Value::Null),
        metrics: serde_json::from_str(&metrics_raw).unwrap_or(serde_json::Value::Null),
        activated_at: row.get::<_, Option<String>>(6)?.and_then(|s| s.parse().ok()),
        deactivated_at: row.get::<_, Option<String>>(7)?.and_then(|s| s.parse().ok()),
    })
}

fn extract_mode_policy(config: &serde_json::Value, mode: &str) -> ModePolicy {
    let mode_cfg = config.pointer(&format!("/modes/{mode}"));
    let weights = mode_cfg
        .and_then(|c| c.get("weights"))
        .and_then(|w| w.as_object())
        .map(|obj| obj.iter().filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f))).collect())
        .unwrap_or_default();

    let exit_profiles = mode_cfg
        .and_then(|c| c.get("exit_profiles"))
        .and_then(|e| e.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(id, v)| serde_json::from_value::<ExitProfile>(v.clone()).ok().map(|p| (id.clone(), p)))
                .collect()
        })
        .unwrap_or_default();

    let exit_bandit = mode_cfg.and_then(|c| c.get("bandit")).and_then(parse_bandit);
    let entry_bandit = mode_cfg.and_then(|c| c.get("entry_bandit")).and_then(parse_entry_bandit);
    let evaluation_horizon_days = mode_cfg
        .and_then(|c| c.get("evaluation"))
        .and_then(|e| e.get("lookback_days"))
        .and_then(|d| d.as_u64())
        .map(|d| d as u32);

    ModePolicy { weights, exit_profiles, exit_bandit, entry_bandit, evaluation_horizon_days }
}

fn parse_bandit(v: &serde_json::Value) -> Option<BanditConfig> {
    Some(BanditConfig {
        enabled: v.get("enabled")?.as_bool()?,
        epsilon: v.get("epsilon")?.as_f64()?,
        min_trades_per_action: v.get("min_trades_per_action")?.as_u64()? as u32,
        actions: v.get("actions")?.as_array()?.iter().filter_map(|a| a.as_str().map(String::from)).collect(),
    })
}

fn parse_entry_bandit(v: &serde_json::Value) -> Option<EntryBanditConfig> {
    let actions = v.get("actions")?;
    let action_names: Vec<String> = if let Some(obj) = actions.as_object() {
        obj.keys().cloned().collect()
    } else {
        actions.as_array()?.iter().filter_map(|a| a.as_str().map(String::from)).collect()
    };
    Some(EntryBanditConfig {
        enabled: v.get("enabled")?.as_bool()?,
        epsilon: v.get("epsilon")?.as_f64()?,
        min_trades_per_action: v.get("min_trades_per_action")?.as_u64()? as u32,
        actions: action_names,
        default_action: v.get("default_action")?.as_str()?.to_string(),
    })
}

/// Baseline policy config, shaped after `seed_rl_policy.py`: per-mode exit
/// profiles, bandit/entry_bandit sections, evaluation windows.
fn default_baseline_policy() -> Policy {
    let config = serde_json::json!({
        "modes": {
            "Scalping": {
                "weights": {"Technical": 0.3, "PatternRecognition": 0.25, "MarketRegime": 0.2, "Microstructure": 0.15, "Risk": 0.1},
                "exit_profiles": {
                    "scalping_safe": exit_profile_json("scalping_safe", "percent", 0.3, "percent", 0.5, true, "percent", 0.2),
                    "scalping_balanced": exit_profile_json("scalping_balanced", "percent", 0.4, "percent", 0.8, true, "percent", 0.3),
                    "scalping_aggressive": exit_profile_json("scalping_aggressive", "percent", 0.5, "percent", 1.2, true, "percent", 0.4)
                },
                "bandit": {"enabled": true, "epsilon": 0.2, "min_trades_per_action": 30, "actions": ["scalping_safe", "scalping_balanced", "scalping_aggressive"]},
                "evaluation": {"lookback_days": 30, "timeframe": "5m", "evaluation_horizon": "SCALPING"},
                "entry_bandit": {
                    "enabled": true, "epsilon": 0.15, "min_trades_per_action": 30,
                    "actions": {"conservative": {"threshold": 65}, "standard": {"threshold": 55}, "permissive": {"threshold": 45}},
                    "regime_bias": {"long_mult": 1.0, "short_mult": 1.0},
                    "default_action": "standard"
                }
            },
            "Intraday": {
                "weights": {"Technical": 0.2, "PatternRecognition": 0.18, "MarketRegime": 0.15, "GlobalMarket": 0.12, "Options": 0.12, "Sentiment": 0.1, "PolicyMacro": 0.08, "WatchlistIntelligence": 0.03, "Microstructure": 0.01, "Risk": 0.01},
                "exit_profiles": {
                    "intraday_safe": exit_profile_json("intraday_safe", "percent", 1.0, "percent", 2.0, true, "rr_multiple", 1.0),
                    "intraday_balanced": exit_profile_json("intraday_balanced", "percent", 1.5, "percent", 3.0, true, "rr_multiple", 1.2)
                },
                "bandit": {"enabled": true, "epsilon": 0.2, "min_trades_per_action": 30, "actions": ["intraday_safe", "intraday_balanced"]},
                "evaluation": {"lookback_days": 30, "timeframe": "15m", "evaluation_horizon": "EOD"},
                "entry_bandit": {
                    "enabled": true, "epsilon": 0.2, "min_trades_per_action": 30,
                    "actions": {"conservative": {"threshold": 65}, "standard": {"threshold": 55}},
                    "regime_bias": {"long_mult": 1.0, "short_mult": 1.0},
                    "default_action": "standard"
                }
            },
            "Swing": {
                "weights": {"Technical": 0.2, "PatternRecognition": 0.18, "MarketRegime": 0.2, "GlobalMarket": 0.12, "PolicyMacro": 0.15, "Sentiment": 0.1, "Risk": 0.05},
                "exit_profiles": {
                    "swing_tight": exit_profile_json("swing_tight", "percent", 3.0, "percent", 6.0, false, "percent", 0.0),
                    "swing_trend": exit_profile_json("swing_trend", "atr_multiple", 2.0, "rr_multiple", 2.5, true, "rr_multiple", 1.5)
                },
                "bandit": {"enabled": true, "epsilon": 0.15, "min_trades_per_action": 20, "actions": ["swing_tight", "swing_trend"]},
                "evaluation": {"lookback_days": 60, "timeframe": "1d", "evaluation_horizon": "FIXED_DAYS_5"}
            },
            "Options": {
                "weights": {"Options": 0.35, "Technical": 0.2, "MarketRegime": 0.2, "GlobalMarket": 0.15, "Risk": 0.1},
                "exit_profiles": {
                    "options_intraday": exit_profile_json("options_intraday", "percent", 20.0, "percent", 40.0, true, "percent", 10.0),
                    "options_swing": exit_profile_json("options_swing", "percent", 30.0, "percent", 60.0, true, "percent", 15.0)
                },
                "bandit": {"enabled": true, "epsilon": 0.2, "min_trades_per_action": 20, "actions": ["options_intraday", "options_swing"]},
                "evaluation": {"lookback_days": 30, "timeframe": "15m", "evaluation_horizon": "EOD"}
            },
            "Futures": {
                "weights": {"Technical": 0.25, "MarketRegime": 0.2, "GlobalMarket": 0.2, "PolicyMacro": 0.2, "Risk": 0.15},
                "exit_profiles": {
                    "futures_intraday": exit_profile_json("futures_intraday", "percent", 0.8, "percent", 1.6, true, "rr_multiple", 1.0),
                    "futures_swing": exit_profile_json("futures_swing", "atr_multiple", 1.5, "rr_multiple", 2.0, true, "rr_multiple", 1.2)
                },
                "bandit": {"enabled": true, "epsilon": 0.2, "min_trades_per_action": 20, "actions": ["futures_intraday", "futures_swing"]},
                "evaluation": {"lookback_days": 30, "timeframe": "1h", "evaluation_horizon": "EOD"}
            }
        }
    });

    Policy {
        policy_id: "policy-baseline-v1".to_string(),
        name: "baseline".to_string(),
        description: "seeded baseline exit profiles and bandit configuration".to_string(),
        status: PolicyStatus::Active,
        config,
        metrics: serde_json::json!({}),
        activated_at: Some(chrono::Utc::now()),
        deactivated_at: None,
    }
}

#[allow(clippy::too_many_arguments)]
fn exit_profile_json(
    id: &str,
    stop_type: &str,
    stop_value: f64,
    target_type: &str,
    target_value: f64,
    trailing_enabled: bool,
    activation_type: &str,
    activation_value: f64,
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": id,
        "stop": {"type": stop_type, "value": stop_value},
        "target": {"type": target_type, "value": target_value},
        "trailing": {
            "enabled": trailing_enabled,
            "activation_type": activation_type,
            "activation_value": activation_value,
            "trail_type": "percent",
            "trail_value": activation_value / 2.0
        },
        "time_stop": {"enabled": true, "max_hold_minutes": 60.0},
        "exit_priority": {"order": ["STOP", "TRAIL", "TARGET", "TIME"]}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_creates_exactly_one_active_policy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        registry.seed_default_if_absent().unwrap(); // second call is a no-op
        let active = registry.get_active_policy().unwrap().unwrap();
        assert_eq!(active.status, PolicyStatus::Active);
    }

    #[test]
    fn activate_retires_previous_active_policy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        let conn = Connection::open(dir.path().join("arise.db")).unwrap();
        conn.execute(
            "INSERT INTO policies (policy_id, name, description, status, config, metrics) VALUES ('v2','v2','','DRAFT','{}','{}')",
            [],
        )
        .unwrap();
        registry.activate("v2").unwrap();
        let active = registry.get_active_policy().unwrap().unwrap();
        assert_eq!(active.policy_id, "v2");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM policies WHERE status='ACTIVE'", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn mode_policy_extracts_weights_and_exit_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        let mp = registry.get_mode_policy("Intraday").unwrap();
        assert!(mp.weights.contains_key("Technical"));
        assert!(mp.exit_profiles.contains_key("intraday_safe"));
        assert!(mp.exit_bandit.unwrap().min_trades_per_action == 30);
    }

    #[test]
    fn update_bandit_action_round_trips_through_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        let state = BanditActionState { n: 4, q: 0.37, last_update: Utc::now() };
        registry.update_bandit_action("Scalping", "bandit", "High|Long", "scalping_balanced", state).unwrap();

        let contexts = registry.load_bandit_contexts("Scalping", "bandit").unwrap();
        let actions = contexts.get("High|Long").expect("context present");
        let loaded = actions.get("scalping_balanced").expect("action present");
        assert_eq!(loaded.n, 4);
        assert!((loaded.q - 0.37).abs() < 1e-12);
    }

    #[test]
    fn update_bandit_action_preserves_sibling_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        registry
            .update_bandit_action("Scalping", "bandit", "Low|Long", "scalping_safe", BanditActionState { n: 1, q: 0.1, last_update: Utc::now() })
            .unwrap();
        registry
            .update_bandit_action("Scalping", "bandit", "High|Short", "scalping_aggressive", BanditActionState { n: 2, q: -0.2, last_update: Utc::now() })
            .unwrap();

        let contexts = registry.load_bandit_contexts("Scalping", "bandit").unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts["Low|Long"].contains_key("scalping_safe"));
        assert!(contexts["High|Short"].contains_key("scalping_aggressive"));
    }

    #[test]
    fn load_bandit_contexts_empty_before_any_update() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PolicyRegistry::new(dir.path().join("arise.db")).unwrap();
        registry.seed_default_if_absent().unwrap();
        let contexts = registry.load_bandit_contexts("Scalping", "bandit").unwrap();
        assert!(contexts.is_empty());
    }
}
