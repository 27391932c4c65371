//! Broker Portfolio/Watchlist Monitor — §4.6c.
//!
//! Every 5 minutes while the market is open, normalizes broker net
//! positions and watchlist entries into `MonitoredPosition`s, runs them
//! through `auto_monitoring::evaluate`, publishes the result to the KV
//! store, and broadcasts it on `portfolio_monitor_update`. Grounded on
//! `original_source/app/services/portfolio_monitor_scheduler.py`;
//! follows the same derive→evaluate→persist→broadcast shape as
//! `monitor::positions`.

use crate::engine::Broadcaster;
use crate::kv::KvStore;
use crate::models::{Direction, Mode};
use crate::monitor::auto_monitoring::{self, HealthAssessment, MonitoredPosition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const POSITIONS_KV_KEY: &str = "portfolio:monitor:positions:last";
pub const WATCHLIST_KV_KEY: &str = "portfolio:monitor:watchlist:last";
const KV_TTL_SECONDS: i64 = 600;

/// One row from the broker's net-positions feed. `product` follows the
/// NSE broker convention: MIS (intraday), CNC (delivery), NRML (carry
/// forward futures/options).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub product: String,
    pub quantity: i64,
    pub average_price: f64,
}

/// A symbol the user is tracking without an open position; monitored
/// purely for SR proximity / news risk, never for stop/target proximity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub reference_price: f64,
}

fn mode_for_product(product: &str) -> Mode {
    match product.to_uppercase().as_str() {
        "MIS" => Mode::Intraday,
        "CNC" => Mode::Swing,
        "NRML" => Mode::Futures,
        _ => Mode::Swing,
    }
}

/// Drops zero-quantity rows (closed positions) and derives direction
/// from the sign of `quantity`. Stop/target prices are not known from
/// the broker feed itself; this monitor relies on SR proximity, the
/// configured volatility bucket, and news risk rather than the
/// stop/target proximity checks `auto_monitoring::evaluate` otherwise
/// performs for Top-Picks-derived positions.
pub fn normalize_positions(positions: &[BrokerPosition]) -> Vec<(Mode, MonitoredPosition)> {
    positions
        .iter()
        .filter(|p| p.quantity != 0)
        .map(|p| {
            let direction = if p.quantity > 0 { Direction::Long } else { Direction::Short };
            let mode = mode_for_product(&p.product);
            (mode, MonitoredPosition { symbol: p.symbol.clone(), direction, entry_price: p.average_price, stop_price: None, target_price: None })
        })
        .collect()
}

fn watchlist_as_positions(entries: &[WatchlistEntry]) -> Vec<MonitoredPosition> {
    entries
        .iter()
        .map(|e| MonitoredPosition { symbol: e.symbol.clone(), direction: Direction::Long, entry_price: e.reference_price, stop_price: None, target_price: None })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorEntry {
    pub symbol: String,
    pub assessment: HealthAssessment,
}

fn run_assessments(
    positions: &[MonitoredPosition],
    current_prices: &HashMap<String, f64>,
    vol_buckets: &HashMap<String, String>,
    sr_proximity: &HashMap<String, bool>,
    news_risk_scores: &HashMap<String, f64>,
) -> Vec<MonitorEntry> {
    positions
        .iter()
        .filter_map(|position| {
            let price = *current_prices.get(&position.symbol)?;
            let vol_bucket = vol_buckets.get(&position.symbol).map(String::as_str).unwrap_or("Normal");
            let proximity = sr_proximity.get(&position.symbol).copied().unwrap_or(false);
            let news_risk = news_risk_scores.get(&position.symbol).copied();
            let assessment = auto_monitoring::evaluate(position, price, vol_bucket, proximity, news_risk);
            Some(MonitorEntry { symbol: position.symbol.clone(), assessment })
        })
        .collect()
}

/// One monitor tick over both the broker's open positions and the
/// user's watchlist. Publishes each result set to the KV store under
/// its own key (10 minute TTL per §6) and broadcasts the combined
/// payload on `portfolio_monitor_update`.
pub async fn run_tick(
    broker_positions: &[BrokerPosition],
    watchlist: &[WatchlistEntry],
    current_prices: &HashMap<String, f64>,
    vol_buckets: &HashMap<String, String>,
    sr_proximity: &HashMap<String, bool>,
    news_risk_scores: &HashMap<String, f64>,
    kv: &Arc<dyn KvStore>,
    broadcaster: Option<&Arc<dyn Broadcaster>>,
) {
    let normalized = normalize_positions(broker_positions);
    let position_only: Vec<MonitoredPosition> = normalized.iter().map(|(_, p)| p.clone()).collect();
    let position_entries = run_assessments(&position_only, current_prices, vol_buckets, sr_proximity, news_risk_scores);

    let watchlist_positions = watchlist_as_positions(watchlist);
    let watchlist_entries = run_assessments(&watchlist_positions, current_prices, vol_buckets, sr_proximity, news_risk_scores);

    let positions_payload = serde_json::json!({ "positions": position_entries });
    let watchlist_payload = serde_json::json!({ "watchlist": watchlist_entries });

    kv.set_json(POSITIONS_KV_KEY, positions_payload.clone(), Some(KV_TTL_SECONDS)).await;
    kv.set_json(WATCHLIST_KV_KEY, watchlist_payload.clone(), Some(KV_TTL_SECONDS)).await;

    if let Some(broadcaster) = broadcaster {
        broadcaster.broadcast("portfolio_monitor_update", serde_json::json!({ "positions": position_entries, "watchlist": watchlist_entries }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InProcessKvStore;

    #[test]
    fn zero_quantity_positions_are_dropped() {
        let positions = vec![
            BrokerPosition { symbol: "SBIN".to_string(), product: "MIS".to_string(), quantity: 0, average_price: 600.0 },
            BrokerPosition { symbol: "TCS".to_string(), product: "CNC".to_string(), quantity: 10, average_price: 3500.0 },
        ];
        let normalized = normalize_positions(&positions);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].0, Mode::Swing);
    }

    #[test]
    fn negative_quantity_maps_to_short_direction() {
        let positions = vec![BrokerPosition { symbol: "SBIN".to_string(), product: "MIS".to_string(), quantity: -10, average_price: 600.0 }];
        let normalized = normalize_positions(&positions);
        assert_eq!(normalized[0].1.direction, Direction::Short);
        assert_eq!(normalized[0].0, Mode::Intraday);
    }

    #[test]
    fn nrml_product_maps_to_futures_mode() {
        let positions = vec![BrokerPosition { symbol: "NIFTYFUT".to_string(), product: "NRML".to_string(), quantity: 50, average_price: 21000.0 }];
        let normalized = normalize_positions(&positions);
        assert_eq!(normalized[0].0, Mode::Futures);
    }

    #[tokio::test]
    async fn run_tick_publishes_both_kv_keys() {
        let kv: Arc<dyn KvStore> = InProcessKvStore::new();
        let positions = vec![BrokerPosition { symbol: "SBIN".to_string(), product: "MIS".to_string(), quantity: 10, average_price: 600.0 }];
        let watchlist = vec![WatchlistEntry { symbol: "TCS".to_string(), reference_price: 3500.0 }];
        let mut prices = HashMap::new();
        prices.insert("SBIN".to_string(), 605.0);
        prices.insert("TCS".to_string(), 3510.0);

        run_tick(&positions, &watchlist, &prices, &HashMap::new(), &HashMap::new(), &HashMap::new(), &kv, None).await;

        assert!(kv.get_json(POSITIONS_KV_KEY).await.is_some());
        assert!(kv.get_json(WATCHLIST_KV_KEY).await.is_some());
    }
}
