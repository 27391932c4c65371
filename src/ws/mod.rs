//! WebSocket fan-out hub (§4.8): pushes `top_picks_update` /
//! `portfolio_monitor_update` / `scalping_monitor_update` events to every
//! connected dashboard client, and lets a client opt into a narrower
//! per-symbol tick stream. Grounded on the teacher's
//! `broadcast::channel<WsServerEvent>` + `handle_socket` idiom in the old
//! `main.rs`, generalized from one fixed channel to the named-channel /
//! per-symbol-subscription shape this crate needs.

use crate::engine::Broadcaster;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct BroadcastEvent {
    channel: String,
    payload: serde_json::Value,
}

/// Connection registry + always-on broadcast channel. `by_symbol` is only
/// consulted for the opt-in per-symbol tick stream; the named channels
/// used by `Broadcaster::broadcast` reach every connection unconditionally
/// (there is no per-client universe subscription in this build).
pub struct WsHub {
    connections: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
    by_symbol: Mutex<HashMap<String, HashSet<Uuid>>>,
    broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

impl WsHub {
    pub fn new() -> Arc<Self> {
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self { connections: Mutex::new(HashMap::new()), by_symbol: Mutex::new(HashMap::new()), broadcast_tx })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn connect(&self) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().insert(conn_id, tx);
        (conn_id, rx)
    }

    fn disconnect(&self, conn_id: Uuid) {
        self.connections.lock().remove(&conn_id);
        let mut by_symbol = self.by_symbol.lock();
        for subscribers in by_symbol.values_mut() {
            subscribers.remove(&conn_id);
        }
        by_symbol.retain(|_, subscribers| !subscribers.is_empty());
    }

    fn subscribe(&self, conn_id: Uuid, symbols: &[String]) {
        let mut by_symbol = self.by_symbol.lock();
        for symbol in symbols {
            by_symbol.entry(symbol.clone()).or_default().insert(conn_id);
        }
    }

    fn unsubscribe(&self, conn_id: Uuid, symbols: &[String]) {
        let mut by_symbol = self.by_symbol.lock();
        for symbol in symbols {
            if let Some(subscribers) = by_symbol.get_mut(symbol) {
                subscribers.remove(&conn_id);
            }
        }
    }

    fn send_to(&self, conn_id: Uuid, message: Message) {
        if let Some(sender) = self.connections.lock().get(&conn_id) {
            let _ = sender.send(message);
        }
    }

    /// Pushes `payload` only to connections subscribed to `symbol`'s tick
    /// channel, bypassing the always-on broadcast channel.
    pub fn publish_symbol_tick(&self, symbol: &str, payload: serde_json::Value) {
        let subscribers = match self.by_symbol.lock().get(symbol) {
            Some(subscribers) => subscribers.clone(),
            None => return,
        };
        if subscribers.is_empty() {
            return;
        }
        let text = serde_json::json!({"channel": "symbol_tick", "symbol": symbol, "payload": payload}).to_string();
        let connections = self.connections.lock();
        for conn_id in subscribers {
            if let Some(sender) = connections.get(&conn_id) {
                let _ = sender.send(Message::Text(text.clone()));
            }
        }
    }
}

impl Broadcaster for WsHub {
    fn broadcast(&self, channel: &str, payload: serde_json::Value) {
        let _ = self.broadcast_tx.send(BroadcastEvent { channel: channel.to_string(), payload });
    }
}

fn symbols_from(value: &serde_json::Value) -> Vec<String> {
    value
        .get("symbols")
        .and_then(|s| s.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Subscribe/Unsubscribe/ping protocol a connected client can speak. Any
/// other/unparsable frame is ignored rather than closing the connection.
fn handle_client_text(hub: &WsHub, conn_id: Uuid, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else { return };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("subscribe") => hub.subscribe(conn_id, &symbols_from(&value)),
        Some("unsubscribe") => hub.unsubscribe(conn_id, &symbols_from(&value)),
        Some("ping") => {
            let timestamp = value.get("data").and_then(|d| d.get("timestamp")).and_then(|t| t.as_i64()).unwrap_or(0);
            let pong = serde_json::json!({"type": "pong", "data": {"timestamp": timestamp}});
            hub.send_to(conn_id, Message::Text(pong.to_string()));
        }
        _ => {}
    }
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<WsHub>) {
    let (conn_id, mut targeted_rx) = hub.connect();
    let mut broadcast_rx = hub.broadcast_tx.subscribe();

    loop {
        tokio::select! {
            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        let text = serde_json::json!({"channel": event.channel, "payload": event.payload}).to_string();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conn_id = %conn_id, skipped, "ws client lagged behind broadcast channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            message = targeted_rx.recv() => {
                match message {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_text(&hub, conn_id, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    hub.disconnect(conn_id);
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<WsHub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// `/ws` route bound to this hub's state, for the composition root to
/// `.merge()` into its top-level router.
pub fn router(hub: Arc<WsHub>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_removes_connection_and_symbol_subscriptions() {
        let hub = WsHub::new();
        let (conn_id, _rx) = hub.connect();
        hub.subscribe(conn_id, &["SBIN".to_string()]);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.by_symbol.lock().contains_key("SBIN"));

        hub.disconnect(conn_id);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.by_symbol.lock().contains_key("SBIN"));
    }

    #[test]
    fn unsubscribe_drops_only_the_named_symbols() {
        let hub = WsHub::new();
        let (conn_id, _rx) = hub.connect();
        hub.subscribe(conn_id, &["SBIN".to_string(), "TCS".to_string()]);
        hub.unsubscribe(conn_id, &["SBIN".to_string()]);
        assert!(!hub.by_symbol.lock().contains_key("SBIN"));
        assert!(hub.by_symbol.lock()["TCS"].contains(&conn_id));
    }

    #[tokio::test]
    async fn publish_symbol_tick_reaches_only_subscribed_connections() {
        let hub = WsHub::new();
        let (subscribed_conn, mut subscribed_rx) = hub.connect();
        let (_other_conn, mut other_rx) = hub.connect();
        hub.subscribe(subscribed_conn, &["SBIN".to_string()]);

        hub.publish_symbol_tick("SBIN", serde_json::json!({"price": 600.0}));

        assert!(subscribed_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_is_a_no_op_with_no_subscribers() {
        let hub = WsHub::new();
        hub.broadcast("top_picks_update", serde_json::json!({}));
    }
}
