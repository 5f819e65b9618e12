//! Websocket trade-update stream.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::http::{sequence_from, ApiOrder};
use super::types::{BrokerEvent, BrokerEventKind};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct StreamMessage {
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TradeUpdate {
    event: String,
    order: ApiOrder,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AuthStatus {
    status: String,
}

/// Parse one `trade_updates` message into a broker event.
///
/// Returns `None` for other streams and for update kinds the order manager
/// does not act on (e.g. `pending_cancel`).
pub fn parse_trade_update(raw: &str) -> Option<BrokerEvent> {
    let message: StreamMessage = serde_json::from_str(raw).ok()?;
    if message.stream != "trade_updates" {
        return None;
    }
    let update: TradeUpdate = serde_json::from_value(message.data).ok()?;

    let kind = match update.event.as_str() {
        "new" | "accepted" | "pending_new" => BrokerEventKind::Accepted,
        "partial_fill" => BrokerEventKind::PartialFill,
        "fill" => BrokerEventKind::Fill,
        "canceled" | "expired" | "done_for_day" => BrokerEventKind::Cancelled,
        "rejected" => BrokerEventKind::Rejected {
            reason: "rejected by broker".to_string(),
        },
        other => {
            debug!(event = other, "Ignoring trade update");
            return None;
        }
    };

    let order = update.order;
    Some(BrokerEvent {
        sequence: sequence_from(order.updated_at),
        timestamp: update.timestamp.unwrap_or(order.updated_at),
        client_order_id: order.client_order_id,
        broker_order_id: order.id,
        kind,
        filled_quantity: order.filled_qty,
        avg_fill_price: order.filled_avg_price,
    })
}

/// Trade-update websocket client.
pub struct EventStream {
    url: String,
    api_key: String,
    api_secret: String,
}

impl EventStream {
    pub fn new(url: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    /// Connect, authenticate and listen; updates arrive on the returned channel
    /// until the socket closes.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<BrokerEvent>> {
        info!(url = %self.url, "Connecting to trade update stream");

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to trade update stream")?;
        let (mut write, mut read) = ws_stream.split();

        let auth = json!({"action": "auth", "key": self.api_key, "secret": self.api_secret});
        write
            .send(Message::text(auth.to_string()))
            .await
            .context("Failed to send stream authentication")?;

        let listen = json!({"action": "listen", "data": {"streams": ["trade_updates"]}});
        write
            .send(Message::text(listen.to_string()))
            .await
            .context("Failed to subscribe to trade updates")?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // keep the sink alive so the server does not see a half-closed socket
            let _write = write;
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => text.to_string(),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => {
                        info!("Trade update stream closed by server");
                        return;
                    }
                    Err(e) => {
                        error!("Trade update stream error: {}", e);
                        return;
                    }
                    _ => continue,
                };

                if let Some(status) = authorization_status(&text) {
                    if status != "authorized" {
                        error!(status = %status, "Trade update stream authentication failed");
                        return;
                    }
                    debug!("Trade update stream authorized");
                    continue;
                }

                if let Some(event) = parse_trade_update(&text) {
                    if tx.send(event).await.is_err() {
                        warn!("Trade update receiver dropped");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn authorization_status(raw: &str) -> Option<String> {
    let message: StreamMessage = serde_json::from_str(raw).ok()?;
    if message.stream != "authorization" {
        return None;
    }
    serde_json::from_value::<AuthStatus>(message.data)
        .ok()
        .map(|a| a.status)
}
