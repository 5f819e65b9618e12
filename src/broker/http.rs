//! REST adapter for an Alpaca-style brokerage API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::stream::EventStream;
use super::types::*;
use super::BrokerClient;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Order as returned by the REST API and inside stream updates.
#[derive(Debug, Clone, Deserialize)]
pub(super) struct ApiOrder {
    pub id: String,
    pub client_order_id: String,
    pub status: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub filled_avg_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl ApiOrder {
    pub fn into_state(self) -> BrokerOrderState {
        BrokerOrderState {
            status: map_status(&self.status, self.filled_qty),
            sequence: sequence_from(self.updated_at),
            client_order_id: self.client_order_id,
            broker_order_id: self.id,
            filled_quantity: self.filled_qty,
            avg_fill_price: self.filled_avg_price,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiOrderRequest<'a> {
    symbol: &'a str,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    time_in_force: TimeInForce,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    limit_price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    stop_price: Option<Decimal>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiAccount {
    #[serde(with = "rust_decimal::serde::str")]
    equity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    buying_power: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cash: Decimal,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Broker status string to the local status set.
pub(super) fn map_status(status: &str, filled: Decimal) -> BrokerOrderStatus {
    match status {
        "filled" => BrokerOrderStatus::Filled,
        "partially_filled" => BrokerOrderStatus::PartiallyFilled,
        "canceled" | "expired" | "done_for_day" => BrokerOrderStatus::Cancelled,
        "rejected" => BrokerOrderStatus::Rejected,
        _ if filled > Decimal::ZERO => BrokerOrderStatus::PartiallyFilled,
        _ => BrokerOrderStatus::Accepted,
    }
}

/// The API has no per-order version counter; `updated_at` is monotonic per order.
pub(super) fn sequence_from(updated_at: DateTime<Utc>) -> u64 {
    updated_at.timestamp_micros().max(0) as u64
}

/// Brokerage REST client.
pub struct HttpBroker {
    http: Client,
    base_url: String,
    stream_url: String,
    api_key: String,
    api_secret: String,
    timeout: Duration,
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            stream_url: config.stream_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            timeout,
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(KEY_HEADER, &self.api_key)
            .header(SECRET_HEADER, &self.api_secret)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BrokerError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);
        warn!(%status, %message, "Broker request failed");

        Err(match status {
            StatusCode::NOT_FOUND => BrokerError::UnknownOrder(message),
            StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY => {
                BrokerError::Rejected(message)
            }
            _ => BrokerError::Transport(format!("{status}: {message}")),
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> BrokerError {
        if error.is_timeout() {
            BrokerError::Timeout(self.timeout.as_millis() as u64)
        } else {
            BrokerError::Transport(error.to_string())
        }
    }

    async fn order_by_client_id(&self, client_order_id: &str) -> Result<ApiOrder, BrokerError> {
        let url = format!("{}/v2/orders:by_client_order_id", self.base_url);
        let response = self
            .send(
                self.http
                    .get(&url)
                    .query(&[("client_order_id", client_order_id)]),
            )
            .await?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, BrokerError> {
    response
        .json()
        .await
        .map_err(|e| BrokerError::Decode(e.to_string()))
}

#[async_trait]
impl BrokerClient for HttpBroker {
    #[instrument(skip(self, spec), fields(client_order_id = %spec.client_order_id))]
    async fn submit_order(&self, spec: &OrderSpec) -> Result<BrokerAck, BrokerError> {
        let url = format!("{}/v2/orders", self.base_url);
        let body = ApiOrderRequest {
            symbol: &spec.symbol,
            qty: spec.quantity,
            side: spec.side,
            order_type: spec.order_type,
            time_in_force: spec.time_in_force,
            limit_price: spec.limit_price,
            stop_price: spec.stop_price,
            client_order_id: &spec.client_order_id,
        };

        let response = self.send(self.http.post(&url).json(&body)).await?;
        let order: ApiOrder = decode(response).await?;
        debug!(broker_order_id = %order.id, status = %order.status, "Order submitted");
        Ok(order.into_state())
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, client_order_id: &str) -> Result<BrokerAck, BrokerError> {
        let order = self.order_by_client_id(client_order_id).await?;
        let url = format!("{}/v2/orders/{}", self.base_url, order.id);
        self.send(self.http.delete(&url)).await?;

        // DELETE answers 204; read back the order for the ack
        let order = self.order_by_client_id(client_order_id).await?;
        Ok(order.into_state())
    }

    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let account: ApiAccount = decode(self.send(self.http.get(&url)).await?).await?;
        Ok(AccountInfo {
            equity: account.equity,
            buying_power: account.buying_power,
            cash: account.cash,
        })
    }

    async fn order_states(&self) -> Result<Vec<BrokerOrderState>, BrokerError> {
        let url = format!("{}/v2/orders", self.base_url);
        let request = self
            .http
            .get(&url)
            .query(&[("status", "all"), ("limit", "500"), ("direction", "asc")]);
        let orders: Vec<ApiOrder> = decode(self.send(request).await?).await?;
        Ok(orders.into_iter().map(ApiOrder::into_state).collect())
    }

    async fn stream_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError> {
        EventStream::new(&self.stream_url, &self.api_key, &self.api_secret)
            .subscribe()
            .await
            .map_err(|e| BrokerError::Transport(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(server: &MockServer) -> HttpBroker {
        let config = BrokerConfig {
            base_url: server.uri(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..BrokerConfig::default()
        };
        HttpBroker::new(&config, Duration::from_secs(2)).unwrap()
    }

    fn order_json(status: &str, filled: &str, avg: Option<&str>) -> serde_json::Value {
        json!({
            "id": "b-123",
            "client_order_id": "cct-1",
            "status": status,
            "filled_qty": filled,
            "filled_avg_price": avg,
            "updated_at": "2026-03-02T14:30:00.250Z"
        })
    }

    fn market_buy() -> OrderSpec {
        OrderSpec {
            client_order_id: "cct-1".into(),
            symbol: "ACME".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(500),
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
        }
    }

    #[tokio::test]
    async fn test_submit_sends_auth_and_string_quantities() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .and(header(KEY_HEADER, "key"))
            .and(header(SECRET_HEADER, "secret"))
            .and(body_partial_json(json!({
                "symbol": "ACME",
                "qty": "500",
                "side": "buy",
                "type": "market",
                "client_order_id": "cct-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("accepted", "0", None)))
            .expect(1)
            .mount(&server)
            .await;

        let ack = broker(&server).submit_order(&market_buy()).await.unwrap();
        assert_eq!(ack.status, BrokerOrderStatus::Accepted);
        assert_eq!(ack.broker_order_id, "b-123");
        assert_eq!(ack.filled_quantity, Decimal::ZERO);
        assert!(ack.sequence > 0);
    }

    #[tokio::test]
    async fn test_submit_rejection_maps_to_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({"message": "insufficient buying power"})),
            )
            .mount(&server)
            .await;

        let err = broker(&server).submit_order(&market_buy()).await.unwrap_err();
        assert_eq!(err, BrokerError::Rejected("insufficient buying power".into()));
    }

    #[tokio::test]
    async fn test_order_states_maps_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders"))
            .and(query_param("status", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                order_json("filled", "500", Some("100.02")),
                order_json("canceled", "0", None),
            ])))
            .mount(&server)
            .await;

        let states = broker(&server).order_states().await.unwrap();
        assert_eq!(states[0].status, BrokerOrderStatus::Filled);
        assert_eq!(states[0].avg_fill_price, Some(dec!(100.02)));
        assert_eq!(states[1].status, BrokerOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_looks_up_broker_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders:by_client_order_id"))
            .and(query_param("client_order_id", "cct-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_json("canceled", "0", None)))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/orders/b-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let ack = broker(&server).cancel_order("cct-1").await.unwrap();
        assert_eq!(ack.status, BrokerOrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_order_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders:by_client_order_id"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "order not found"})))
            .mount(&server)
            .await;

        let err = broker(&server).cancel_order("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn test_account_decimals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "equity": "50000.00",
                "buying_power": "100000.00",
                "cash": "25000.50"
            })))
            .mount(&server)
            .await;

        let account = broker(&server).get_account().await.unwrap();
        assert_eq!(account.equity, dec!(50000));
        assert_eq!(account.cash, dec!(25000.50));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("new", Decimal::ZERO), BrokerOrderStatus::Accepted);
        assert_eq!(map_status("new", dec!(5)), BrokerOrderStatus::PartiallyFilled);
        assert_eq!(map_status("expired", Decimal::ZERO), BrokerOrderStatus::Cancelled);
        assert_eq!(map_status("rejected", Decimal::ZERO), BrokerOrderStatus::Rejected);
    }
}
