//! Broker-facing order, event and account types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// Order request sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

/// Order status as the broker reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// Broker's view of one order.
///
/// `sequence` increases with every change the broker makes to the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderState {
    pub client_order_id: String,
    pub broker_order_id: String,
    pub status: BrokerOrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

/// Synchronous acknowledgement of a submit or cancel.
pub type BrokerAck = BrokerOrderState;

/// Kind of asynchronous order update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Accepted,
    PartialFill,
    Fill,
    Cancelled,
    Rejected { reason: String },
}

/// Asynchronous order update from the broker.
///
/// Quantities and prices are cumulative for the order, not per fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub sequence: u64,
    pub client_order_id: String,
    pub broker_order_id: String,
    pub kind: BrokerEventKind,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl BrokerEvent {
    /// Event equivalent to the broker's current view of an order.
    pub fn from_state(state: &BrokerOrderState) -> Self {
        let kind = match state.status {
            BrokerOrderStatus::Accepted => BrokerEventKind::Accepted,
            BrokerOrderStatus::PartiallyFilled => BrokerEventKind::PartialFill,
            BrokerOrderStatus::Filled => BrokerEventKind::Fill,
            BrokerOrderStatus::Cancelled => BrokerEventKind::Cancelled,
            BrokerOrderStatus::Rejected => BrokerEventKind::Rejected {
                reason: "rejected by broker".to_string(),
            },
        };

        Self {
            sequence: state.sequence,
            client_order_id: state.client_order_id.clone(),
            broker_order_id: state.broker_order_id.clone(),
            kind,
            filled_quantity: state.filled_quantity,
            avg_fill_price: state.avg_fill_price,
            timestamp: state.updated_at,
        }
    }
}

/// Account balances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub cash: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_from_state() {
        let state = BrokerOrderState {
            client_order_id: "cct-1".into(),
            broker_order_id: "b-1".into(),
            status: BrokerOrderStatus::PartiallyFilled,
            filled_quantity: dec!(40),
            avg_fill_price: Some(dec!(10.5)),
            sequence: 3,
            updated_at: Utc::now(),
        };

        let event = BrokerEvent::from_state(&state);
        assert_eq!(event.kind, BrokerEventKind::PartialFill);
        assert_eq!(event.sequence, 3);
        assert_eq!(event.filled_quantity, dec!(40));
    }

    #[test]
    fn test_order_spec_serializes_lowercase() {
        let json = serde_json::to_value(OrderSide::Sell).unwrap();
        assert_eq!(json, "sell");
        let json = serde_json::to_value(OrderType::Stop).unwrap();
        assert_eq!(json, "stop");
    }
}
