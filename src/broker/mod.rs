//! Broker execution boundary.
//!
//! The order manager talks to a broker only through [`BrokerClient`]. Three
//! implementations are provided:
//! - [`PaperBroker`]: in-process simulation for paper runs and tests
//! - [`HttpBroker`]: REST adapter for an Alpaca-style brokerage API
//! - [`EventStream`]: websocket trade-update stream feeding the event inbox

mod http;
mod paper;
mod stream;
pub mod types;

pub use http::HttpBroker;
pub use paper::{FillMode, PaperBroker};
pub use stream::{parse_trade_update, EventStream};
pub use types::*;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Brokerage operations used by the order manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order. The ack is the broker's synchronous view of it.
    async fn submit_order(&self, spec: &OrderSpec) -> Result<BrokerAck, BrokerError>;

    /// Cancel by client order id.
    async fn cancel_order(&self, client_order_id: &str) -> Result<BrokerAck, BrokerError>;

    async fn get_account(&self) -> Result<AccountInfo, BrokerError>;

    /// Current state of every order the broker knows about.
    async fn order_states(&self) -> Result<Vec<BrokerOrderState>, BrokerError>;

    /// Subscribe to asynchronous order updates.
    async fn stream_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError>;
}
