//! Simulated broker for paper trading and tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::types::*;
use super::BrokerClient;
use crate::error::BrokerError;
use crate::utils::decimal::blend_price;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How submitted orders get filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Market orders fill on submit; resting orders fill when the price crosses them
    #[default]
    Immediate,
    /// Nothing fills until [`PaperBroker::fill`] is called
    Manual,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    spec: OrderSpec,
    state: BrokerOrderState,
}

#[derive(Debug, Default)]
struct PaperState {
    orders: HashMap<String, PaperOrder>,
    /// Submission order of client ids
    order_log: Vec<String>,
    cash: Decimal,
    /// Signed share count per symbol
    holdings: HashMap<String, Decimal>,
    rejected_symbols: HashSet<String>,
    rejected_types: HashSet<OrderType>,
    offline: bool,
    latency: Option<Duration>,
    subscribers: Vec<mpsc::Sender<BrokerEvent>>,
}

/// In-process broker with cash, holdings and resting stop/limit orders.
pub struct PaperBroker {
    state: Arc<RwLock<PaperState>>,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    order_id_counter: AtomicU64,
    sequence: AtomicU64,
    fill_mode: FillMode,
}

impl PaperBroker {
    pub fn new(initial_cash: Decimal, fill_mode: FillMode) -> Self {
        let state = PaperState {
            cash: initial_cash,
            ..PaperState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            prices: Arc::new(RwLock::new(HashMap::new())),
            order_id_counter: AtomicU64::new(1),
            sequence: AtomicU64::new(1),
            fill_mode,
        }
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    // =========================================================================
    // Market data
    // =========================================================================

    /// Replace all simulated prices.
    pub async fn set_prices(&self, prices: HashMap<String, Decimal>) {
        *self.prices.write().await = prices;
        self.trigger_resting().await;
    }

    /// Move one symbol's price; resting stops and limits that cross it fill.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
        self.trigger_resting().await;
    }

    pub async fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.read().await.get(symbol).copied()
    }

    async fn trigger_resting(&self) {
        if self.fill_mode == FillMode::Manual {
            return;
        }

        let prices = self.prices.read().await.clone();
        let mut state = self.state.write().await;
        let triggered: Vec<(String, Decimal)> = state
            .order_log
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| is_working(o.state.status))
            .filter_map(|o| {
                let price = prices.get(&o.spec.symbol)?;
                crosses(&o.spec, *price).map(|fill| (o.spec.client_order_id.clone(), fill))
            })
            .collect();

        for (client_order_id, fill_price) in triggered {
            let remaining = state
                .orders
                .get(&client_order_id)
                .map(|o| o.spec.quantity - o.state.filled_quantity)
                .unwrap_or(Decimal::ZERO);
            if let Ok(order_state) =
                self.apply_fill(&mut state, &client_order_id, remaining, fill_price)
            {
                info!(
                    client_order_id = %client_order_id,
                    price = %fill_price,
                    "Paper resting order triggered"
                );
                publish(&mut state, BrokerEvent::from_state(&order_state));
            }
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Refuse every order for a symbol.
    pub async fn reject_symbol(&self, symbol: &str) {
        self.state
            .write()
            .await
            .rejected_symbols
            .insert(symbol.to_string());
    }

    /// Refuse every order of a type (e.g. all stop orders).
    pub async fn reject_order_type(&self, order_type: OrderType) {
        self.state.write().await.rejected_types.insert(order_type);
    }

    pub async fn clear_rejections(&self) {
        let mut state = self.state.write().await;
        state.rejected_symbols.clear();
        state.rejected_types.clear();
    }

    /// Fail every call with a transport error while set.
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    /// Delay acks after the order has been accepted (the order still exists
    /// at the broker if the caller gives up waiting).
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    // =========================================================================
    // Manual fills
    // =========================================================================

    /// Fill `quantity` more of an order at `price` and publish the update.
    pub async fn fill(
        &self,
        client_order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<BrokerOrderState, BrokerError> {
        let mut state = self.state.write().await;
        let order_state = self.apply_fill(&mut state, client_order_id, quantity, price)?;
        publish(&mut state, BrokerEvent::from_state(&order_state));
        Ok(order_state)
    }

    /// Fill without publishing, so only reconciliation can discover it.
    pub async fn fill_silently(
        &self,
        client_order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<BrokerOrderState, BrokerError> {
        let mut state = self.state.write().await;
        self.apply_fill(&mut state, client_order_id, quantity, price)
    }

    fn apply_fill(
        &self,
        state: &mut PaperState,
        client_order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<BrokerOrderState, BrokerError> {
        let sequence = self.next_sequence();
        let order = state
            .orders
            .get_mut(client_order_id)
            .ok_or_else(|| BrokerError::UnknownOrder(client_order_id.to_string()))?;

        if !is_working(order.state.status) {
            return Err(BrokerError::Rejected(format!(
                "order {client_order_id} is {:?}",
                order.state.status
            )));
        }

        let remaining = order.spec.quantity - order.state.filled_quantity;
        let quantity = quantity.min(remaining);
        if quantity <= Decimal::ZERO {
            return Err(BrokerError::Rejected("nothing left to fill".to_string()));
        }

        let previous = order.state.filled_quantity;
        let avg = blend_price(
            previous,
            order.state.avg_fill_price.unwrap_or(Decimal::ZERO),
            quantity,
            price,
        );
        order.state.filled_quantity = previous + quantity;
        order.state.avg_fill_price = Some(avg);
        order.state.status = if order.state.filled_quantity >= order.spec.quantity {
            BrokerOrderStatus::Filled
        } else {
            BrokerOrderStatus::PartiallyFilled
        };
        order.state.sequence = sequence;
        order.state.updated_at = Utc::now();

        let side = order.spec.side;
        let symbol = order.spec.symbol.clone();
        let order_state = order.state.clone();

        let notional = quantity * price;
        let holding = state.holdings.entry(symbol.clone()).or_insert(Decimal::ZERO);
        match side {
            OrderSide::Buy => {
                *holding += quantity;
                state.cash -= notional;
            }
            OrderSide::Sell => {
                *holding -= quantity;
                state.cash += notional;
            }
        }

        info!(
            client_order_id,
            symbol = %symbol,
            side = ?side,
            quantity = %quantity,
            price = %price,
            status = ?order_state.status,
            "Paper order filled"
        );

        Ok(order_state)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn order(&self, client_order_id: &str) -> Option<BrokerOrderState> {
        self.state
            .read()
            .await
            .orders
            .get(client_order_id)
            .map(|o| o.state.clone())
    }

    /// Specs and states of every order for a symbol, in submission order.
    pub async fn orders_for(&self, symbol: &str) -> Vec<(OrderSpec, BrokerOrderState)> {
        let state = self.state.read().await;
        state
            .order_log
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| o.spec.symbol == symbol)
            .map(|o| (o.spec.clone(), o.state.clone()))
            .collect()
    }

    pub async fn submitted_count(&self) -> usize {
        self.state.read().await.order_log.len()
    }

    pub async fn holding(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn submit_order(&self, spec: &OrderSpec) -> Result<BrokerAck, BrokerError> {
        let price = self.price(&spec.symbol).await;
        let latency;
        let ack = {
            let mut state = self.state.write().await;
            if state.offline {
                return Err(BrokerError::Transport("paper broker offline".to_string()));
            }
            latency = state.latency;

            if state.rejected_symbols.contains(&spec.symbol) {
                warn!(symbol = %spec.symbol, "Paper broker rejected order (symbol)");
                return Err(BrokerError::Rejected(format!(
                    "{} is not accepting orders",
                    spec.symbol
                )));
            }
            if state.rejected_types.contains(&spec.order_type) {
                warn!(order_type = ?spec.order_type, "Paper broker rejected order (type)");
                return Err(BrokerError::Rejected(format!(
                    "{:?} orders are not accepted",
                    spec.order_type
                )));
            }
            if state.orders.contains_key(&spec.client_order_id) {
                return Err(BrokerError::Rejected(format!(
                    "duplicate client order id {}",
                    spec.client_order_id
                )));
            }
            if spec.quantity <= Decimal::ZERO {
                return Err(BrokerError::Rejected("quantity must be positive".to_string()));
            }

            let broker_order_id = format!("paper-{}", self.next_order_id());
            state.orders.insert(
                spec.client_order_id.clone(),
                PaperOrder {
                    spec: spec.clone(),
                    state: BrokerOrderState {
                        client_order_id: spec.client_order_id.clone(),
                        broker_order_id: broker_order_id.clone(),
                        status: BrokerOrderStatus::Accepted,
                        filled_quantity: Decimal::ZERO,
                        avg_fill_price: None,
                        sequence: self.next_sequence(),
                        updated_at: Utc::now(),
                    },
                },
            );
            state.order_log.push(spec.client_order_id.clone());
            debug!(
                client_order_id = %spec.client_order_id,
                broker_order_id = %broker_order_id,
                symbol = %spec.symbol,
                order_type = ?spec.order_type,
                "Paper order accepted"
            );

            if self.fill_mode == FillMode::Immediate {
                let fill_price = match (spec.order_type, price) {
                    (OrderType::Market, Some(p)) => Some(p),
                    (_, Some(p)) => crosses(spec, p),
                    (_, None) => None,
                };
                if let Some(fill_price) = fill_price {
                    let order_state = self.apply_fill(
                        &mut state,
                        &spec.client_order_id,
                        spec.quantity,
                        fill_price,
                    )?;
                    publish(&mut state, BrokerEvent::from_state(&order_state));
                }
            }

            state
                .orders
                .get(&spec.client_order_id)
                .map(|o| o.state.clone())
                .ok_or_else(|| BrokerError::UnknownOrder(spec.client_order_id.clone()))?
        };

        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }

    async fn cancel_order(&self, client_order_id: &str) -> Result<BrokerAck, BrokerError> {
        let sequence = self.next_sequence();
        let mut state = self.state.write().await;
        if state.offline {
            return Err(BrokerError::Transport("paper broker offline".to_string()));
        }

        let order = state
            .orders
            .get_mut(client_order_id)
            .ok_or_else(|| BrokerError::UnknownOrder(client_order_id.to_string()))?;

        if !is_working(order.state.status) {
            return Ok(order.state.clone());
        }

        order.state.status = BrokerOrderStatus::Cancelled;
        order.state.sequence = sequence;
        order.state.updated_at = Utc::now();
        let order_state = order.state.clone();
        debug!(client_order_id, "Paper order cancelled");

        publish(&mut state, BrokerEvent::from_state(&order_state));
        Ok(order_state)
    }

    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let prices = self.prices.read().await.clone();
        let state = self.state.read().await;
        if state.offline {
            return Err(BrokerError::Transport("paper broker offline".to_string()));
        }

        let holdings_value: Decimal = state
            .holdings
            .iter()
            .map(|(symbol, qty)| *qty * prices.get(symbol).copied().unwrap_or(Decimal::ZERO))
            .sum();

        Ok(AccountInfo {
            equity: state.cash + holdings_value,
            buying_power: state.cash.max(Decimal::ZERO),
            cash: state.cash,
        })
    }

    async fn order_states(&self) -> Result<Vec<BrokerOrderState>, BrokerError> {
        let state = self.state.read().await;
        if state.offline {
            return Err(BrokerError::Transport("paper broker offline".to_string()));
        }

        Ok(state
            .order_log
            .iter()
            .filter_map(|id| state.orders.get(id))
            .map(|o| o.state.clone())
            .collect())
    }

    async fn stream_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.state.write().await.subscribers.push(tx);
        Ok(rx)
    }
}

fn is_working(status: BrokerOrderStatus) -> bool {
    matches!(
        status,
        BrokerOrderStatus::Accepted | BrokerOrderStatus::PartiallyFilled
    )
}

/// Fill price if a resting order is triggered at `price`.
fn crosses(spec: &OrderSpec, price: Decimal) -> Option<Decimal> {
    match (spec.order_type, spec.side) {
        (OrderType::Stop, OrderSide::Sell) => spec.stop_price.filter(|s| price <= *s).map(|_| price),
        (OrderType::Stop, OrderSide::Buy) => spec.stop_price.filter(|s| price >= *s).map(|_| price),
        (OrderType::Limit, OrderSide::Sell) => spec.limit_price.filter(|l| price >= *l),
        (OrderType::Limit, OrderSide::Buy) => spec.limit_price.filter(|l| price <= *l),
        (OrderType::Market, _) => None,
    }
}

fn publish(state: &mut PaperState, event: BrokerEvent) {
    state.subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(client_order_id = %event.client_order_id, "Event subscriber lagging, event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Helper functions
    // =========================================================================

    fn spec(id: &str, side: OrderSide, order_type: OrderType, qty: Decimal) -> OrderSpec {
        OrderSpec {
            client_order_id: id.to_string(),
            symbol: "ACME".to_string(),
            side,
            order_type,
            quantity: qty,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
        }
    }

    async fn broker_with_price(mode: FillMode, price: Decimal) -> PaperBroker {
        let broker = PaperBroker::new(dec!(100000), mode);
        broker.set_price("ACME", price).await;
        broker
    }

    // =========================================================================
    // Submission
    // =========================================================================

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let broker = broker_with_price(FillMode::Immediate, dec!(50)).await;
        let mut events = broker.stream_events().await.unwrap();

        let ack = broker
            .submit_order(&spec("c1", OrderSide::Buy, OrderType::Market, dec!(100)))
            .await
            .unwrap();

        assert_eq!(ack.status, BrokerOrderStatus::Filled);
        assert_eq!(ack.avg_fill_price, Some(dec!(50)));
        assert_eq!(broker.holding("ACME").await, dec!(100));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, BrokerEventKind::Fill);
        assert_eq!(event.sequence, ack.sequence);

        let account = broker.get_account().await.unwrap();
        assert_eq!(account.cash, dec!(95000));
        assert_eq!(account.equity, dec!(100000));
    }

    #[tokio::test]
    async fn test_manual_mode_partial_then_full() {
        let broker = broker_with_price(FillMode::Manual, dec!(50)).await;
        let ack = broker
            .submit_order(&spec("c1", OrderSide::Buy, OrderType::Market, dec!(100)))
            .await
            .unwrap();
        assert_eq!(ack.status, BrokerOrderStatus::Accepted);

        let partial = broker.fill("c1", dec!(40), dec!(50)).await.unwrap();
        assert_eq!(partial.status, BrokerOrderStatus::PartiallyFilled);
        assert!(partial.sequence > ack.sequence);

        let full = broker.fill("c1", dec!(100), dec!(51)).await.unwrap();
        assert_eq!(full.status, BrokerOrderStatus::Filled);
        assert_eq!(full.filled_quantity, dec!(100));
        assert_eq!(full.avg_fill_price, Some(dec!(50.6)));
    }

    #[tokio::test]
    async fn test_rejection_injection() {
        let broker = broker_with_price(FillMode::Immediate, dec!(50)).await;
        broker.reject_order_type(OrderType::Stop).await;

        let err = broker
            .submit_order(&spec("s1", OrderSide::Sell, OrderType::Stop, dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));

        broker.clear_rejections().await;
        broker.reject_symbol("ACME").await;
        assert!(broker
            .submit_order(&spec("m1", OrderSide::Buy, OrderType::Market, dec!(10)))
            .await
            .is_err());
        assert_eq!(broker.submitted_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let broker = broker_with_price(FillMode::Manual, dec!(50)).await;
        let order = spec("dup", OrderSide::Buy, OrderType::Market, dec!(10));
        broker.submit_order(&order).await.unwrap();
        assert!(broker.submit_order(&order).await.is_err());
    }

    // =========================================================================
    // Resting orders
    // =========================================================================

    #[tokio::test]
    async fn test_stop_triggers_on_price_drop() {
        let broker = broker_with_price(FillMode::Immediate, dec!(100)).await;
        broker
            .submit_order(&spec("e1", OrderSide::Buy, OrderType::Market, dec!(10)))
            .await
            .unwrap();

        let mut stop = spec("s1", OrderSide::Sell, OrderType::Stop, dec!(10));
        stop.stop_price = Some(dec!(98));
        let ack = broker.submit_order(&stop).await.unwrap();
        assert_eq!(ack.status, BrokerOrderStatus::Accepted);

        broker.set_price("ACME", dec!(99)).await;
        assert_eq!(
            broker.order("s1").await.unwrap().status,
            BrokerOrderStatus::Accepted
        );

        broker.set_price("ACME", dec!(97.5)).await;
        let filled = broker.order("s1").await.unwrap();
        assert_eq!(filled.status, BrokerOrderStatus::Filled);
        assert_eq!(filled.avg_fill_price, Some(dec!(97.5)));
        assert_eq!(broker.holding("ACME").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let broker = broker_with_price(FillMode::Manual, dec!(50)).await;
        broker
            .submit_order(&spec("c1", OrderSide::Buy, OrderType::Market, dec!(10)))
            .await
            .unwrap();

        let first = broker.cancel_order("c1").await.unwrap();
        assert_eq!(first.status, BrokerOrderStatus::Cancelled);
        let second = broker.cancel_order("c1").await.unwrap();
        assert_eq!(second.sequence, first.sequence);

        assert!(matches!(
            broker.cancel_order("nope").await,
            Err(BrokerError::UnknownOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_fill_publishes_nothing() {
        let broker = broker_with_price(FillMode::Manual, dec!(50)).await;
        let mut events = broker.stream_events().await.unwrap();
        broker
            .submit_order(&spec("c1", OrderSide::Buy, OrderType::Market, dec!(10)))
            .await
            .unwrap();

        broker.fill_silently("c1", dec!(10), dec!(50)).await.unwrap();
        assert!(events.try_recv().is_err());

        let states = broker.order_states().await.unwrap();
        assert_eq!(states[0].status, BrokerOrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let broker = broker_with_price(FillMode::Immediate, dec!(50)).await;
        broker.set_offline(true).await;
        assert!(matches!(
            broker.get_account().await,
            Err(BrokerError::Transport(_))
        ));
        assert!(broker.order_states().await.is_err());
    }
}
