//! Order and position lifecycle.
//!
//! All order and position state lives in one `Book` behind a mutex. Broker
//! acks, streamed events and reconciliation corrections are all applied
//! through the same queue while the lock is held, so there is a single
//! writer and events for an order are applied in arrival order. Events
//! carrying a sequence at or below the order's last applied one are stale.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::types::*;
use crate::broker::{
    BrokerClient, BrokerEvent, BrokerEventKind, BrokerOrderState, BrokerOrderStatus, OrderSide,
    OrderSpec, OrderType, TimeInForce,
};
use crate::config::ExecutionConfig;
use crate::cycle::CycleId;
use crate::error::{BrokerError, ExecutionError};
use crate::events::{CycleEvent, EventSink};
use crate::persistence::{AuditEvent, AuditKind, TradeStore};
use crate::providers::InstrumentId;
use crate::risk::{ApprovedTrade, RiskOverage, RiskValidator};
use crate::utils::decimal::{blend_price, safe_div};

/// Side effects an applied event asks for.
#[derive(Debug)]
enum FollowUp {
    PlaceProtective(PositionId),
    ResizeProtective(PositionId),
    Cancel(OrderId),
    FailSafeClose(PositionId, String),
}

struct OrderDraft {
    cycle_id: CycleId,
    position_id: Option<PositionId>,
    instrument: InstrumentId,
    symbol: String,
    role: OrderRole,
    side: OrderSide,
    order_type: OrderType,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    planned_stop_loss: Option<Decimal>,
    planned_take_profit: Option<Decimal>,
}

#[derive(Default)]
struct Book {
    orders: BTreeMap<OrderId, Order>,
    by_client_id: HashMap<String, OrderId>,
    positions: BTreeMap<PositionId, Position>,
    next_order_id: u64,
    next_position_id: u64,
    halt_reason: Option<String>,
}

impl Book {
    fn insert_order(&mut self, draft: OrderDraft, prefix: &str) -> OrderId {
        self.next_order_id += 1;
        let id = OrderId(self.next_order_id);
        let now = Utc::now();
        let client_order_id = format!(
            "{}-{}-{}-{}",
            prefix,
            draft.cycle_id.short(),
            draft.role.code(),
            id.0
        );

        let order = Order {
            id,
            client_order_id: client_order_id.clone(),
            broker_order_id: None,
            cycle_id: draft.cycle_id,
            position_id: draft.position_id,
            instrument: draft.instrument,
            symbol: draft.symbol,
            role: draft.role,
            side: draft.side,
            order_type: draft.order_type,
            quantity: draft.quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            limit_price: draft.limit_price,
            stop_price: draft.stop_price,
            planned_stop_loss: draft.planned_stop_loss,
            planned_take_profit: draft.planned_take_profit,
            status: OrderStatus::Pending,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
        };
        self.by_client_id.insert(client_order_id, id);
        self.orders.insert(id, order);
        id
    }

    fn is_active(&self, id: Option<OrderId>) -> bool {
        id.and_then(|id| self.orders.get(&id))
            .is_some_and(|o| o.status.is_active())
    }

    /// Active entry or open position for the instrument.
    fn has_exposure(&self, instrument: InstrumentId) -> bool {
        self.orders
            .values()
            .any(|o| o.instrument == instrument && o.role == OrderRole::Entry && o.status.is_active())
            || self
                .positions
                .values()
                .any(|p| p.instrument == instrument && p.is_open())
    }
}

/// Broker status to the local status it implies.
fn local_status(status: BrokerOrderStatus) -> OrderStatus {
    match status {
        BrokerOrderStatus::Accepted => OrderStatus::Submitted,
        BrokerOrderStatus::PartiallyFilled => OrderStatus::PartiallyFilled,
        BrokerOrderStatus::Filled => OrderStatus::Filled,
        BrokerOrderStatus::Cancelled => OrderStatus::Cancelled,
        BrokerOrderStatus::Rejected => OrderStatus::Rejected,
    }
}

fn event_status(kind: &BrokerEventKind) -> OrderStatus {
    match kind {
        BrokerEventKind::Accepted => OrderStatus::Submitted,
        BrokerEventKind::PartialFill => OrderStatus::PartiallyFilled,
        BrokerEventKind::Fill => OrderStatus::Filled,
        BrokerEventKind::Cancelled => OrderStatus::Cancelled,
        BrokerEventKind::Rejected { .. } => OrderStatus::Rejected,
    }
}

/// Price of the newest fill given cumulative averages before and after it.
fn incremental_price(
    previous_filled: Decimal,
    previous_avg: Decimal,
    filled: Decimal,
    avg: Decimal,
) -> Decimal {
    safe_div(avg * filled - previous_avg * previous_filled, filled - previous_filled)
}

/// Owns orders and positions and drives them through their lifecycles.
pub struct OrderManager {
    broker: Arc<dyn BrokerClient>,
    risk: Arc<RiskValidator>,
    store: Arc<dyn TradeStore>,
    sink: Arc<dyn EventSink>,
    config: ExecutionConfig,
    broker_timeout: Duration,
    book: Mutex<Book>,
    halted: AtomicBool,
}

impl OrderManager {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        risk: Arc<RiskValidator>,
        store: Arc<dyn TradeStore>,
        sink: Arc<dyn EventSink>,
        config: ExecutionConfig,
    ) -> Self {
        let broker_timeout = Duration::from_secs(config.broker_timeout_secs);
        Self {
            broker,
            risk,
            store,
            sink,
            config,
            broker_timeout,
            book: Mutex::new(Book::default()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Accept new submissions again after a force close.
    pub async fn resume(&self) {
        let mut book = self.book.lock().await;
        if let Some(reason) = book.halt_reason.take() {
            info!(previous_reason = %reason, "Order manager resumed");
        }
        self.halted.store(false, Ordering::SeqCst);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn open_positions(&self) -> Vec<Position> {
        let book = self.book.lock().await;
        book.positions.values().filter(|p| p.is_open()).cloned().collect()
    }

    pub async fn positions_for(&self, cycle_id: CycleId) -> Vec<Position> {
        let book = self.book.lock().await;
        book.positions
            .values()
            .filter(|p| p.cycle_id == cycle_id)
            .cloned()
            .collect()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.book.lock().await.orders.values().cloned().collect()
    }

    pub async fn order(&self, client_order_id: &str) -> Option<Order> {
        let book = self.book.lock().await;
        book.by_client_id
            .get(client_order_id)
            .and_then(|id| book.orders.get(id))
            .cloned()
    }

    /// Entry orders of a cycle that may still fill.
    pub async fn active_entries(&self, cycle_id: CycleId) -> usize {
        let book = self.book.lock().await;
        book.orders
            .values()
            .filter(|o| o.cycle_id == cycle_id && o.role == OrderRole::Entry && o.status.is_active())
            .count()
    }

    /// Update unrealized P&L from last prices; returns the open total.
    pub async fn mark_to_market(&self, prices: &HashMap<InstrumentId, Decimal>) -> Decimal {
        let mut book = self.book.lock().await;
        let mut total = Decimal::ZERO;
        for position in book.positions.values_mut().filter(|p| p.is_open()) {
            if let Some(price) = prices.get(&position.instrument) {
                position.mark_to_market(*price);
            }
            total += position.unrealized_pnl;
        }
        total
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit the entry order for an approved trade.
    #[instrument(skip(self, approved), fields(symbol = %approved.proposal.instrument().symbol))]
    pub async fn submit_order(&self, approved: &ApprovedTrade) -> Result<OrderHandle, ExecutionError> {
        let proposal = &approved.proposal;
        let instrument = proposal.instrument();

        let mut book = self.book.lock().await;
        if self.is_halted() {
            let reason = book
                .halt_reason
                .clone()
                .unwrap_or_else(|| "halted".to_string());
            drop(book);
            self.risk.release(instrument.id).await;
            return Err(ExecutionError::Halted(reason));
        }
        if book.has_exposure(instrument.id) {
            warn!(symbol = %instrument.symbol, "Duplicate entry refused");
            return Err(ExecutionError::DuplicateEntry(instrument.symbol.clone()));
        }

        let order_id = book.insert_order(
            OrderDraft {
                cycle_id: proposal.cycle_id(),
                position_id: None,
                instrument: instrument.id,
                symbol: instrument.symbol.clone(),
                role: OrderRole::Entry,
                side: proposal.side().entry_side(),
                order_type: OrderType::Market,
                quantity: proposal.quantity(),
                limit_price: None,
                stop_price: None,
                planned_stop_loss: Some(proposal.stop_loss()),
                planned_take_profit: Some(proposal.take_profit()),
            },
            &self.config.client_order_prefix,
        );
        if let Some(order) = book.orders.get(&order_id) {
            self.persist_order(order);
        }

        let sent = self.send(&mut book, order_id).await;
        let client_order_id = book
            .orders
            .get(&order_id)
            .map(|o| o.client_order_id.clone())
            .unwrap_or_default();

        match sent {
            Ok(ack_event) => {
                self.risk.record_order_success().await;
                if let Some(event) = ack_event {
                    self.drain(&mut book, [event]).await;
                }
                let status = book
                    .orders
                    .get(&order_id)
                    .map(|o| o.status)
                    .unwrap_or(OrderStatus::Submitted);
                info!(
                    client_order_id = %client_order_id,
                    quantity = %proposal.quantity(),
                    status = %status,
                    "Entry order submitted"
                );
                Ok(OrderHandle {
                    order_id,
                    client_order_id,
                    status,
                })
            }
            Err(BrokerError::Rejected(reason)) => {
                self.risk.release(instrument.id).await;
                Err(ExecutionError::OrderRejected {
                    client_order_id,
                    reason,
                })
            }
            Err(e) => {
                // outcome unknown; the order stays Submitted until reconciliation
                warn!(
                    client_order_id = %client_order_id,
                    error = %e,
                    "Entry submission outcome unknown"
                );
                Err(ExecutionError::Broker(e))
            }
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, BrokerError>>) -> Result<T, BrokerError> {
        match tokio::time::timeout(self.broker_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.broker_timeout.as_millis() as u64)),
        }
    }

    /// Submit a Pending order. Returns the ack as an event when the broker
    /// already reports progress beyond acceptance.
    async fn send(&self, book: &mut Book, order_id: OrderId) -> Result<Option<BrokerEvent>, BrokerError> {
        let Some(order) = book.orders.get(&order_id) else {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        };
        let spec = OrderSpec {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            time_in_force: match order.role {
                OrderRole::StopLoss | OrderRole::TakeProfit => TimeInForce::Gtc,
                OrderRole::Entry | OrderRole::Exit => TimeInForce::Day,
            },
        };

        let result = self.call(self.broker.submit_order(&spec)).await;
        let Some(order) = book.orders.get_mut(&order_id) else {
            return Err(BrokerError::UnknownOrder(spec.client_order_id));
        };
        order.updated_at = Utc::now();

        let outcome = match result {
            Ok(ack) => {
                order.broker_order_id = Some(ack.broker_order_id.clone());
                order.status = OrderStatus::Submitted;
                if ack.status == BrokerOrderStatus::Accepted {
                    order.last_sequence = ack.sequence;
                    Ok(None)
                } else {
                    Ok(Some(BrokerEvent::from_state(&ack)))
                }
            }
            Err(BrokerError::Rejected(reason)) => {
                order.status = OrderStatus::Rejected;
                Err(BrokerError::Rejected(reason))
            }
            Err(e) => {
                order.status = OrderStatus::Submitted;
                Err(e)
            }
        };

        let order = order.clone();
        self.persist_order(&order);
        self.emit_order(&order);
        if let Err(e) = &outcome {
            error!(
                client_order_id = %order.client_order_id,
                role = ?order.role,
                error = %e,
                "Order submission failed"
            );
            self.note_broker_failure(e).await;
        }
        outcome
    }

    async fn cancel(&self, book: &mut Book, order_id: OrderId) -> Vec<BrokerEvent> {
        let Some(order) = book.orders.get(&order_id) else {
            return Vec::new();
        };
        if !order.status.is_active() {
            return Vec::new();
        }
        let client_order_id = order.client_order_id.clone();

        match self.call(self.broker.cancel_order(&client_order_id)).await {
            Ok(ack) => {
                debug!(client_order_id = %client_order_id, status = ?ack.status, "Cancel acknowledged");
                vec![BrokerEvent::from_state(&ack)]
            }
            Err(e) => {
                warn!(client_order_id = %client_order_id, error = %e, "Cancel failed");
                self.note_broker_failure(&e).await;
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Broker events
    // =========================================================================

    /// Apply one broker event (and everything it triggers).
    pub async fn on_broker_event(&self, event: BrokerEvent) -> EventOutcome {
        let mut book = self.book.lock().await;
        self.drain(&mut book, [event])
            .await
            .first()
            .copied()
            .unwrap_or(EventOutcome::Unknown)
    }

    /// Consume a broker event stream on a dedicated task.
    pub fn spawn_event_pump(self: Arc<Self>, mut rx: mpsc::Receiver<BrokerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let client_order_id = event.client_order_id.clone();
                let outcome = self.on_broker_event(event).await;
                debug!(client_order_id = %client_order_id, outcome = ?outcome, "Broker event processed");
            }
            info!("Broker event stream ended");
        })
    }

    /// Apply events in order, running follow-ups as they arise. Returns the
    /// outcome of each initial event.
    async fn drain(
        &self,
        book: &mut Book,
        events: impl IntoIterator<Item = BrokerEvent>,
    ) -> Vec<EventOutcome> {
        let initial: VecDeque<BrokerEvent> = events.into_iter().collect();
        let initial_count = initial.len();
        let mut queue = initial;
        let mut outcomes = Vec::with_capacity(initial_count);
        let mut processed = 0;

        while let Some(event) = queue.pop_front() {
            let (outcome, follow_ups) = self.apply(book, &event).await;
            if processed < initial_count {
                outcomes.push(outcome);
            }
            processed += 1;

            for follow_up in follow_ups {
                let produced = match follow_up {
                    FollowUp::PlaceProtective(position_id) => {
                        self.place_protective(book, position_id).await
                    }
                    FollowUp::ResizeProtective(position_id) => {
                        self.resize_protective(book, position_id).await
                    }
                    FollowUp::Cancel(order_id) => self.cancel(book, order_id).await,
                    FollowUp::FailSafeClose(position_id, reason) => {
                        self.fail_safe_close(book, position_id, &reason).await
                    }
                };
                queue.extend(produced);
            }
        }
        outcomes
    }

    async fn apply(&self, book: &mut Book, event: &BrokerEvent) -> (EventOutcome, Vec<FollowUp>) {
        let Some(order_id) = book.by_client_id.get(&event.client_order_id).copied() else {
            warn!(client_order_id = %event.client_order_id, "Event for unknown order");
            self.audit(AuditEvent::new(
                AuditKind::UnknownOrder,
                event.client_order_id.clone(),
                format!("{:?} event with no local order", event.kind),
            ));
            return (EventOutcome::Unknown, Vec::new());
        };
        let Some(order) = book.orders.get_mut(&order_id) else {
            return (EventOutcome::Unknown, Vec::new());
        };

        if event.sequence <= order.last_sequence {
            debug!(
                client_order_id = %order.client_order_id,
                sequence = event.sequence,
                last_sequence = order.last_sequence,
                "Stale broker event dropped"
            );
            return (EventOutcome::Stale, Vec::new());
        }

        let target = event_status(&event.kind);
        if target != order.status && !order.status.can_transition_to(target) {
            warn!(
                client_order_id = %order.client_order_id,
                from = %order.status,
                to = %target,
                "Illegal order transition ignored"
            );
            let audit = AuditEvent::new(
                AuditKind::IllegalTransition,
                order.client_order_id.clone(),
                format!("{} -> {} (sequence {})", order.status, target, event.sequence),
            )
            .for_cycle(order.cycle_id);
            self.audit(audit);
            return (EventOutcome::IllegalTransition, Vec::new());
        }

        let previous_filled = order.filled_quantity;
        let previous_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
        let filled = event.filled_quantity.max(previous_filled).min(order.quantity);
        let delta = filled - previous_filled;
        let fill_price = if delta > Decimal::ZERO {
            incremental_price(
                previous_filled,
                previous_avg,
                filled,
                event.avg_fill_price.unwrap_or(previous_avg),
            )
        } else {
            Decimal::ZERO
        };

        let changed = target != order.status || delta > Decimal::ZERO;
        order.status = target;
        order.filled_quantity = filled;
        if event.avg_fill_price.is_some() {
            order.avg_fill_price = event.avg_fill_price;
        }
        order.last_sequence = event.sequence;
        order.updated_at = Utc::now();
        let order = order.clone();

        if !changed {
            return (EventOutcome::Applied, Vec::new());
        }
        self.persist_order(&order);
        self.emit_order(&order);

        let follow_ups = match order.role {
            OrderRole::Entry => self.on_entry_update(book, &order, delta, fill_price).await,
            OrderRole::StopLoss | OrderRole::TakeProfit | OrderRole::Exit => {
                self.on_exit_update(book, &order, delta, fill_price).await
            }
        };
        (EventOutcome::Applied, follow_ups)
    }

    async fn on_entry_update(
        &self,
        book: &mut Book,
        order: &Order,
        delta: Decimal,
        price: Decimal,
    ) -> Vec<FollowUp> {
        let now = Utc::now();

        if delta > Decimal::ZERO {
            match order.position_id.and_then(|id| book.positions.get_mut(&id)) {
                Some(position) => {
                    position.entry_price =
                        blend_price(position.quantity, position.entry_price, delta, price);
                    position.quantity += delta;
                    self.persist_position(position);
                }
                None => {
                    book.next_position_id += 1;
                    let position_id = PositionId(book.next_position_id);
                    let side = match order.side {
                        OrderSide::Buy => PositionSide::Long,
                        OrderSide::Sell => PositionSide::Short,
                    };
                    let position = Position {
                        id: position_id,
                        cycle_id: order.cycle_id,
                        instrument: order.instrument,
                        symbol: order.symbol.clone(),
                        side,
                        quantity: delta,
                        entry_price: price,
                        stop_loss: order.planned_stop_loss.unwrap_or(Decimal::ZERO),
                        take_profit: order.planned_take_profit.unwrap_or(Decimal::ZERO),
                        status: PositionStatus::Open,
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                        entry_order: order.id,
                        stop_order: None,
                        target_order: None,
                        exit_order: None,
                        opened_at: now,
                        closed_at: None,
                    };
                    info!(
                        position_id = %position_id,
                        symbol = %position.symbol,
                        quantity = %position.quantity,
                        entry = %position.entry_price,
                        stop = %position.stop_loss,
                        "Position opened"
                    );
                    self.sink.emit(&CycleEvent::PositionOpened {
                        cycle_id: position.cycle_id,
                        position_id,
                        symbol: position.symbol.clone(),
                        quantity: position.quantity,
                        entry_price: position.entry_price,
                        stop_loss: position.stop_loss,
                    });
                    self.persist_position(&position);
                    book.positions.insert(position_id, position);

                    if let Some(entry) = book.orders.get_mut(&order.id) {
                        entry.position_id = Some(position_id);
                        let entry = entry.clone();
                        self.persist_order(&entry);
                    }
                }
            }
        }

        if !order.status.is_terminal() {
            return Vec::new();
        }

        let position = book
            .orders
            .get(&order.id)
            .and_then(|o| o.position_id)
            .and_then(|id| book.positions.get(&id));

        match position {
            Some(position) if position.is_open() => {
                if let Some(overage) = self
                    .risk
                    .mark_open(position.cycle_id, position.instrument, position.risk())
                    .await
                {
                    self.report_risk_overage(position, overage);
                }
                if self.is_halted() {
                    vec![FollowUp::FailSafeClose(
                        position.id,
                        "order manager halted".to_string(),
                    )]
                } else {
                    vec![FollowUp::PlaceProtective(position.id)]
                }
            }
            Some(_) => Vec::new(),
            None => {
                // terminal with nothing filled
                self.risk.release(order.instrument).await;
                if order.status == OrderStatus::Rejected {
                    let triggered = self.risk.record_order_failure().await;
                    self.emergency_if(triggered).await;
                }
                Vec::new()
            }
        }
    }

    async fn on_exit_update(
        &self,
        book: &mut Book,
        order: &Order,
        delta: Decimal,
        price: Decimal,
    ) -> Vec<FollowUp> {
        let Some(position_id) = order.position_id else {
            return Vec::new();
        };
        let halted = self.is_halted();
        let (exit_active, stop_active) = {
            let position = book.positions.get(&position_id);
            (
                book.is_active(position.and_then(|p| p.exit_order)),
                book.is_active(position.and_then(|p| p.stop_order)),
            )
        };
        let Some(position) = book.positions.get_mut(&position_id) else {
            return Vec::new();
        };
        let mut follow_ups = Vec::new();

        if delta > Decimal::ZERO && position.is_open() {
            let pnl = position.book_close(delta, price, Utc::now());
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                role = ?order.role,
                quantity = %delta,
                price = %price,
                pnl = %pnl,
                remaining = %position.quantity,
                "Position reduced"
            );
            self.persist_position(position);

            if !position.is_open() {
                self.sink.emit(&CycleEvent::PositionClosed {
                    cycle_id: position.cycle_id,
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    realized_pnl: position.realized_pnl,
                });
                let instrument = position.instrument;
                let siblings = [position.stop_order, position.target_order, position.exit_order];
                self.risk.release(instrument).await;
                follow_ups.extend(
                    siblings
                        .into_iter()
                        .flatten()
                        .filter(|id| *id != order.id)
                        .map(FollowUp::Cancel),
                );
                return follow_ups;
            }

            if !exit_active && !halted {
                follow_ups.push(FollowUp::ResizeProtective(position.id));
            }
        }

        if !position.is_open() || !matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
            return follow_ups;
        }

        match order.role {
            OrderRole::StopLoss => {
                let linked = position.stop_order == Some(order.id);
                if linked {
                    position.stop_order = None;
                    self.persist_position(position);
                }
                // a replaced stop is already working
                if exit_active || halted || (!linked && stop_active) {
                    return follow_ups;
                }
                if order.status == OrderStatus::Rejected {
                    follow_ups.push(FollowUp::FailSafeClose(
                        position.id,
                        "stop-loss rejected by broker".to_string(),
                    ));
                } else {
                    warn!(position_id = %position.id, "Stop-loss cancelled while position open, re-placing");
                    follow_ups.push(FollowUp::PlaceProtective(position.id));
                }
            }
            OrderRole::TakeProfit => {
                if position.target_order == Some(order.id) {
                    position.target_order = None;
                    self.persist_position(position);
                }
            }
            OrderRole::Exit => {
                if position.exit_order == Some(order.id) {
                    position.exit_order = None;
                    self.persist_position(position);
                }
                error!(
                    target: "risk_alert",
                    position_id = %position.id,
                    symbol = %position.symbol,
                    status = %order.status,
                    "Close order did not fill, position still open"
                );
            }
            OrderRole::Entry => {}
        }
        follow_ups
    }

    // =========================================================================
    // Protection and closing
    // =========================================================================

    /// Make sure an open position has a working stop (and target). A stop that
    /// cannot be placed closes the position at market.
    async fn place_protective(&self, book: &mut Book, position_id: PositionId) -> Vec<BrokerEvent> {
        let Some(position) = book.positions.get(&position_id).cloned() else {
            return Vec::new();
        };
        if !position.is_open() || position.quantity <= Decimal::ZERO || book.is_active(position.exit_order) {
            return Vec::new();
        }
        if self.is_halted() {
            return self
                .fail_safe_close(book, position_id, "order manager halted")
                .await;
        }
        if !position.has_valid_stop() {
            let detail = format!(
                "stop-loss {} invalid for entry {}",
                position.stop_loss, position.entry_price
            );
            self.report_invariant_violation(&position, &detail);
            return self.fail_safe_close(book, position_id, &detail).await;
        }

        let prefix = self.config.client_order_prefix.clone();
        let mut events = Vec::new();

        if !book.is_active(position.stop_order) {
            let stop_id = book.insert_order(
                OrderDraft {
                    cycle_id: position.cycle_id,
                    position_id: Some(position_id),
                    instrument: position.instrument,
                    symbol: position.symbol.clone(),
                    role: OrderRole::StopLoss,
                    side: position.side.exit_side(),
                    order_type: OrderType::Stop,
                    quantity: position.quantity,
                    limit_price: None,
                    stop_price: Some(position.stop_loss),
                    planned_stop_loss: None,
                    planned_take_profit: None,
                },
                &prefix,
            );

            match self.send(book, stop_id).await {
                Ok(ack_event) => {
                    if let Some(p) = book.positions.get_mut(&position_id) {
                        p.stop_order = Some(stop_id);
                        self.persist_position(p);
                    }
                    events.extend(ack_event);
                    debug!(position_id = %position_id, stop = %position.stop_loss, "Stop-loss placed");
                }
                Err(e) => {
                    let reason = format!("stop-loss placement failed: {e}");
                    if !matches!(e, BrokerError::Rejected(_)) {
                        // it may exist at the broker; do not leave it working
                        events.extend(self.cancel(book, stop_id).await);
                    }
                    events.extend(self.fail_safe_close(book, position_id, &reason).await);
                    return events;
                }
            }
        }

        if position.take_profit > Decimal::ZERO && !book.is_active(position.target_order) {
            let target_id = book.insert_order(
                OrderDraft {
                    cycle_id: position.cycle_id,
                    position_id: Some(position_id),
                    instrument: position.instrument,
                    symbol: position.symbol.clone(),
                    role: OrderRole::TakeProfit,
                    side: position.side.exit_side(),
                    order_type: OrderType::Limit,
                    quantity: position.quantity,
                    limit_price: Some(position.take_profit),
                    stop_price: None,
                    planned_stop_loss: None,
                    planned_take_profit: None,
                },
                &prefix,
            );

            match self.send(book, target_id).await {
                Ok(ack_event) => {
                    if let Some(p) = book.positions.get_mut(&position_id) {
                        p.target_order = Some(target_id);
                        self.persist_position(p);
                    }
                    events.extend(ack_event);
                }
                Err(e) => {
                    // the stop still protects the position
                    warn!(position_id = %position_id, error = %e, "Take-profit placement failed");
                }
            }
        }

        events
    }

    /// Shrink protective orders that would close more than the position holds.
    ///
    /// An oversized order is cancelled and detached once the broker confirms
    /// the cancel, then re-placed for the remaining quantity. A cancel still
    /// pending keeps the link until its terminal event arrives.
    async fn resize_protective(&self, book: &mut Book, position_id: PositionId) -> Vec<BrokerEvent> {
        let Some(position) = book.positions.get(&position_id).cloned() else {
            return Vec::new();
        };
        if !position.is_open() || book.is_active(position.exit_order) {
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut detached = Vec::new();
        for id in [position.stop_order, position.target_order].into_iter().flatten() {
            let Some(order) = book.orders.get(&id).filter(|o| o.status.is_active()) else {
                continue;
            };
            if order.remaining() <= position.quantity {
                continue;
            }
            info!(
                position_id = %position_id,
                client_order_id = %order.client_order_id,
                role = ?order.role,
                order_remaining = %order.remaining(),
                position_quantity = %position.quantity,
                "Resizing protective order after partial close"
            );

            let acks = self.cancel(book, id).await;
            if acks.iter().any(|e| e.kind == BrokerEventKind::Cancelled) {
                detached.push(id);
            }
            events.extend(acks);
        }

        if detached.is_empty() {
            return events;
        }
        if let Some(p) = book.positions.get_mut(&position_id) {
            if p.stop_order.is_some_and(|id| detached.contains(&id)) {
                p.stop_order = None;
            }
            if p.target_order.is_some_and(|id| detached.contains(&id)) {
                p.target_order = None;
            }
            self.persist_position(p);
        }
        events.extend(self.place_protective(book, position_id).await);
        events
    }

    /// Cancel protective orders and close the position at market. No retry.
    async fn fail_safe_close(
        &self,
        book: &mut Book,
        position_id: PositionId,
        reason: &str,
    ) -> Vec<BrokerEvent> {
        let Some(position) = book.positions.get(&position_id).cloned() else {
            return Vec::new();
        };
        if !position.is_open() || book.is_active(position.exit_order) {
            return Vec::new();
        }

        error!(
            target: "risk_alert",
            position_id = %position_id,
            symbol = %position.symbol,
            quantity = %position.quantity,
            reason,
            "FAIL-SAFE CLOSE"
        );

        let mut events = Vec::new();
        for id in [position.stop_order, position.target_order].into_iter().flatten() {
            events.extend(self.cancel(book, id).await);
        }

        let exit_id = book.insert_order(
            OrderDraft {
                cycle_id: position.cycle_id,
                position_id: Some(position_id),
                instrument: position.instrument,
                symbol: position.symbol.clone(),
                role: OrderRole::Exit,
                side: position.side.exit_side(),
                order_type: OrderType::Market,
                quantity: position.quantity,
                limit_price: None,
                stop_price: None,
                planned_stop_loss: None,
                planned_take_profit: None,
            },
            &self.config.client_order_prefix,
        );

        let detail = match self.send(book, exit_id).await {
            Ok(ack_event) => {
                if let Some(p) = book.positions.get_mut(&position_id) {
                    p.exit_order = Some(exit_id);
                    self.persist_position(p);
                }
                events.extend(ack_event);
                reason.to_string()
            }
            Err(e) => {
                error!(
                    target: "risk_alert",
                    position_id = %position_id,
                    error = %e,
                    "Fail-safe close could not be submitted"
                );
                format!("{reason}; close submission failed: {e}")
            }
        };

        self.sink.emit(&CycleEvent::FailSafeClose {
            position_id,
            symbol: position.symbol.clone(),
            reason: detail.clone(),
        });
        self.audit(
            AuditEvent::new(AuditKind::FailSafeClose, position_id.to_string(), detail)
                .for_cycle(position.cycle_id),
        );
        events
    }

    /// Halt new submissions, cancel working entries and close every open position.
    #[instrument(skip(self))]
    pub async fn force_close_all(&self, reason: &str) -> ForceCloseAck {
        self.halted.store(true, Ordering::SeqCst);
        let mut book = self.book.lock().await;
        book.halt_reason = Some(reason.to_string());

        error!(target: "risk_alert", reason, "FORCE CLOSE ALL");

        let entries: Vec<OrderId> = book
            .orders
            .values()
            .filter(|o| o.role == OrderRole::Entry && o.status.is_active())
            .map(|o| o.id)
            .collect();
        let mut cancelled_orders = 0;
        for id in entries {
            let events = self.cancel(&mut book, id).await;
            if !events.is_empty() {
                cancelled_orders += 1;
            }
            self.drain(&mut book, events).await;
        }

        let open: Vec<PositionId> = book
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.id)
            .collect();
        let mut close_orders = 0;
        let mut failures = Vec::new();
        for id in &open {
            let events = self.fail_safe_close(&mut book, *id, reason).await;
            self.drain(&mut book, events).await;

            if let Some(position) = book.positions.get(id) {
                if position.exit_order.is_some() || !position.is_open() {
                    close_orders += 1;
                } else {
                    failures.push(format!("{} ({})", position.symbol, position.id));
                }
            }
        }

        self.audit(AuditEvent::new(
            AuditKind::ForceClose,
            "all",
            format!(
                "{reason}: {} positions, {close_orders} closes, {cancelled_orders} entries cancelled",
                open.len()
            ),
        ));

        ForceCloseAck {
            reason: reason.to_string(),
            positions: open.len(),
            close_orders,
            cancelled_orders,
            failures,
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Cross-check local orders against the broker, trusting the broker, and
    /// make sure every open position is protected.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let remote = match self.call(self.broker.order_states()).await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped, broker unavailable");
                self.note_broker_failure(&e).await;
                report.broker_unavailable = true;
                return report;
            }
        };
        let remote: HashMap<String, BrokerOrderState> = remote
            .into_iter()
            .map(|s| (s.client_order_id.clone(), s))
            .collect();

        let mut book = self.book.lock().await;
        let orphan_after = chrono::Duration::seconds(self.config.orphan_after_secs as i64);
        let now = Utc::now();

        let local: Vec<Order> = book
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        report.checked_orders = local.len();

        for order in local {
            let aged = now - order.created_at >= orphan_after;

            let Some(state) = remote.get(&order.client_order_id) else {
                report.missing_at_broker += 1;
                if aged {
                    warn!(client_order_id = %order.client_order_id, "Order unknown to broker, marking cancelled");
                    let event = BrokerEvent {
                        sequence: order.last_sequence + 1,
                        client_order_id: order.client_order_id.clone(),
                        broker_order_id: order.broker_order_id.clone().unwrap_or_default(),
                        kind: BrokerEventKind::Cancelled,
                        filled_quantity: order.filled_quantity,
                        avg_fill_price: order.avg_fill_price,
                        timestamp: now,
                    };
                    if self.drain(&mut book, [event]).await.first() == Some(&EventOutcome::Applied) {
                        report.orphans_cancelled += 1;
                        self.audit(
                            AuditEvent::new(
                                AuditKind::OrphanCancelled,
                                order.client_order_id.clone(),
                                "order unknown to broker",
                            )
                            .for_cycle(order.cycle_id),
                        );
                    }
                }
                continue;
            };

            let expected = local_status(state.status);
            if order.status == expected && order.filled_quantity == state.filled_quantity {
                if order.role == OrderRole::Entry
                    && order.status == OrderStatus::Submitted
                    && order.filled_quantity.is_zero()
                    && aged
                {
                    info!(client_order_id = %order.client_order_id, "Cancelling stale unfilled entry");
                    let events = self.cancel(&mut book, order.id).await;
                    if !events.is_empty() {
                        report.orphans_cancelled += 1;
                        self.audit(
                            AuditEvent::new(
                                AuditKind::OrphanCancelled,
                                order.client_order_id.clone(),
                                format!("unfilled after {}s", self.config.orphan_after_secs),
                            )
                            .for_cycle(order.cycle_id),
                        );
                    }
                    self.drain(&mut book, events).await;
                }
                continue;
            }

            let mut event = BrokerEvent::from_state(state);
            event.sequence = event.sequence.max(order.last_sequence + 1);
            let outcome = self.drain(&mut book, [event]).await;
            if outcome.first() == Some(&EventOutcome::Applied) {
                report.corrections += 1;
                warn!(
                    client_order_id = %order.client_order_id,
                    from = %order.status,
                    to = %expected,
                    filled = %state.filled_quantity,
                    "Reconciliation correction applied"
                );
                self.sink.emit(&CycleEvent::ReconciliationCorrection {
                    client_order_id: order.client_order_id.clone(),
                    from: order.status,
                    to: expected,
                    filled_quantity: state.filled_quantity,
                });
                self.audit(
                    AuditEvent::new(
                        AuditKind::ReconciliationCorrection,
                        order.client_order_id.clone(),
                        format!(
                            "{} -> {} (filled {} -> {})",
                            order.status, expected, order.filled_quantity, state.filled_quantity
                        ),
                    )
                    .for_cycle(order.cycle_id),
                );
            }
        }

        let open: Vec<PositionId> = book
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.id)
            .collect();

        for position_id in open {
            let Some(position) = book.positions.get(&position_id).cloned() else {
                continue;
            };
            if !position.is_open() || book.is_active(position.exit_order) {
                continue;
            }

            if !position.has_valid_stop() {
                report.invariant_violations += 1;
                let detail = format!(
                    "stop-loss {} invalid for entry {}",
                    position.stop_loss, position.entry_price
                );
                self.report_invariant_violation(&position, &detail);
                let events = self.fail_safe_close(&mut book, position_id, &detail).await;
                self.drain(&mut book, events).await;
                continue;
            }

            if book.is_active(position.stop_order) {
                continue;
            }

            let entry_partial = book
                .orders
                .get(&position.entry_order)
                .filter(|o| o.status == OrderStatus::PartiallyFilled)
                .map(|o| (o.id, o.client_order_id.clone()));
            if let Some((entry_id, client_order_id)) = entry_partial {
                report.remainders_cancelled += 1;
                self.audit(
                    AuditEvent::new(
                        AuditKind::RemainderCancelled,
                        client_order_id,
                        format!("position {position_id} unprotected while entry partially filled"),
                    )
                    .for_cycle(position.cycle_id),
                );
                let events = self.cancel(&mut book, entry_id).await;
                self.drain(&mut book, events).await;
            }

            let still_unprotected = book
                .positions
                .get(&position_id)
                .is_some_and(|p| p.is_open() && !book.is_active(p.stop_order) && !book.is_active(p.exit_order));
            if still_unprotected {
                report.protective_placed += 1;
                warn!(position_id = %position_id, symbol = %position.symbol, "Open position without stop, placing protection");
                let events = self.place_protective(&mut book, position_id).await;
                self.drain(&mut book, events).await;
            }
        }

        if report.changed() {
            info!(
                corrections = report.corrections,
                orphans = report.orphans_cancelled,
                protective = report.protective_placed,
                remainders = report.remainders_cancelled,
                violations = report.invariant_violations,
                "Reconciliation pass changed state"
            );
        } else {
            debug!(checked = report.checked_orders, "Reconciliation pass clean");
        }
        report
    }

    /// Reconcile on a fixed interval until `stop` is set.
    pub fn spawn_reconciliation_loop(
        self: Arc<Self>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !stop.load(Ordering::SeqCst) {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                self.reconcile().await;
            }
            debug!("Reconciliation loop stopped");
        })
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild the book and risk ledger from the store after a restart.
    pub async fn restore_from_store(&self) -> anyhow::Result<usize> {
        let orders = self.store.load_orders()?;
        let positions = self.store.load_positions()?;

        let mut book = self.book.lock().await;
        for order in orders {
            book.next_order_id = book.next_order_id.max(order.id.0);
            book.by_client_id.insert(order.client_order_id.clone(), order.id);
            book.orders.insert(order.id, order);
        }
        for position in positions {
            book.next_position_id = book.next_position_id.max(position.id.0);
            book.positions.insert(position.id, position);
        }

        let open: Vec<Position> = book.positions.values().filter(|p| p.is_open()).cloned().collect();
        self.risk.restore(&open).await;
        info!(
            orders = book.orders.len(),
            open_positions = open.len(),
            "Order book restored"
        );
        Ok(open.len())
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn report_invariant_violation(&self, position: &Position, detail: &str) {
        error!(
            target: "risk_alert",
            position_id = %position.id,
            symbol = %position.symbol,
            detail,
            "INVARIANT VIOLATION"
        );
        self.sink.emit(&CycleEvent::InvariantViolation {
            position_id: position.id,
            symbol: position.symbol.clone(),
            detail: detail.to_string(),
        });
        self.audit(
            AuditEvent::new(AuditKind::InvariantViolation, position.id.to_string(), detail)
                .for_cycle(position.cycle_id),
        );
    }

    async fn note_broker_failure(&self, error: &BrokerError) {
        let triggered = match error {
            BrokerError::Rejected(_) => self.risk.record_order_failure().await,
            other => self.risk.record_broker_error(&other.to_string()).await,
        };
        self.emergency_if(triggered).await;
    }

    async fn emergency_if(&self, triggered: bool) {
        if !triggered {
            return;
        }
        let reason = self
            .risk
            .emergency_reason()
            .await
            .unwrap_or_else(|| "unknown".to_string());
        self.sink.emit(&CycleEvent::EmergencyTriggered {
            reason: reason.clone(),
        });
        self.audit(AuditEvent::new(AuditKind::EmergencyTriggered, "risk", reason));
    }

    /// Fills pushed open risk past the budget; emergency mode is already latched.
    fn report_risk_overage(&self, position: &Position, overage: RiskOverage) {
        error!(
            target: "risk_alert",
            position_id = %position.id,
            symbol = %position.symbol,
            entry = %position.entry_price,
            open_risk = %overage.open_risk,
            budget = %overage.budget,
            "Open risk exceeds daily budget after fill"
        );
        self.sink.emit(&CycleEvent::EmergencyTriggered {
            reason: overage.to_string(),
        });
        self.audit(
            AuditEvent::new(
                AuditKind::RiskBudgetExceeded,
                position.id.to_string(),
                format!("{} ({} filled at {})", overage, position.symbol, position.entry_price),
            )
            .for_cycle(position.cycle_id),
        );
    }

    fn emit_order(&self, order: &Order) {
        self.sink.emit(&CycleEvent::OrderUpdate {
            cycle_id: order.cycle_id,
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            role: order.role,
            status: order.status,
            filled_quantity: order.filled_quantity,
        });
    }

    fn persist_order(&self, order: &Order) {
        if let Err(e) = self.store.record_order(order) {
            warn!(client_order_id = %order.client_order_id, error = %e, "Failed to persist order");
        }
    }

    fn persist_position(&self, position: &Position) {
        if let Err(e) = self.store.record_position(position) {
            warn!(position_id = %position.id, error = %e, "Failed to persist position");
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.record_audit(&event) {
            warn!(kind = %event.kind, error = %e, "Failed to persist audit event");
        }
    }
}
