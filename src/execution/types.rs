//! Orders and positions as the order manager tracks them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::broker::{OrderSide, OrderType};
use crate::cycle::CycleId;
use crate::providers::InstrumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    pub fn exit_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// What an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    /// Market close (fail-safe or forced)
    Exit,
}

impl OrderRole {
    pub fn is_protective(self) -> bool {
        matches!(self, OrderRole::StopLoss | OrderRole::TakeProfit)
    }

    /// Short code used in client order ids.
    pub fn code(self) -> &'static str {
        match self {
            OrderRole::Entry => "en",
            OrderRole::StopLoss => "sl",
            OrderRole::TakeProfit => "tp",
            OrderRole::Exit => "ex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Working at the broker (may still fill).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }

    /// Legal order state machine edges.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Rejected)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (Submitted, Rejected)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub cycle_id: CycleId,
    pub position_id: Option<PositionId>,
    pub instrument: InstrumentId,
    pub symbol: String,
    pub role: OrderRole,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Protective levels carried by an entry until its position exists
    pub planned_stop_loss: Option<Decimal>,
    pub planned_take_profit: Option<Decimal>,
    pub status: OrderStatus,
    /// Highest broker sequence applied
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub cycle_id: CycleId,
    pub instrument: InstrumentId,
    pub symbol: String,
    pub side: PositionSide,
    /// Shares still held
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub status: PositionStatus,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub entry_order: OrderId,
    pub stop_order: Option<OrderId>,
    pub target_order: Option<OrderId>,
    pub exit_order: Option<OrderId>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status != PositionStatus::Closed
    }

    /// Loss if the stop is hit.
    pub fn risk(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs() * self.quantity
    }

    /// Positive stop at non-zero distance on the protective side of entry.
    pub fn has_valid_stop(&self) -> bool {
        if self.stop_loss <= Decimal::ZERO || self.stop_loss == self.entry_price {
            return false;
        }
        match self.side {
            PositionSide::Long => self.stop_loss < self.entry_price,
            PositionSide::Short => self.stop_loss > self.entry_price,
        }
    }

    pub fn mark_to_market(&mut self, price: Decimal) {
        self.unrealized_pnl = (price - self.entry_price) * self.quantity * self.side.sign();
    }

    /// Book a close of `quantity` at `price`; returns the realized P&L of this close.
    pub fn book_close(&mut self, quantity: Decimal, price: Decimal, now: DateTime<Utc>) -> Decimal {
        let quantity = quantity.min(self.quantity);
        let pnl = (price - self.entry_price) * quantity * self.side.sign();
        self.realized_pnl += pnl;
        self.quantity -= quantity;

        if self.quantity <= Decimal::ZERO {
            self.quantity = Decimal::ZERO;
            self.unrealized_pnl = Decimal::ZERO;
            self.status = PositionStatus::Closed;
            self.closed_at = Some(now);
        } else {
            self.status = PositionStatus::PartiallyClosed;
        }
        pnl
    }
}

/// Returned by a successful submit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderHandle {
    pub order_id: OrderId,
    pub client_order_id: String,
    pub status: OrderStatus,
}

/// Result of applying one broker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// Sequence not newer than the last applied one
    Stale,
    /// No local order with that client id
    Unknown,
    IllegalTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForceCloseAck {
    pub reason: String,
    pub positions: usize,
    pub close_orders: usize,
    pub cancelled_orders: usize,
    pub failures: Vec<String>,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub checked_orders: usize,
    pub corrections: usize,
    pub missing_at_broker: usize,
    pub orphans_cancelled: usize,
    pub protective_placed: usize,
    pub remainders_cancelled: usize,
    pub invariant_violations: usize,
    pub broker_unavailable: bool,
}

impl ReconcileReport {
    /// True when the pass changed local state or sent broker requests.
    pub fn changed(&self) -> bool {
        self.corrections > 0
            || self.orphans_cancelled > 0
            || self.protective_placed > 0
            || self.remainders_cancelled > 0
            || self.invariant_violations > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(side: PositionSide, entry: Decimal, stop: Decimal) -> Position {
        Position {
            id: PositionId(1),
            cycle_id: CycleId::new(),
            instrument: InstrumentId(1),
            symbol: "ACME".into(),
            side,
            quantity: dec!(100),
            entry_price: entry,
            stop_loss: stop,
            take_profit: entry * dec!(1.04),
            status: PositionStatus::Open,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            entry_order: OrderId(1),
            stop_order: None,
            target_order: None,
            exit_order: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_order_state_machine() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Filled));
        assert!(PartiallyFilled.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Cancelled));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Filled));
        assert!(!PartiallyFilled.can_transition_to(Rejected));
    }

    #[test]
    fn test_stop_validity() {
        assert!(position(PositionSide::Long, dec!(100), dec!(98)).has_valid_stop());
        assert!(!position(PositionSide::Long, dec!(100), dec!(100)).has_valid_stop());
        assert!(!position(PositionSide::Long, dec!(100), Decimal::ZERO).has_valid_stop());
        assert!(!position(PositionSide::Long, dec!(100), dec!(101)).has_valid_stop());
        assert!(position(PositionSide::Short, dec!(100), dec!(102)).has_valid_stop());
    }

    #[test]
    fn test_partial_then_full_close() {
        let mut p = position(PositionSide::Long, dec!(100), dec!(98));
        assert_eq!(p.risk(), dec!(200));

        let pnl = p.book_close(dec!(40), dec!(104), Utc::now());
        assert_eq!(pnl, dec!(160));
        assert_eq!(p.status, PositionStatus::PartiallyClosed);
        assert!(p.is_open());

        p.book_close(dec!(60), dec!(98), Utc::now());
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.realized_pnl, dec!(40));
        assert!(p.closed_at.is_some());
    }

    #[test]
    fn test_short_mark_to_market() {
        let mut p = position(PositionSide::Short, dec!(100), dec!(102));
        p.mark_to_market(dec!(95));
        assert_eq!(p.unrealized_pnl, dec!(500));
    }
}
