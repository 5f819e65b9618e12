//! Hard risk gates applied to every trade proposal before capital is committed.
//!
//! The validator owns the risk ledger (reservations for pending entries and
//! open positions), the emergency latch and the daily loss tracker. All of it
//! sits behind one mutex, so validations are serialized.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::daily_loss::{DailyLossStats, DailyLossTracker};
use super::emergency::{EmergencyCause, EmergencyConfig, EmergencyState};
use crate::config::RiskConfig;
use crate::cycle::{CycleId, CycleLimits};
use crate::execution::{Position, PositionSide};
use crate::providers::InstrumentId;
use crate::strategy::TradeProposal;
use crate::utils::decimal::{round_down_to_lot, safe_div};

/// The limit a rejected proposal breached.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    EmergencyMode {
        reason: String,
    },
    MaxPositions {
        open: usize,
        max: u32,
    },
    MissingStopLoss,
    ZeroStopDistance {
        entry: Decimal,
    },
    StopOnWrongSide {
        entry: Decimal,
        stop: Decimal,
    },
    PerTradeRiskExceeded {
        risk: Decimal,
        limit: Decimal,
    },
    DailyRiskBudgetExceeded {
        open_risk: Decimal,
        proposed: Decimal,
        limit: Decimal,
    },
    AlreadyExposed {
        instrument: InstrumentId,
    },
}

impl RejectionReason {
    /// Short name of the breached limit.
    pub fn limit_name(&self) -> &'static str {
        match self {
            RejectionReason::EmergencyMode { .. } => "emergency_mode",
            RejectionReason::MaxPositions { .. } => "max_positions",
            RejectionReason::MissingStopLoss => "missing_stop_loss",
            RejectionReason::ZeroStopDistance { .. } => "zero_stop_distance",
            RejectionReason::StopOnWrongSide { .. } => "stop_on_wrong_side",
            RejectionReason::PerTradeRiskExceeded { .. } => "max_risk_per_trade",
            RejectionReason::DailyRiskBudgetExceeded { .. } => "max_daily_loss",
            RejectionReason::AlreadyExposed { .. } => "already_exposed",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::EmergencyMode { reason } => write!(f, "emergency mode active: {reason}"),
            RejectionReason::MaxPositions { open, max } => {
                write!(f, "max positions reached ({open}/{max})")
            }
            RejectionReason::MissingStopLoss => write!(f, "stop-loss missing or not positive"),
            RejectionReason::ZeroStopDistance { entry } => {
                write!(f, "stop-loss equals entry price {entry}")
            }
            RejectionReason::StopOnWrongSide { entry, stop } => {
                write!(f, "stop-loss {stop} is on the wrong side of entry {entry}")
            }
            RejectionReason::PerTradeRiskExceeded { risk, limit } => {
                write!(f, "per-trade risk {risk} exceeds max_risk_per_trade {limit}")
            }
            RejectionReason::DailyRiskBudgetExceeded {
                open_risk,
                proposed,
                limit,
            } => write!(
                f,
                "open risk {open_risk} plus {proposed} exceeds max_daily_loss {limit}"
            ),
            RejectionReason::AlreadyExposed { instrument } => {
                write!(f, "instrument {instrument} already has an entry or position")
            }
        }
    }
}

/// An approved, possibly resized, proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedTrade {
    pub proposal: TradeProposal,
    pub risk: Decimal,
    pub resized: bool,
}

impl ApprovedTrade {
    pub fn quantity(&self) -> Decimal {
        self.proposal.quantity()
    }

    pub fn instrument(&self) -> InstrumentId {
        self.proposal.instrument().id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved(ApprovedTrade),
    Rejected(RejectionReason),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved(_))
    }
}

/// Open risk above the cumulative budget after fills landed worse than planned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskOverage {
    pub open_risk: Decimal,
    pub budget: Decimal,
}

impl fmt::Display for RiskOverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "open risk {} exceeds budget {}", self.open_risk, self.budget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum ReservationState {
    /// Approved, entry not yet filled
    Reserved,
    /// Backed by an open position
    Open,
}

#[derive(Debug, Clone)]
struct Reservation {
    cycle_id: CycleId,
    risk: Decimal,
    state: ReservationState,
}

struct RiskLedger {
    reservations: BTreeMap<InstrumentId, Reservation>,
    emergency: EmergencyState,
    daily: Option<DailyLossTracker>,
    /// Cumulative risk budget of the last validation, in currency
    budget: Option<Decimal>,
}

impl RiskLedger {
    fn open_risk(&self) -> Decimal {
        self.reservations.values().map(|r| r.risk).sum()
    }
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub open_positions: usize,
    pub pending_reservations: usize,
    pub open_risk: Decimal,
    pub emergency: Option<String>,
    pub daily_loss: Option<DailyLossStats>,
}

pub struct RiskValidator {
    resize_on_overage: bool,
    lot_size: Decimal,
    ledger: Mutex<RiskLedger>,
}

impl RiskValidator {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            resize_on_overage: config.resize_on_overage,
            lot_size: config.lot_size,
            ledger: Mutex::new(RiskLedger {
                reservations: BTreeMap::new(),
                emergency: EmergencyState::new(EmergencyConfig::from(config)),
                daily: None,
                budget: None,
            }),
        }
    }

    /// Run the risk checks in order and reserve the proposal's risk on approval.
    pub async fn validate(
        &self,
        proposal: &TradeProposal,
        limits: &CycleLimits,
        equity: Decimal,
    ) -> RiskDecision {
        let mut ledger = self.ledger.lock().await;
        ledger.budget = Some(limits.max_daily_loss * equity);
        let decision = self.assess(proposal, limits, &ledger, equity);

        match &decision {
            RiskDecision::Approved(trade) => {
                ledger.reservations.insert(
                    trade.instrument(),
                    Reservation {
                        cycle_id: proposal.cycle_id(),
                        risk: trade.risk,
                        state: ReservationState::Reserved,
                    },
                );
                info!(
                    symbol = %proposal.instrument().symbol,
                    quantity = %trade.quantity(),
                    risk = %trade.risk,
                    resized = trade.resized,
                    open_risk = %ledger.open_risk(),
                    "Proposal approved"
                );
            }
            RiskDecision::Rejected(reason) => {
                warn!(
                    symbol = %proposal.instrument().symbol,
                    limit = reason.limit_name(),
                    %reason,
                    "Proposal rejected"
                );
            }
        }

        decision
    }

    fn assess(
        &self,
        proposal: &TradeProposal,
        limits: &CycleLimits,
        ledger: &RiskLedger,
        equity: Decimal,
    ) -> RiskDecision {
        use RejectionReason::*;

        // 0. Emergency mode
        if let Some(reason) = ledger.emergency.reason() {
            return RiskDecision::Rejected(EmergencyMode { reason });
        }

        // 1. Position count (open + reserved)
        let open = ledger.reservations.len();
        if open >= limits.max_positions as usize {
            return RiskDecision::Rejected(MaxPositions {
                open,
                max: limits.max_positions,
            });
        }

        // 2. Stop-loss present, distinct and protective
        let entry = proposal.entry_price();
        let stop = proposal.stop_loss();
        if stop <= Decimal::ZERO {
            return RiskDecision::Rejected(MissingStopLoss);
        }
        if stop == entry {
            return RiskDecision::Rejected(ZeroStopDistance { entry });
        }
        let protective = match proposal.side() {
            PositionSide::Long => stop < entry,
            PositionSide::Short => stop > entry,
        };
        if !protective {
            return RiskDecision::Rejected(StopOnWrongSide { entry, stop });
        }

        // 3. Per-trade risk, inclusive
        let per_trade_limit = limits.max_risk_per_trade * equity;
        let mut approved = proposal.clone();
        let mut resized = false;
        if proposal.risk() > per_trade_limit {
            let fit = round_down_to_lot(
                safe_div(per_trade_limit, proposal.risk_per_unit()),
                self.lot_size,
            );
            match (self.resize_on_overage, proposal.resized(fit)) {
                (true, Ok(smaller)) => {
                    debug!(
                        symbol = %proposal.instrument().symbol,
                        from = %proposal.quantity(),
                        to = %fit,
                        "Resized proposal to per-trade limit"
                    );
                    approved = smaller;
                    resized = true;
                }
                _ => {
                    return RiskDecision::Rejected(PerTradeRiskExceeded {
                        risk: proposal.risk(),
                        limit: per_trade_limit,
                    })
                }
            }
        }
        let risk = approved.risk();

        // 4. Cumulative open risk against the daily loss budget
        let open_risk = ledger.open_risk();
        let daily_limit = limits.max_daily_loss * equity;
        if open_risk + risk > daily_limit {
            return RiskDecision::Rejected(DailyRiskBudgetExceeded {
                open_risk,
                proposed: risk,
                limit: daily_limit,
            });
        }

        if ledger.reservations.contains_key(&proposal.instrument().id) {
            return RiskDecision::Rejected(AlreadyExposed {
                instrument: proposal.instrument().id,
            });
        }

        RiskDecision::Approved(ApprovedTrade {
            proposal: approved,
            risk,
            resized,
        })
    }

    /// Drop the reservation for an instrument (entry rejected, cancelled
    /// unfilled, or position closed).
    pub async fn release(&self, instrument: InstrumentId) -> Option<Decimal> {
        let mut ledger = self.ledger.lock().await;
        let released = ledger.reservations.remove(&instrument).map(|r| r.risk);
        if let Some(risk) = released {
            debug!(%instrument, %risk, open_risk = %ledger.open_risk(), "Risk reservation released");
        }
        released
    }

    /// Replace the reserved risk with the risk of the live position.
    ///
    /// Fills worse than the planned entry can push open risk past the
    /// cumulative budget; that latches emergency mode and returns the overage.
    pub async fn mark_open(
        &self,
        cycle_id: CycleId,
        instrument: InstrumentId,
        risk: Decimal,
    ) -> Option<RiskOverage> {
        let mut ledger = self.ledger.lock().await;
        let entry = ledger
            .reservations
            .entry(instrument)
            .or_insert(Reservation {
                cycle_id,
                risk,
                state: ReservationState::Open,
            });
        entry.risk = risk;
        entry.state = ReservationState::Open;

        let budget = ledger.budget?;
        let open_risk = ledger.open_risk();
        if open_risk <= budget {
            return None;
        }
        ledger.emergency.trigger(EmergencyCause::RiskBudgetExceeded { open_risk, budget });
        Some(RiskOverage { open_risk, budget })
    }

    /// Rebuild the ledger from persisted open positions (after restart).
    pub async fn restore(&self, positions: &[Position]) {
        let mut ledger = self.ledger.lock().await;
        ledger.reservations.clear();
        for position in positions.iter().filter(|p| p.is_open()) {
            ledger.reservations.insert(
                position.instrument,
                Reservation {
                    cycle_id: position.cycle_id,
                    risk: position.risk(),
                    state: ReservationState::Open,
                },
            );
        }
        info!(
            positions = ledger.reservations.len(),
            open_risk = %ledger.open_risk(),
            "Risk ledger restored"
        );
    }

    pub async fn snapshot(&self) -> RiskSnapshot {
        let ledger = self.ledger.lock().await;
        let open_positions = ledger
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Open)
            .count();

        RiskSnapshot {
            open_positions,
            pending_reservations: ledger.reservations.len() - open_positions,
            open_risk: ledger.open_risk(),
            emergency: ledger.emergency.reason(),
            daily_loss: ledger.daily.as_ref().map(|d| d.statistics()),
        }
    }

    // =========================================================================
    // Emergency mode
    // =========================================================================

    pub async fn trigger_emergency(&self, cause: EmergencyCause) -> bool {
        self.ledger.lock().await.emergency.trigger(cause)
    }

    pub async fn is_emergency(&self) -> bool {
        self.ledger.lock().await.emergency.is_active()
    }

    pub async fn emergency_reason(&self) -> Option<String> {
        self.ledger.lock().await.emergency.reason()
    }

    pub async fn reset_emergency(&self) {
        self.ledger.lock().await.emergency.reset();
    }

    pub async fn record_order_failure(&self) -> bool {
        self.ledger.lock().await.emergency.record_order_failure()
    }

    pub async fn record_order_success(&self) {
        self.ledger.lock().await.emergency.record_order_success();
    }

    pub async fn record_broker_error(&self, error: &str) -> bool {
        self.ledger.lock().await.emergency.record_error(error)
    }

    /// Feed the latest account equity into the daily loss tracker, checked
    /// against the running cycle's `max_daily_loss`.
    ///
    /// A breach latches emergency mode. Returns the current loss fraction
    /// when breached.
    pub async fn record_equity(
        &self,
        equity: Decimal,
        max_daily_loss: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        let mut ledger = self.ledger.lock().await;
        let tracker = ledger
            .daily
            .get_or_insert_with(|| DailyLossTracker::new(max_daily_loss, equity, now));

        if !tracker.update(equity, max_daily_loss, now) {
            return None;
        }

        let loss_pct = tracker.current_loss();
        ledger.emergency.trigger(EmergencyCause::DailyLossLimit {
            loss_pct,
            limit: max_daily_loss,
        });
        Some(loss_pct)
    }
}
