//! Reporting events for external consumers.
//!
//! The core emits events and never reads them back. `LogSink` writes them as
//! JSON lines on the `cycle_event` target; `ChannelSink` fans them out to
//! in-process subscribers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::cycle::{CycleId, CycleStatus};
use crate::execution::{OrderRole, OrderStatus, PositionId};
use crate::providers::InstrumentId;
use crate::risk::RejectionReason;
use crate::strategy::StageReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    Transition {
        cycle_id: CycleId,
        from: CycleStatus,
        to: CycleStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    },
    StageCompleted {
        cycle_id: CycleId,
        report: StageReport,
    },
    RiskRejected {
        cycle_id: CycleId,
        instrument: InstrumentId,
        symbol: String,
        limit: &'static str,
        reason: RejectionReason,
    },
    ProposalApproved {
        cycle_id: CycleId,
        symbol: String,
        quantity: Decimal,
        risk: Decimal,
        resized: bool,
    },
    OrderUpdate {
        cycle_id: CycleId,
        client_order_id: String,
        symbol: String,
        role: OrderRole,
        status: OrderStatus,
        filled_quantity: Decimal,
    },
    PositionOpened {
        cycle_id: CycleId,
        position_id: PositionId,
        symbol: String,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
    },
    PositionClosed {
        cycle_id: CycleId,
        position_id: PositionId,
        symbol: String,
        realized_pnl: Decimal,
    },
    ReconciliationCorrection {
        client_order_id: String,
        from: OrderStatus,
        to: OrderStatus,
        filled_quantity: Decimal,
    },
    InvariantViolation {
        position_id: PositionId,
        symbol: String,
        detail: String,
    },
    FailSafeClose {
        position_id: PositionId,
        symbol: String,
        reason: String,
    },
    EmergencyTriggered {
        reason: String,
    },
    CycleCompleted {
        cycle_id: CycleId,
        status: CycleStatus,
        degraded: bool,
        summary: String,
    },
}

impl CycleEvent {
    pub fn severity(&self) -> Severity {
        match self {
            CycleEvent::InvariantViolation { .. }
            | CycleEvent::FailSafeClose { .. }
            | CycleEvent::EmergencyTriggered { .. } => Severity::Critical,
            CycleEvent::RiskRejected { .. } | CycleEvent::ReconciliationCorrection { .. } => {
                Severity::Warning
            }
            CycleEvent::CycleCompleted { status, degraded, .. }
                if *status == CycleStatus::Aborted || *degraded =>
            {
                Severity::Warning
            }
            CycleEvent::StageCompleted { report, .. } if report.degraded => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// The `event` tag, e.g. `stage_completed`.
    pub fn name(&self) -> &'static str {
        match self {
            CycleEvent::Transition { .. } => "transition",
            CycleEvent::StageCompleted { .. } => "stage_completed",
            CycleEvent::RiskRejected { .. } => "risk_rejected",
            CycleEvent::ProposalApproved { .. } => "proposal_approved",
            CycleEvent::OrderUpdate { .. } => "order_update",
            CycleEvent::PositionOpened { .. } => "position_opened",
            CycleEvent::PositionClosed { .. } => "position_closed",
            CycleEvent::ReconciliationCorrection { .. } => "reconciliation_correction",
            CycleEvent::InvariantViolation { .. } => "invariant_violation",
            CycleEvent::FailSafeClose { .. } => "fail_safe_close",
            CycleEvent::EmergencyTriggered { .. } => "emergency_triggered",
            CycleEvent::CycleCompleted { .. } => "cycle_completed",
        }
    }
}

/// Destination for reporting events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &CycleEvent);
}

/// Writes each event as one JSON line on the `cycle_event` target.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &CycleEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to serialize cycle event");
                return;
            }
        };

        match event.severity() {
            Severity::Critical => error!(target: "cycle_event", event = event.name(), "{}", payload),
            Severity::Warning => warn!(target: "cycle_event", event = event.name(), "{}", payload),
            Severity::Info => info!(target: "cycle_event", event = event.name(), "{}", payload),
        }
    }
}

/// Broadcasts events to in-process subscribers; lagging subscribers lose events.
pub struct ChannelSink {
    tx: broadcast::Sender<CycleEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &CycleEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events whose tag matches `name`.
    pub fn named(&self, name: &str) -> Vec<CycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &CycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Sends every event to each inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &CycleEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rejection() -> CycleEvent {
        CycleEvent::RiskRejected {
            cycle_id: CycleId::new(),
            instrument: InstrumentId(7),
            symbol: "ACME".into(),
            limit: "max_positions",
            reason: RejectionReason::MaxPositions { open: 5, max: 5 },
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(rejection()).unwrap();
        assert_eq!(json["event"], "risk_rejected");
        assert_eq!(json["limit"], "max_positions");
        assert_eq!(json["reason"]["kind"], "max_positions");
        assert_eq!(json["reason"]["max"], 5);
    }

    #[test]
    fn test_severity() {
        assert_eq!(rejection().severity(), Severity::Warning);
        let critical = CycleEvent::EmergencyTriggered {
            reason: "daily loss".into(),
        };
        assert_eq!(critical.severity(), Severity::Critical);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let sink = ChannelSink::new(16);
        let mut rx = sink.subscribe();
        sink.emit(&rejection());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "risk_rejected");
    }

    #[test]
    fn test_channel_subscriber_wakes_on_emit() {
        let sink = ChannelSink::new(4);
        let mut rx = sink.subscribe();
        let mut recv = tokio_test::task::spawn(async move { rx.recv().await });

        tokio_test::assert_pending!(recv.poll());
        sink.emit(&rejection());
        assert!(recv.is_woken());

        let event = tokio_test::assert_ready!(recv.poll()).unwrap();
        assert_eq!(event.name(), "risk_rejected");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let mut fanout = FanoutSink::default();
        fanout.push(a.clone());
        fanout.push(b.clone());
        fanout.push(Arc::new(LogSink));

        fanout.emit(&CycleEvent::PositionClosed {
            cycle_id: CycleId::new(),
            position_id: PositionId(1),
            symbol: "ACME".into(),
            realized_pnl: dec!(12.5),
        });

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.named("position_closed").len(), 1);
    }
}
