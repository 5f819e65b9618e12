//! Cycle state, limits and the audit trail of its transitions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::{ModeProfile, RiskConfig, TradingMode};
use crate::error::CycleError;
use crate::strategy::{Stage, StageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(pub Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for client order ids and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleStatus {
    Idle,
    Scanning,
    CatalystFiltering,
    PatternFiltering,
    TechnicalFiltering,
    RiskValidating,
    Executing,
    Monitoring,
    Completed,
    Aborted,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Aborted)
    }

    /// Claimed and not yet terminal.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != CycleStatus::Idle
    }

    /// The stage that follows on a non-empty output.
    pub fn next_stage(self) -> Option<CycleStatus> {
        use CycleStatus::*;
        match self {
            Idle => Some(Scanning),
            Scanning => Some(CatalystFiltering),
            CatalystFiltering => Some(PatternFiltering),
            PatternFiltering => Some(TechnicalFiltering),
            TechnicalFiltering => Some(RiskValidating),
            RiskValidating => Some(Executing),
            Executing => Some(Monitoring),
            Monitoring => Some(Completed),
            Completed | Aborted => None,
        }
    }

    pub fn can_transition_to(self, next: CycleStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            CycleStatus::Aborted => true,
            // empty stage output short-circuits to Completed
            CycleStatus::Completed => self != CycleStatus::Idle,
            other => self.next_stage() == Some(other),
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Hard limits the risk validator enforces for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLimits {
    pub max_positions: u32,
    /// Fraction of equity one trade may lose
    pub max_risk_per_trade: Decimal,
    /// Fraction of equity all open positions together may lose
    pub max_daily_loss: Decimal,
}

impl CycleLimits {
    pub fn from_profile(profile: &ModeProfile, risk: &RiskConfig) -> Self {
        Self {
            max_positions: profile.max_positions,
            max_risk_per_trade: profile.risk_per_trade,
            max_daily_loss: risk.max_daily_loss,
        }
    }

    pub fn validate(&self) -> Result<(), CycleError> {
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;
        if self.max_positions == 0 {
            return Err(CycleError::InvalidConfig(
                "max_positions must be at least 1".to_string(),
            ));
        }
        if !unit(self.max_risk_per_trade) {
            return Err(CycleError::InvalidConfig(format!(
                "max_risk_per_trade {} must be in (0, 1]",
                self.max_risk_per_trade
            )));
        }
        if !unit(self.max_daily_loss) {
            return Err(CycleError::InvalidConfig(format!(
                "max_daily_loss {} must be in (0, 1]",
                self.max_daily_loss
            )));
        }
        if self.max_risk_per_trade > self.max_daily_loss {
            return Err(CycleError::InvalidConfig(format!(
                "max_risk_per_trade {} exceeds max_daily_loss {}",
                self.max_risk_per_trade, self.max_daily_loss
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleCounters {
    pub scanned: usize,
    pub catalyst_passed: usize,
    pub pattern_passed: usize,
    pub technical_passed: usize,
    pub selected: usize,
    pub proposals: usize,
    pub approved: usize,
    pub rejected: usize,
    pub orders_submitted: usize,
    pub positions_opened: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: CycleStatus,
    pub to: CycleStatus,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Why a cycle ended in `Aborted`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail")]
pub enum AbortReason {
    DataUnavailable(String),
    StageDegraded(Stage),
    /// No provider answered at all
    StageFailed(Stage),
    EmergencyMode(String),
    DailyLossLimit { loss_pct: Decimal },
    Stopped(String),
    InvariantViolation(String),
    AccountUnavailable(String),
}

impl AbortReason {
    /// Whether open positions must be flattened.
    pub fn requires_flatten(&self) -> bool {
        matches!(
            self,
            AbortReason::EmergencyMode(_)
                | AbortReason::DailyLossLimit { .. }
                | AbortReason::InvariantViolation(_)
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::DataUnavailable(detail) => write!(f, "DataUnavailable: {detail}"),
            AbortReason::StageDegraded(stage) => write!(f, "StageDegraded:{stage}"),
            AbortReason::StageFailed(stage) => write!(f, "StageFailed:{stage}"),
            AbortReason::EmergencyMode(reason) => write!(f, "EmergencyMode: {reason}"),
            AbortReason::DailyLossLimit { loss_pct } => write!(f, "DailyLossLimit: {loss_pct}"),
            AbortReason::Stopped(reason) => write!(f, "Stopped: {reason}"),
            AbortReason::InvariantViolation(detail) => write!(f, "InvariantViolation: {detail}"),
            AbortReason::AccountUnavailable(detail) => write!(f, "AccountUnavailable: {detail}"),
        }
    }
}

/// One run of the pipeline. Only the orchestrator mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cycle {
    pub id: CycleId,
    pub mode: TradingMode,
    pub status: CycleStatus,
    pub limits: CycleLimits,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counters: CycleCounters,
    pub stage_reports: Vec<StageReport>,
    pub transitions: Vec<Transition>,
    pub abort_reason: Option<AbortReason>,
    /// Why the cycle completed early, e.g. "no candidates after Pattern"
    pub completion_note: Option<String>,
    pub summary: Option<String>,
}

impl Cycle {
    pub fn new(id: CycleId, mode: TradingMode, limits: CycleLimits) -> Self {
        Self {
            id,
            mode,
            status: CycleStatus::Idle,
            limits,
            degraded: false,
            started_at: Utc::now(),
            ended_at: None,
            counters: CycleCounters::default(),
            stage_reports: Vec::new(),
            transitions: Vec::new(),
            abort_reason: None,
            completion_note: None,
            summary: None,
        }
    }

    /// Move to `to`; illegal edges are refused and logged.
    pub fn transition(&mut self, to: CycleStatus, note: Option<String>) -> Option<Transition> {
        if !self.status.can_transition_to(to) {
            warn!(
                cycle_id = %self.id,
                from = %self.status,
                to = %to,
                "Illegal cycle transition refused"
            );
            return None;
        }

        let transition = Transition {
            from: self.status,
            to,
            at: Utc::now(),
            note,
        };
        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(transition.at);
            self.summary = Some(self.summary_text());
        }
        self.transitions.push(transition.clone());
        Some(transition)
    }

    /// Human-readable outcome with per-stage pass counts.
    pub fn summary_text(&self) -> String {
        let c = &self.counters;
        let mut text = format!(
            "{} [{}]: universe {}, catalyst {}, pattern {}, technical {}, selected {}, approved {}, rejected {}, orders {}, positions {}",
            self.status,
            self.mode,
            c.scanned,
            c.catalyst_passed,
            c.pattern_passed,
            c.technical_passed,
            c.selected,
            c.approved,
            c.rejected,
            c.orders_submitted,
            c.positions_opened,
        );
        if let Some(note) = &self.completion_note {
            text.push_str(&format!("; {note}"));
        }
        let degraded: Vec<String> = self
            .stage_reports
            .iter()
            .filter(|r| r.degraded || r.provider_timeouts > 0)
            .map(|r| format!("{} ({} failed of {})", r.stage, r.failed(), r.dispatched()))
            .collect();
        if self.degraded {
            text.push_str("; degraded");
            if !degraded.is_empty() {
                text.push_str(&format!(": {}", degraded.join(", ")));
            }
        }
        if let Some(reason) = &self.abort_reason {
            text.push_str(&format!("; aborted: {reason}"));
        }
        text
    }
}

/// Point-in-time view returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSnapshot {
    pub status: CycleStatus,
    pub active: bool,
    pub cycle: Option<Cycle>,
}

/// Parameters for starting a cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleRequest {
    /// Defaults to the configured mode
    pub mode: Option<TradingMode>,
    /// Defaults to the mode profile's limits
    pub limits: Option<CycleLimits>,
}

impl CycleRequest {
    pub fn with_mode(mode: TradingMode) -> Self {
        Self {
            mode: Some(mode),
            limits: None,
        }
    }
}

/// Claim on the single active-cycle slot, passed to the components working on it.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    pub cycle_id: CycleId,
    pub mode: TradingMode,
    pub limits: CycleLimits,
    stop: Arc<AtomicBool>,
}

impl CycleHandle {
    pub(crate) fn new(cycle_id: CycleId, mode: TradingMode, limits: CycleLimits) -> Self {
        Self {
            cycle_id,
            mode,
            limits,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopAck {
    pub cycle_id: Option<CycleId>,
    /// False when no cycle was active
    pub accepted: bool,
    pub reason: String,
}
