//! Emergency-mode detection.
//!
//! Emergency mode is latched: once triggered, every new proposal is rejected
//! until an operator resets it. Triggers:
//! - Manual operator request
//! - Daily loss limit breach
//! - Open risk pushed past the cumulative budget by fills
//! - Consecutive broker order failures
//! - Broker error spikes
//! - Position invariant violations

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info};

use crate::config::RiskConfig;

/// What put the system into emergency mode.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum EmergencyCause {
    Manual {
        reason: String,
    },
    DailyLossLimit {
        loss_pct: Decimal,
        limit: Decimal,
    },
    RiskBudgetExceeded {
        open_risk: Decimal,
        budget: Decimal,
    },
    OrderFailures {
        consecutive_failures: u32,
    },
    ErrorSpike {
        error_count: u32,
        window_secs: u64,
    },
    InvariantViolation {
        detail: String,
    },
}

impl fmt::Display for EmergencyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyCause::Manual { reason } => write!(f, "manual: {reason}"),
            EmergencyCause::DailyLossLimit { loss_pct, limit } => {
                write!(f, "daily loss {loss_pct} reached limit {limit}")
            }
            EmergencyCause::RiskBudgetExceeded { open_risk, budget } => {
                write!(f, "open risk {open_risk} exceeds budget {budget}")
            }
            EmergencyCause::OrderFailures {
                consecutive_failures,
            } => write!(f, "{consecutive_failures} consecutive order failures"),
            EmergencyCause::ErrorSpike {
                error_count,
                window_secs,
            } => write!(f, "{error_count} broker errors in {window_secs}s"),
            EmergencyCause::InvariantViolation { detail } => {
                write!(f, "invariant violation: {detail}")
            }
        }
    }
}

/// A latched emergency.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyTrigger {
    pub cause: EmergencyCause,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    /// Consecutive order failures before emergency
    pub max_consecutive_failures: u32,
    /// Broker errors tolerated inside the window
    pub max_errors_per_window: u32,
    /// Error window length
    pub error_window_secs: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_errors_per_window: 10,
            error_window_secs: 300,
        }
    }
}

impl From<&RiskConfig> for EmergencyConfig {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures,
            max_errors_per_window: config.max_errors_per_window,
            error_window_secs: config.error_window_secs,
        }
    }
}

/// Tracks failure signals and the latched emergency flag.
pub struct EmergencyState {
    config: EmergencyConfig,
    /// Recent errors with timestamps
    error_history: VecDeque<DateTime<Utc>>,
    consecutive_failures: u32,
    active: Option<EmergencyTrigger>,
}

impl EmergencyState {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            config,
            error_history: VecDeque::new(),
            consecutive_failures: 0,
            active: None,
        }
    }

    /// Latch emergency mode. Returns false if it was already active; the
    /// first cause is kept.
    pub fn trigger(&mut self, cause: EmergencyCause) -> bool {
        if let Some(existing) = &self.active {
            debug!(existing = %existing.cause, new = %cause, "Emergency already active");
            return false;
        }

        error!(
            target: "risk_alert",
            cause = %cause,
            "EMERGENCY MODE: all new proposals will be rejected"
        );
        self.active = Some(EmergencyTrigger {
            cause,
            triggered_at: Utc::now(),
        });
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&EmergencyTrigger> {
        self.active.as_ref()
    }

    pub fn reason(&self) -> Option<String> {
        self.active.as_ref().map(|t| t.cause.to_string())
    }

    /// Record a broker or execution error.
    pub fn record_error(&mut self, error: &str) -> bool {
        let now = Utc::now();
        self.error_history.push_back(now);

        // Clean old errors outside window
        let window_start = now - Duration::seconds(self.config.error_window_secs as i64);
        while let Some(timestamp) = self.error_history.front() {
            if *timestamp < window_start {
                self.error_history.pop_front();
            } else {
                break;
            }
        }

        let error_count = self.error_history.len() as u32;
        debug!(error = %error, error_count, "Recorded broker error");

        if error_count >= self.config.max_errors_per_window {
            return self.trigger(EmergencyCause::ErrorSpike {
                error_count,
                window_secs: self.config.error_window_secs,
            });
        }
        false
    }

    /// Record an order the broker refused or never answered.
    pub fn record_order_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        debug!(
            consecutive_failures = self.consecutive_failures,
            "Recorded order failure"
        );

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return self.trigger(EmergencyCause::OrderFailures {
                consecutive_failures: self.consecutive_failures,
            });
        }
        false
    }

    /// Record a successful order (resets failure counter).
    pub fn record_order_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                previous_failures = self.consecutive_failures,
                "Order success - resetting failure counter"
            );
        }
        self.consecutive_failures = 0;
    }

    /// Clear the latch and counters.
    pub fn reset(&mut self) {
        if let Some(trigger) = self.active.take() {
            info!(cause = %trigger.cause, "Emergency mode cleared");
        }
        self.consecutive_failures = 0;
        self.error_history.clear();
    }
}
