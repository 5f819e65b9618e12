//! Risk gating for the trading cycle.
//!
//! Provides the hard limits every proposal must pass:
//! - Position count, per-trade risk and cumulative risk checks
//! - Stop-loss presence and placement
//! - Daily loss tracking against start-of-day equity
//! - Latched emergency mode

mod daily_loss;
mod emergency;
mod validator;

pub use daily_loss::{DailyLossStats, DailyLossTracker};
pub use emergency::{EmergencyCause, EmergencyConfig, EmergencyState, EmergencyTrigger};
pub use validator::{
    ApprovedTrade, RejectionReason, RiskDecision, RiskOverage, RiskSnapshot, RiskValidator,
};
