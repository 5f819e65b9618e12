//! Typed error taxonomy for the trading cycle.
//!
//! Per-instrument provider failures are absorbed at the stage boundary and
//! only surface in a `StageReport`. Cycle-level and broker-level errors
//! propagate to the orchestrator, which decides whether to abort.

use thiserror::Error;

use crate::cycle::CycleId;

/// Failure of a single signal-provider call for one instrument.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("{provider} timed out after {after_ms}ms")]
    Timeout {
        provider: &'static str,
        after_ms: u64,
    },

    #[error("{provider} failed: {reason}")]
    Failed {
        provider: &'static str,
        reason: String,
    },

    #[error("{provider} has no data for instrument {instrument}")]
    NotFound {
        provider: &'static str,
        instrument: String,
    },
}

impl ProviderError {
    /// True when the call did not answer in time (as opposed to answering with an error).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }
}

/// Errors returned by the cycle orchestrator's public contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CycleError {
    #[error("cycle {cycle_id} is already active")]
    AlreadyActive { cycle_id: CycleId },

    #[error("invalid cycle configuration: {0}")]
    InvalidConfig(String),

    #[error("market data unavailable: {0}")]
    DataUnavailable(String),
}

/// Broker-side failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("broker call timed out after {0}ms")]
    Timeout(u64),

    #[error("order rejected by broker: {0}")]
    Rejected(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("failed to decode broker response: {0}")]
    Decode(String),

    #[error("broker has no order {0}")]
    UnknownOrder(String),
}

/// Errors from the order/position manager.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order manager halted: {0}")]
    Halted(String),

    #[error("instrument {0} already has an active entry or open position")]
    DuplicateEntry(String),

    #[error("order {client_order_id} rejected: {reason}")]
    OrderRejected {
        client_order_id: String,
        reason: String,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display_names_provider() {
        let err = ProviderError::Timeout {
            provider: "catalyst_scorer",
            after_ms: 1500,
        };
        assert_eq!(err.to_string(), "catalyst_scorer timed out after 1500ms");
        assert!(err.is_timeout());

        let err = ProviderError::Failed {
            provider: "pattern_detector",
            reason: "502 bad gateway".to_string(),
        };
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_broker_error_converts_into_execution_error() {
        let err: ExecutionError = BrokerError::Rejected("insufficient buying power".into()).into();
        assert!(matches!(err, ExecutionError::Broker(BrokerError::Rejected(_))));
        assert_eq!(
            err.to_string(),
            "order rejected by broker: insufficient buying power"
        );
    }
}
