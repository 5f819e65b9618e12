//! Provider-agnostic traits for the external signal and market-data sources.
//!
//! The core only sees these traits. Concrete implementations live outside the
//! engine; `InMemoryProviders` and `SyntheticMarket` back tests and paper runs.

mod memory;
mod synthetic;
pub mod types;

pub use memory::{Fault, InMemoryProviders, SignalKind};
pub use synthetic::SyntheticMarket;
pub use types::*;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Resolves symbols to instruments and serves reference data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstrumentRepository: Send + Sync {
    async fn resolve(&self, symbol: &str) -> Result<Instrument, ProviderError>;

    async fn metadata(&self, id: InstrumentId) -> Result<InstrumentMetadata, ProviderError>;
}

/// Upstream liquidity feed consumed by the universe selector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Current price and session volume for every known instrument.
    async fn liquidity_snapshot(&self) -> Result<Vec<LiquiditySnapshot>, ProviderError>;
}

/// News-catalyst scoring.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalystScorer: Send + Sync {
    async fn score(
        &self,
        id: InstrumentId,
        window_hours: u32,
    ) -> Result<CatalystSignal, ProviderError>;
}

/// Chart-pattern detection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PatternDetector: Send + Sync {
    async fn detect(
        &self,
        id: InstrumentId,
        timeframe: Timeframe,
    ) -> Result<PatternSignal, ProviderError>;
}

/// Technical-indicator confirmation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TechnicalConfirmer: Send + Sync {
    async fn confirm(
        &self,
        id: InstrumentId,
        timeframe: Timeframe,
    ) -> Result<TechnicalSignal, ProviderError>;
}
