//! In-memory provider set backed by maps, with per-instrument fault injection.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::*;
use super::{CatalystScorer, InstrumentRepository, MarketDataFeed, PatternDetector, TechnicalConfirmer};
use crate::error::ProviderError;

/// Which provider a fault or call counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Catalyst,
    Pattern,
    Technical,
}

impl SignalKind {
    pub fn provider_name(&self) -> &'static str {
        match self {
            SignalKind::Catalyst => "catalyst_scorer",
            SignalKind::Pattern => "pattern_detector",
            SignalKind::Technical => "technical_confirmer",
        }
    }
}

/// Injected misbehaviour for a single provider call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with `ProviderError::Failed`.
    Error(String),
    /// Sleep before answering normally.
    Delay(Duration),
    /// Panic inside the call.
    Panic,
}

#[derive(Debug, Default)]
struct MarketBook {
    snapshots: BTreeMap<InstrumentId, LiquiditySnapshot>,
    catalysts: HashMap<InstrumentId, CatalystSignal>,
    patterns: HashMap<InstrumentId, PatternSignal>,
    technicals: HashMap<InstrumentId, TechnicalSignal>,
    faults: HashMap<(SignalKind, InstrumentId), Fault>,
    feed_fault: Option<Fault>,
    calls: HashMap<SignalKind, u64>,
}

/// Implements every provider trait from in-memory maps.
///
/// A missing signal answers `ProviderError::NotFound`, which the pipeline
/// counts as a provider error.
#[derive(Debug, Default)]
pub struct InMemoryProviders {
    book: RwLock<MarketBook>,
}

impl InMemoryProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_instrument(&self, snapshot: LiquiditySnapshot) {
        let mut book = self.book.write().await;
        book.snapshots.insert(snapshot.instrument.id, snapshot);
    }

    /// Add a tradable listing with the given price and share volume.
    pub async fn add_listing(&self, id: u64, symbol: &str, last_price: Decimal, volume: Decimal) {
        self.add_instrument(LiquiditySnapshot {
            instrument: Instrument::new(id, symbol),
            last_price,
            volume,
            as_of: Utc::now(),
        })
        .await;
    }

    pub async fn set_price(&self, id: InstrumentId, price: Decimal) {
        let mut book = self.book.write().await;
        if let Some(snapshot) = book.snapshots.get_mut(&id) {
            snapshot.last_price = price;
            snapshot.as_of = Utc::now();
        }
    }

    pub async fn set_catalyst(&self, id: InstrumentId, strength: Decimal, category: &str) {
        let mut book = self.book.write().await;
        book.catalysts.insert(
            id,
            CatalystSignal {
                strength,
                category: category.to_string(),
                as_of: Utc::now(),
            },
        );
    }

    pub async fn set_pattern(
        &self,
        id: InstrumentId,
        pattern_type: &str,
        confidence: Decimal,
        breakout_level: Option<Decimal>,
    ) {
        let mut book = self.book.write().await;
        book.patterns.insert(
            id,
            PatternSignal {
                pattern_type: pattern_type.to_string(),
                confidence,
                breakout_level,
            },
        );
    }

    pub async fn set_technical(&self, id: InstrumentId, strength: Decimal, confirming: u32) {
        let mut book = self.book.write().await;
        book.technicals.insert(
            id,
            TechnicalSignal {
                strength,
                confirming_indicators: confirming,
            },
        );
    }

    pub async fn inject(&self, kind: SignalKind, id: InstrumentId, fault: Fault) {
        let mut book = self.book.write().await;
        book.faults.insert((kind, id), fault);
    }

    pub async fn clear_faults(&self) {
        let mut book = self.book.write().await;
        book.faults.clear();
        book.feed_fault = None;
    }

    /// Make the liquidity feed misbehave (or recover with `None`).
    pub async fn set_feed_fault(&self, fault: Option<Fault>) {
        self.book.write().await.feed_fault = fault;
    }

    /// Number of calls a provider has received so far.
    pub async fn call_count(&self, kind: SignalKind) -> u64 {
        self.book.read().await.calls.get(&kind).copied().unwrap_or(0)
    }

    /// Last prices keyed by symbol, for seeding a paper broker.
    pub async fn prices(&self) -> HashMap<String, Decimal> {
        self.book
            .read()
            .await
            .snapshots
            .values()
            .map(|s| (s.instrument.symbol.clone(), s.last_price))
            .collect()
    }

    async fn apply_fault(&self, kind: SignalKind, id: InstrumentId) -> Result<(), ProviderError> {
        let fault = {
            let mut book = self.book.write().await;
            *book.calls.entry(kind).or_default() += 1;
            book.faults.get(&(kind, id)).cloned()
        };

        match fault {
            None => Ok(()),
            Some(Fault::Error(reason)) => Err(ProviderError::Failed {
                provider: kind.provider_name(),
                reason,
            }),
            Some(Fault::Delay(delay)) => {
                debug!(%id, provider = kind.provider_name(), ?delay, "Delaying provider call");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::Panic) => panic!("injected {} panic for {}", kind.provider_name(), id),
        }
    }

    fn not_found(kind: SignalKind, id: InstrumentId) -> ProviderError {
        ProviderError::NotFound {
            provider: kind.provider_name(),
            instrument: id.to_string(),
        }
    }
}

#[async_trait]
impl MarketDataFeed for InMemoryProviders {
    async fn liquidity_snapshot(&self) -> Result<Vec<LiquiditySnapshot>, ProviderError> {
        let fault = self.book.read().await.feed_fault.clone();
        match fault {
            Some(Fault::Error(reason)) => {
                return Err(ProviderError::Failed {
                    provider: "market_data_feed",
                    reason,
                })
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::Panic) => panic!("injected market_data_feed panic"),
            None => {}
        }

        Ok(self.book.read().await.snapshots.values().cloned().collect())
    }
}

#[async_trait]
impl InstrumentRepository for InMemoryProviders {
    async fn resolve(&self, symbol: &str) -> Result<Instrument, ProviderError> {
        let book = self.book.read().await;
        book.snapshots
            .values()
            .find(|s| s.instrument.symbol.eq_ignore_ascii_case(symbol))
            .map(|s| s.instrument.clone())
            .ok_or_else(|| ProviderError::NotFound {
                provider: "instrument_repository",
                instrument: symbol.to_string(),
            })
    }

    async fn metadata(&self, id: InstrumentId) -> Result<InstrumentMetadata, ProviderError> {
        let book = self.book.read().await;
        let snapshot = book.snapshots.get(&id).ok_or_else(|| ProviderError::NotFound {
            provider: "instrument_repository",
            instrument: id.to_string(),
        })?;

        Ok(InstrumentMetadata {
            id,
            symbol: snapshot.instrument.symbol.clone(),
            sector: snapshot.instrument.sector.clone(),
            is_tradable: snapshot.instrument.is_tradable,
            exchange: None,
        })
    }
}

#[async_trait]
impl CatalystScorer for InMemoryProviders {
    async fn score(
        &self,
        id: InstrumentId,
        _window_hours: u32,
    ) -> Result<CatalystSignal, ProviderError> {
        self.apply_fault(SignalKind::Catalyst, id).await?;
        self.book
            .read()
            .await
            .catalysts
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(SignalKind::Catalyst, id))
    }
}

#[async_trait]
impl PatternDetector for InMemoryProviders {
    async fn detect(
        &self,
        id: InstrumentId,
        _timeframe: Timeframe,
    ) -> Result<PatternSignal, ProviderError> {
        self.apply_fault(SignalKind::Pattern, id).await?;
        self.book
            .read()
            .await
            .patterns
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(SignalKind::Pattern, id))
    }
}

#[async_trait]
impl TechnicalConfirmer for InMemoryProviders {
    async fn confirm(
        &self,
        id: InstrumentId,
        _timeframe: Timeframe,
    ) -> Result<TechnicalSignal, ProviderError> {
        self.apply_fault(SignalKind::Technical, id).await?;
        self.book
            .read()
            .await
            .technicals
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(SignalKind::Technical, id))
    }
}
