//! Liquidity universe selection.

use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{info, instrument, trace, warn};

use crate::config::UniverseConfig;
use crate::error::CycleError;
use crate::providers::{Instrument, LiquiditySnapshot, MarketDataFeed};

/// Reasons for dropping an instrument from the universe.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    NotTradable,
    LowVolume,
    PriceBelowBand,
    PriceAboveBand,
}

/// Inclusive last-price band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl PriceRange {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.min && price <= self.max
    }
}

/// An instrument admitted to the cycle universe.
#[derive(Debug, Clone, PartialEq)]
pub struct UniverseMember {
    pub instrument: Instrument,
    pub last_price: Decimal,
    pub dollar_volume: Decimal,
}

/// Picks the most liquid tradable instruments from the liquidity feed.
pub struct UniverseSelector {
    config: UniverseConfig,
}

impl UniverseSelector {
    pub fn new(config: UniverseConfig) -> Self {
        Self { config }
    }

    pub fn price_range(&self) -> PriceRange {
        PriceRange::new(self.config.min_price, self.config.max_price)
    }

    /// Select with the configured volume floor and price band.
    pub async fn select(
        &self,
        feed: &dyn MarketDataFeed,
    ) -> Result<Vec<UniverseMember>, CycleError> {
        self.select_universe(feed, self.config.min_dollar_volume, self.price_range())
            .await
    }

    /// Fetch the liquidity snapshot and rank it.
    ///
    /// A failing or empty feed is `DataUnavailable`. Rows that all fail the
    /// filters produce an empty universe, which is not an error.
    #[instrument(skip(self, feed), fields(min_volume = %min_volume))]
    pub async fn select_universe(
        &self,
        feed: &dyn MarketDataFeed,
        min_volume: Decimal,
        price_range: PriceRange,
    ) -> Result<Vec<UniverseMember>, CycleError> {
        let timeout = Duration::from_secs(self.config.feed_timeout_secs);
        let snapshots = match tokio::time::timeout(timeout, feed.liquidity_snapshot()).await {
            Ok(Ok(snapshots)) => snapshots,
            Ok(Err(e)) => {
                warn!(error = %e, "Liquidity feed failed");
                return Err(CycleError::DataUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(timeout_secs = self.config.feed_timeout_secs, "Liquidity feed timed out");
                return Err(CycleError::DataUnavailable(format!(
                    "liquidity feed timed out after {}s",
                    self.config.feed_timeout_secs
                )));
            }
        };

        if snapshots.is_empty() {
            return Err(CycleError::DataUnavailable(
                "liquidity feed returned no instruments".to_string(),
            ));
        }

        Ok(self.rank(snapshots, min_volume, price_range))
    }

    /// Filter, sort by dollar volume (ties by lower id) and truncate.
    pub fn rank(
        &self,
        snapshots: Vec<LiquiditySnapshot>,
        min_volume: Decimal,
        price_range: PriceRange,
    ) -> Vec<UniverseMember> {
        let total_scanned = snapshots.len();

        // Track rejection reasons for summary logging
        let mut rejected_not_tradable = 0usize;
        let mut rejected_low_volume = 0usize;
        let mut rejected_price_below = 0usize;
        let mut rejected_price_above = 0usize;

        let mut members: Vec<UniverseMember> = snapshots
            .into_iter()
            .filter_map(|snapshot| {
                match Self::qualify(&snapshot, min_volume, price_range) {
                    Ok(()) => Some(UniverseMember {
                        dollar_volume: snapshot.dollar_volume(),
                        last_price: snapshot.last_price,
                        instrument: snapshot.instrument,
                    }),
                    Err(reason) => {
                        trace!(symbol = %snapshot.instrument.symbol, ?reason, "Rejected from universe");
                        match reason {
                            RejectReason::NotTradable => rejected_not_tradable += 1,
                            RejectReason::LowVolume => rejected_low_volume += 1,
                            RejectReason::PriceBelowBand => rejected_price_below += 1,
                            RejectReason::PriceAboveBand => rejected_price_above += 1,
                        }
                        None
                    }
                }
            })
            .collect();

        members.sort_by(|a, b| {
            b.dollar_volume
                .cmp(&a.dollar_volume)
                .then_with(|| a.instrument.id.cmp(&b.instrument.id))
        });
        members.truncate(self.config.universe_size);

        info!(
            total_scanned,
            selected = members.len(),
            rejected_not_tradable,
            rejected_low_volume,
            rejected_price_below,
            rejected_price_above,
            "Universe selection complete"
        );

        members
    }

    fn qualify(
        snapshot: &LiquiditySnapshot,
        min_volume: Decimal,
        price_range: PriceRange,
    ) -> Result<(), RejectReason> {
        if !snapshot.instrument.is_tradable {
            return Err(RejectReason::NotTradable);
        }
        if snapshot.last_price < price_range.min {
            return Err(RejectReason::PriceBelowBand);
        }
        if snapshot.last_price > price_range.max {
            return Err(RejectReason::PriceAboveBand);
        }
        if snapshot.dollar_volume() < min_volume {
            return Err(RejectReason::LowVolume);
        }
        Ok(())
    }
}
