//! Deterministic synthetic market for paper runs.

use rust_decimal::Decimal;
use tracing::info;

use super::memory::InMemoryProviders;
use super::types::InstrumentId;

const SECTORS: [&str; 6] = [
    "technology",
    "healthcare",
    "energy",
    "financials",
    "consumer",
    "industrials",
];

const CATALYSTS: [&str; 5] = ["earnings", "fda", "merger", "guidance", "analyst"];

const PATTERNS: [&str; 4] = ["bull_flag", "ascending_triangle", "cup_handle", "breakout"];

/// Seeded generator filling an `InMemoryProviders` with listings and signals.
///
/// The same seed always produces the same market.
pub struct SyntheticMarket {
    state: u64,
}

impl SyntheticMarket {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves zero
        Self {
            state: seed.max(1),
        }
    }

    /// Build a provider set with `count` listings and a signal for every one.
    pub async fn seeded(count: usize, seed: u64) -> InMemoryProviders {
        let providers = InMemoryProviders::new();
        let mut market = Self::new(seed);
        market.populate_listings(&providers, count).await;
        market.refresh_signals(&providers, count).await;
        providers
    }

    pub async fn populate_listings(&mut self, providers: &InMemoryProviders, count: usize) {
        for i in 0..count {
            let id = (i + 1) as u64;
            // Prices 2.00 to 302.00, volumes 50k to 5M shares
            let price = Decimal::new(200 + self.below(30_000) as i64, 2);
            let volume = Decimal::from(50_000 + self.below(4_950_000));
            providers
                .add_listing(id, &format!("SYN{id:03}"), price, volume)
                .await;
        }
        info!(count, "Synthetic listings generated");
    }

    /// Draw a fresh set of signals for every listing.
    pub async fn refresh_signals(&mut self, providers: &InMemoryProviders, count: usize) {
        for i in 0..count {
            let id = InstrumentId((i + 1) as u64);

            let category = CATALYSTS[self.below(CATALYSTS.len() as u64) as usize];
            let strength = self.unit_score();
            providers.set_catalyst(id, strength, category).await;

            let pattern = PATTERNS[self.below(PATTERNS.len() as u64) as usize];
            let confidence = self.unit_score();
            providers.set_pattern(id, pattern, confidence, None).await;

            let technical = self.unit_score();
            let confirming = self.below(6) as u32;
            providers.set_technical(id, technical, confirming).await;
        }
    }

    pub fn sector_for(id: InstrumentId) -> &'static str {
        SECTORS[(id.0 as usize) % SECTORS.len()]
    }

    /// Score in [0, 1] with two decimal places.
    fn unit_score(&mut self) -> Decimal {
        Decimal::new(self.below(101) as i64, 2)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CatalystScorer, MarketDataFeed};

    #[tokio::test]
    async fn test_same_seed_same_market() {
        let a = SyntheticMarket::seeded(20, 42).await;
        let b = SyntheticMarket::seeded(20, 42).await;

        let snaps_a = a.liquidity_snapshot().await.unwrap();
        let snaps_b = b.liquidity_snapshot().await.unwrap();
        assert_eq!(snaps_a.len(), 20);
        for (x, y) in snaps_a.iter().zip(snaps_b.iter()) {
            assert_eq!(x.instrument.symbol, y.instrument.symbol);
            assert_eq!(x.last_price, y.last_price);
            assert_eq!(x.volume, y.volume);
        }

        let sa = a.score(InstrumentId(5), 24).await.unwrap();
        let sb = b.score(InstrumentId(5), 24).await.unwrap();
        assert_eq!(sa.strength, sb.strength);
        assert!(sa.strength >= Decimal::ZERO && sa.strength <= Decimal::ONE);
    }

    #[test]
    fn test_zero_seed_does_not_stall() {
        let mut market = SyntheticMarket::new(0);
        let first = market.next_u64();
        let second = market.next_u64();
        assert_ne!(first, second);
    }
}
