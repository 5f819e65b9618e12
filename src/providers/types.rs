//! Instrument and signal types exchanged with the external providers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, ordered instrument identifier. Lower ids win deterministic tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId(pub u64);

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tradable security. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub symbol: String,
    pub sector: Option<String>,
    pub is_tradable: bool,
}

impl Instrument {
    pub fn new(id: u64, symbol: impl Into<String>) -> Self {
        Self {
            id: InstrumentId(id),
            symbol: symbol.into(),
            sector: None,
            is_tradable: true,
        }
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }
}

/// Reference data returned by the instrument repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub id: InstrumentId,
    pub symbol: String,
    pub sector: Option<String>,
    pub is_tradable: bool,
    pub exchange: Option<String>,
}

/// One row of the upstream liquidity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub instrument: Instrument,
    pub last_price: Decimal,
    /// Session share volume.
    pub volume: Decimal,
    pub as_of: DateTime<Utc>,
}

impl LiquiditySnapshot {
    pub fn dollar_volume(&self) -> Decimal {
        self.last_price * self.volume
    }
}

/// News-catalyst strength for an instrument over a lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalystSignal {
    /// 0..1
    pub strength: Decimal,
    pub category: String,
    pub as_of: DateTime<Utc>,
}

/// Chart-pattern detection result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignal {
    pub pattern_type: String,
    /// 0..1
    pub confidence: Decimal,
    pub breakout_level: Option<Decimal>,
}

/// Technical-indicator confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSignal {
    /// 0..1
    pub strength: Decimal,
    pub confirming_indicators: u32,
}

/// Chart timeframe requested from pattern and technical providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    Minutes5,
    #[default]
    #[serde(rename = "15m")]
    Minutes15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::Minutes5 => "5m",
            Timeframe::Minutes15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Day1 => "1d",
        };
        f.write_str(s)
    }
}

/// Scores are only meaningful inside the unit interval.
pub fn is_unit_score(value: Decimal) -> bool {
    value >= Decimal::ZERO && value <= Decimal::ONE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dollar_volume() {
        let snapshot = LiquiditySnapshot {
            instrument: Instrument::new(7, "ACME"),
            last_price: dec!(42.50),
            volume: dec!(1000000),
            as_of: Utc::now(),
        };
        assert_eq!(snapshot.dollar_volume(), dec!(42500000));
    }

    #[test]
    fn test_instrument_id_ordering() {
        let mut ids = vec![InstrumentId(9), InstrumentId(2), InstrumentId(5)];
        ids.sort();
        assert_eq!(ids, vec![InstrumentId(2), InstrumentId(5), InstrumentId(9)]);
    }

    #[test]
    fn test_unit_score_bounds() {
        assert!(is_unit_score(dec!(0)));
        assert!(is_unit_score(dec!(1)));
        assert!(!is_unit_score(dec!(1.01)));
        assert!(!is_unit_score(dec!(-0.1)));
    }

    #[test]
    fn test_timeframe_serde() {
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::Hour1);
        assert_eq!(Timeframe::default().to_string(), "15m");
    }
}
