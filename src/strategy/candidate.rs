//! Candidates flowing through the narrowing stages.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cycle::CycleId;
use crate::providers::{CatalystSignal, Instrument, InstrumentId, PatternSignal, TechnicalSignal};

/// Furthest stage a candidate has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Universe,
    Catalyst,
    Pattern,
    Technical,
    Selected,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Universe => "Universe",
            Stage::Catalyst => "Catalyst",
            Stage::Pattern => "Pattern",
            Stage::Technical => "Technical",
            Stage::Selected => "Selected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three provider-backed filter stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterStage {
    Catalyst,
    Pattern,
    Technical,
}

impl FilterStage {
    pub const ALL: [FilterStage; 3] = [
        FilterStage::Catalyst,
        FilterStage::Pattern,
        FilterStage::Technical,
    ];

    /// Stage reached by candidates that pass this filter.
    pub fn stage(&self) -> Stage {
        match self {
            FilterStage::Catalyst => Stage::Catalyst,
            FilterStage::Pattern => Stage::Pattern,
            FilterStage::Technical => Stage::Technical,
        }
    }

    /// Stage a candidate must have reached to be evaluated here.
    pub fn prerequisite(&self) -> Stage {
        match self {
            FilterStage::Catalyst => Stage::Universe,
            FilterStage::Pattern => Stage::Catalyst,
            FilterStage::Technical => Stage::Pattern,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            FilterStage::Catalyst => "catalyst_scorer",
            FilterStage::Pattern => "pattern_detector",
            FilterStage::Technical => "technical_confirmer",
        }
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.stage().fmt(f)
    }
}

/// An instrument under consideration in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub cycle_id: CycleId,
    pub instrument: Instrument,
    pub last_price: Decimal,
    pub dollar_volume: Decimal,
    pub catalyst: Option<CatalystSignal>,
    pub pattern: Option<PatternSignal>,
    pub technical: Option<TechnicalSignal>,
    pub composite_score: Option<Decimal>,
    /// 1-based rank after final selection
    pub rank: Option<u32>,
    pub stage_reached: Stage,
}

impl Candidate {
    pub fn new(
        cycle_id: CycleId,
        instrument: Instrument,
        last_price: Decimal,
        dollar_volume: Decimal,
    ) -> Self {
        Self {
            cycle_id,
            instrument,
            last_price,
            dollar_volume,
            catalyst: None,
            pattern: None,
            technical: None,
            composite_score: None,
            rank: None,
            stage_reached: Stage::Universe,
        }
    }

    pub fn id(&self) -> InstrumentId {
        self.instrument.id
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    pub fn catalyst_score(&self) -> Decimal {
        self.catalyst
            .as_ref()
            .map(|c| c.strength)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn pattern_score(&self) -> Decimal {
        self.pattern
            .as_ref()
            .map(|p| p.confidence)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn technical_score(&self) -> Decimal {
        self.technical
            .as_ref()
            .map(|t| t.strength)
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_prerequisites() {
        assert!(Stage::Universe < Stage::Catalyst);
        assert!(Stage::Technical < Stage::Selected);

        let mut expected = Stage::Universe;
        for stage in FilterStage::ALL {
            assert_eq!(stage.prerequisite(), expected);
            expected = stage.stage();
        }
        assert_eq!(expected, Stage::Technical);
    }

    #[test]
    fn test_missing_signals_score_zero() {
        let candidate = Candidate::new(
            CycleId::new(),
            Instrument::new(1, "ACME"),
            Decimal::TEN,
            Decimal::ONE_HUNDRED,
        );
        assert_eq!(candidate.catalyst_score(), Decimal::ZERO);
        assert_eq!(candidate.stage_reached, Stage::Universe);
        assert_eq!(FilterStage::Pattern.to_string(), "Pattern");
    }
}
