//! Composite scoring and final selection.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::candidate::{Candidate, Stage};
use crate::config::CompositeWeights;
use crate::utils::decimal::weighted_average;

/// Ordering among candidates with equal composite scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Higher catalyst strength first, then lower instrument id
    #[default]
    CatalystThenInstrumentId,
    /// Lower instrument id first
    InstrumentId,
}

/// Weighted average of the three stage scores.
pub fn composite_score(candidate: &Candidate, weights: &CompositeWeights) -> Decimal {
    weighted_average(&[
        (candidate.catalyst_score(), weights.catalyst),
        (candidate.pattern_score(), weights.pattern),
        (candidate.technical_score(), weights.technical),
    ])
}

fn compare(a: &Candidate, b: &Candidate, tie_break: TieBreak) -> Ordering {
    let by_score = b.composite_score.cmp(&a.composite_score);
    match tie_break {
        TieBreak::CatalystThenInstrumentId => by_score
            .then_with(|| b.catalyst_score().cmp(&a.catalyst_score()))
            .then_with(|| a.id().cmp(&b.id())),
        TieBreak::InstrumentId => by_score.then_with(|| a.id().cmp(&b.id())),
    }
}

/// Score, order, de-duplicate and truncate the technical-stage survivors.
///
/// Only candidates that reached `Stage::Technical` are eligible. The result
/// carries 1-based ranks and `Stage::Selected`.
pub fn rank_candidates(
    candidates: Vec<Candidate>,
    weights: &CompositeWeights,
    tie_break: TieBreak,
    final_size: usize,
) -> Vec<Candidate> {
    let mut scored: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| {
            let eligible = c.stage_reached == Stage::Technical;
            if !eligible {
                warn!(symbol = %c.symbol(), reached = %c.stage_reached, "Skipping candidate that did not pass every stage");
            }
            eligible
        })
        .map(|mut c| {
            c.composite_score = Some(composite_score(&c, weights));
            c
        })
        .collect();

    scored.sort_by(|a, b| compare(a, b, tie_break));

    let mut seen = HashSet::new();
    scored.retain(|c| seen.insert(c.id()));
    scored.truncate(final_size);

    for (i, candidate) in scored.iter_mut().enumerate() {
        candidate.rank = Some(i as u32 + 1);
        candidate.stage_reached = Stage::Selected;
        debug!(
            rank = i + 1,
            symbol = %candidate.symbol(),
            composite = ?candidate.composite_score,
            "Candidate selected"
        );
    }

    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleId;
    use crate::providers::{CatalystSignal, Instrument, PatternSignal, TechnicalSignal};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn scored(id: u64, catalyst: Decimal, pattern: Decimal, technical: Decimal) -> Candidate {
        let mut c = Candidate::new(
            CycleId::new(),
            Instrument::new(id, format!("T{id}")),
            dec!(30),
            dec!(10000000),
        );
        c.catalyst = Some(CatalystSignal {
            strength: catalyst,
            category: "earnings".into(),
            as_of: Utc::now(),
        });
        c.pattern = Some(PatternSignal {
            pattern_type: "bull_flag".into(),
            confidence: pattern,
            breakout_level: None,
        });
        c.technical = Some(TechnicalSignal {
            strength: technical,
            confirming_indicators: 4,
        });
        c.stage_reached = Stage::Technical;
        c
    }

    #[test]
    fn test_composite_score_weights() {
        let c = scored(1, dec!(0.8), dec!(0.7), dec!(0.9));
        assert_eq!(composite_score(&c, &CompositeWeights::default()), dec!(0.80));
    }

    #[test]
    fn test_rank_descending_and_truncated() {
        let candidates = vec![
            scored(1, dec!(0.4), dec!(0.6), dec!(0.7)),
            scored(2, dec!(0.9), dec!(0.9), dec!(0.9)),
            scored(3, dec!(0.7), dec!(0.7), dec!(0.7)),
        ];

        let ranked = rank_candidates(
            candidates,
            &CompositeWeights::default(),
            TieBreak::default(),
            2,
        );

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id().0, 2);
        assert_eq!(ranked[0].rank, Some(1));
        assert_eq!(ranked[1].id().0, 3);
        assert!(ranked.iter().all(|c| c.stage_reached == Stage::Selected));
    }

    #[test]
    fn test_tie_break_prefers_catalyst_then_lower_id() {
        // Equal composite 0.7 for all three
        let candidates = vec![
            scored(5, dec!(0.7), dec!(0.7), dec!(0.7)),
            scored(3, dec!(0.7), dec!(0.7), dec!(0.7)),
            scored(9, dec!(0.85), dec!(0.6), dec!(0.6)),
        ];

        let ranked = rank_candidates(
            candidates.clone(),
            &CompositeWeights::default(),
            TieBreak::CatalystThenInstrumentId,
            5,
        );
        let ids: Vec<u64> = ranked.iter().map(|c| c.id().0).collect();
        assert_eq!(ids, vec![9, 3, 5]);

        let ranked = rank_candidates(
            candidates,
            &CompositeWeights::default(),
            TieBreak::InstrumentId,
            5,
        );
        let ids: Vec<u64> = ranked.iter().map(|c| c.id().0).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_duplicates_and_unqualified_removed() {
        let mut skipped = scored(4, dec!(1), dec!(1), dec!(1));
        skipped.stage_reached = Stage::Pattern;

        let candidates = vec![
            scored(1, dec!(0.8), dec!(0.8), dec!(0.8)),
            scored(1, dec!(0.8), dec!(0.8), dec!(0.8)),
            skipped,
        ];

        let ranked = rank_candidates(
            candidates,
            &CompositeWeights::default(),
            TieBreak::default(),
            5,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id().0, 1);
    }
}
