//! Trade proposal construction and position sizing.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::candidate::Candidate;
use crate::config::RiskConfig;
use crate::cycle::CycleId;
use crate::execution::PositionSide;
use crate::providers::Instrument;
use crate::utils::decimal::{round_down_to_lot, round_to_tick, safe_div};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProposalError {
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("entry price must be positive, got {0}")]
    NonPositiveEntry(Decimal),

    #[error("take-profit {take_profit} is not on the profit side of entry {entry}")]
    TargetOnWrongSide {
        entry: Decimal,
        take_profit: Decimal,
    },
}

/// A sized trade awaiting risk validation.
///
/// Only built through `TradeProposal::new`. The stop-loss is carried as
/// given; whether it is acceptable is the risk validator's call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    cycle_id: CycleId,
    instrument: Instrument,
    side: PositionSide,
    quantity: Decimal,
    entry_price: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
    composite_score: Decimal,
}

impl TradeProposal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle_id: CycleId,
        instrument: Instrument,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        composite_score: Decimal,
    ) -> Result<Self, ProposalError> {
        if quantity <= Decimal::ZERO {
            return Err(ProposalError::NonPositiveQuantity(quantity));
        }
        if entry_price <= Decimal::ZERO {
            return Err(ProposalError::NonPositiveEntry(entry_price));
        }
        let target_ok = match side {
            PositionSide::Long => take_profit > entry_price,
            PositionSide::Short => take_profit < entry_price && take_profit > Decimal::ZERO,
        };
        if !target_ok {
            return Err(ProposalError::TargetOnWrongSide {
                entry: entry_price,
                take_profit,
            });
        }

        Ok(Self {
            cycle_id,
            instrument,
            side,
            quantity,
            entry_price,
            stop_loss,
            take_profit,
            composite_score,
        })
    }

    pub fn cycle_id(&self) -> CycleId {
        self.cycle_id
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn side(&self) -> PositionSide {
        self.side
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn stop_loss(&self) -> Decimal {
        self.stop_loss
    }

    pub fn take_profit(&self) -> Decimal {
        self.take_profit
    }

    pub fn composite_score(&self) -> Decimal {
        self.composite_score
    }

    /// Loss per unit if the stop is hit.
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Total loss if the stop is hit.
    pub fn risk(&self) -> Decimal {
        self.risk_per_unit() * self.quantity
    }

    /// Same proposal with a smaller quantity. Used when resizing to a limit.
    pub fn resized(&self, quantity: Decimal) -> Result<Self, ProposalError> {
        Self::new(
            self.cycle_id,
            self.instrument.clone(),
            self.side,
            quantity,
            self.entry_price,
            self.stop_loss,
            self.take_profit,
            self.composite_score,
        )
    }
}

/// Turns ranked candidates into long proposals sized by risk.
pub struct ProposalBuilder {
    config: RiskConfig,
}

impl ProposalBuilder {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Entry at the last price, stop `stop_loss_pct` below, target at
    /// `reward_risk_ratio` times the stop distance above.
    ///
    /// Quantity is the smaller of the risk budget divided by the per-share
    /// risk and the `max_position_pct` notional cap, rounded down to a lot.
    pub fn build(
        &self,
        candidate: &Candidate,
        equity: Decimal,
        risk_per_trade: Decimal,
    ) -> Result<TradeProposal, ProposalError> {
        let entry = candidate.last_price;
        if entry <= Decimal::ZERO {
            return Err(ProposalError::NonPositiveEntry(entry));
        }

        let stop = round_to_tick(
            entry * (Decimal::ONE - self.config.stop_loss_pct),
            self.config.tick_size,
        );
        let per_unit = entry - stop;
        let target = round_to_tick(
            entry + per_unit * self.config.reward_risk_ratio,
            self.config.tick_size,
        );

        let risk_budget = equity * risk_per_trade;
        let by_risk = round_down_to_lot(safe_div(risk_budget, per_unit), self.config.lot_size);
        let by_notional = round_down_to_lot(
            safe_div(equity * self.config.max_position_pct, entry),
            self.config.lot_size,
        );
        let quantity = by_risk.min(by_notional);

        debug!(
            symbol = %candidate.symbol(),
            %entry,
            %stop,
            %target,
            %by_risk,
            %by_notional,
            %quantity,
            "Sized proposal"
        );

        TradeProposal::new(
            candidate.cycle_id,
            candidate.instrument.clone(),
            PositionSide::Long,
            quantity,
            entry,
            stop,
            target,
            candidate.composite_score.unwrap_or(Decimal::ZERO),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(price: Decimal) -> Candidate {
        let mut c = Candidate::new(
            CycleId::new(),
            Instrument::new(1, "ACME"),
            price,
            dec!(10000000),
        );
        c.composite_score = Some(dec!(0.8));
        c
    }

    #[test]
    fn test_constructor_rejects_invalid_fields() {
        let instrument = Instrument::new(1, "ACME");
        let id = CycleId::new();

        let err = TradeProposal::new(
            id,
            instrument.clone(),
            PositionSide::Long,
            Decimal::ZERO,
            dec!(100),
            dec!(98),
            dec!(104),
            dec!(0.8),
        )
        .unwrap_err();
        assert!(matches!(err, ProposalError::NonPositiveQuantity(_)));

        let err = TradeProposal::new(
            id,
            instrument,
            PositionSide::Long,
            dec!(10),
            dec!(100),
            dec!(98),
            dec!(99),
            dec!(0.8),
        )
        .unwrap_err();
        assert!(matches!(err, ProposalError::TargetOnWrongSide { .. }));
    }

    #[test]
    fn test_constructor_accepts_zero_stop() {
        // the risk validator owns the stop-loss decision
        let proposal = TradeProposal::new(
            CycleId::new(),
            Instrument::new(1, "ACME"),
            PositionSide::Long,
            dec!(10),
            dec!(100),
            Decimal::ZERO,
            dec!(104),
            dec!(0.8),
        )
        .unwrap();
        assert_eq!(proposal.stop_loss(), Decimal::ZERO);
        assert_eq!(proposal.risk(), dec!(1000));
    }

    #[test]
    fn test_build_sizes_by_risk() {
        let builder = ProposalBuilder::new(RiskConfig {
            max_position_pct: Decimal::ONE,
            ..RiskConfig::default()
        });

        // equity 50k, 2% risk = 1000; stop 2% below 100 = 98, 2/share -> 500 shares
        let proposal = builder.build(&candidate(dec!(100)), dec!(50000), dec!(0.02)).unwrap();
        assert_eq!(proposal.stop_loss(), dec!(98.00));
        assert_eq!(proposal.take_profit(), dec!(104.00));
        assert_eq!(proposal.quantity(), dec!(500));
        assert_eq!(proposal.risk(), dec!(1000));
    }

    #[test]
    fn test_build_caps_notional() {
        let builder = ProposalBuilder::new(RiskConfig::default());

        // 25% of 50k = 12.5k notional -> 125 shares at 100
        let proposal = builder.build(&candidate(dec!(100)), dec!(50000), dec!(0.02)).unwrap();
        assert_eq!(proposal.quantity(), dec!(125));
    }

    #[test]
    fn test_build_fails_when_no_lot_fits() {
        let builder = ProposalBuilder::new(RiskConfig::default());
        let err = builder.build(&candidate(dec!(400)), dec!(1000), dec!(0.01)).unwrap_err();
        assert!(matches!(err, ProposalError::NonPositiveQuantity(_)));
    }
}
