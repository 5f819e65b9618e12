//! Daily loss tracking against start-of-day equity.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::utils::decimal::safe_div;

/// Tracks the loss since the start of the trading day (UTC).
///
/// The limit is supplied on every update so a cycle's own `max_daily_loss`
/// applies while it runs.
pub struct DailyLossTracker {
    /// Limit applied on the last update (e.g., 0.06 for 6%)
    limit: Decimal,
    trading_day: NaiveDate,
    start_equity: Decimal,
    current_equity: Decimal,
    /// Current loss from start of day (0.0-1.0, zero when up)
    current_loss: Decimal,
    /// Worst loss observed today
    worst_loss: Decimal,
}

impl DailyLossTracker {
    pub fn new(limit: Decimal, start_equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            trading_day: now.date_naive(),
            start_equity,
            current_equity: start_equity,
            current_loss: Decimal::ZERO,
            worst_loss: Decimal::ZERO,
        }
    }

    /// Update with a new equity value, checked against `limit`.
    ///
    /// Rolls the start-of-day equity over on a new UTC date. Returns true if
    /// the loss has reached the limit.
    pub fn update(&mut self, equity: Decimal, limit: Decimal, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today != self.trading_day {
            info!(
                previous_day = %self.trading_day,
                worst_loss = %self.worst_loss,
                start_equity = %equity,
                "New trading day, daily loss reset"
            );
            self.trading_day = today;
            self.start_equity = equity;
            self.current_loss = Decimal::ZERO;
            self.worst_loss = Decimal::ZERO;
        }

        self.limit = limit;
        self.current_equity = equity;
        self.current_loss = safe_div(self.start_equity - equity, self.start_equity).max(Decimal::ZERO);
        if self.current_loss > self.worst_loss {
            self.worst_loss = self.current_loss;
            warn!(
                loss = %self.current_loss,
                start = %self.start_equity,
                current = %equity,
                "New worst daily loss recorded"
            );
        }

        self.is_breached()
    }

    pub fn is_breached(&self) -> bool {
        self.current_loss >= self.limit
    }

    pub fn current_loss(&self) -> Decimal {
        self.current_loss
    }

    pub fn limit(&self) -> Decimal {
        self.limit
    }

    pub fn start_equity(&self) -> Decimal {
        self.start_equity
    }

    /// Loss amount still available today before the limit.
    pub fn remaining_budget(&self) -> Decimal {
        let limit = self.start_equity * self.limit;
        let lost = self.start_equity * self.current_loss;
        (limit - lost).max(Decimal::ZERO)
    }

    pub fn statistics(&self) -> DailyLossStats {
        DailyLossStats {
            trading_day: self.trading_day,
            start_equity: self.start_equity,
            current_equity: self.current_equity,
            current_loss: self.current_loss,
            worst_loss: self.worst_loss,
            limit: self.limit,
            remaining_budget: self.remaining_budget(),
        }
    }
}

/// Statistics from the daily loss tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyLossStats {
    pub trading_day: NaiveDate,
    pub start_equity: Decimal,
    pub current_equity: Decimal,
    pub current_loss: Decimal,
    pub worst_loss: Decimal,
    pub limit: Decimal,
    pub remaining_budget: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_loss_tracking() {
        let now = morning();
        let mut tracker = DailyLossTracker::new(dec!(0.06), dec!(100000), now);

        assert!(!tracker.update(dec!(101000), dec!(0.06), now));
        assert_eq!(tracker.current_loss(), Decimal::ZERO);

        assert!(!tracker.update(dec!(96000), dec!(0.06), now));
        assert_eq!(tracker.current_loss(), dec!(0.04));
        assert_eq!(tracker.remaining_budget(), dec!(2000));

        // exactly at the limit counts as a breach
        assert!(tracker.update(dec!(94000), dec!(0.06), now));
        assert!(tracker.is_breached());
    }

    #[test]
    fn test_rollover_resets_start_equity() {
        let now = morning();
        let mut tracker = DailyLossTracker::new(dec!(0.06), dec!(100000), now);
        assert!(tracker.update(dec!(93000), dec!(0.06), now));

        let tomorrow = now + Duration::days(1);
        assert!(!tracker.update(dec!(93000), dec!(0.06), tomorrow));
        assert_eq!(tracker.start_equity(), dec!(93000));
        assert_eq!(tracker.current_loss(), Decimal::ZERO);
    }

    #[test]
    fn test_limit_follows_each_update() {
        let now = morning();
        let mut tracker = DailyLossTracker::new(dec!(0.06), dec!(10000), now);

        // 4.5% down: inside 6%, past a tighter 3%
        assert!(!tracker.update(dec!(9550), dec!(0.06), now));
        assert!(tracker.update(dec!(9550), dec!(0.03), now));
        assert_eq!(tracker.limit(), dec!(0.03));
        assert_eq!(tracker.remaining_budget(), Decimal::ZERO);

        let stats = tracker.statistics();
        assert_eq!(stats.current_equity, dec!(9550));
        assert_eq!(stats.worst_loss, dec!(0.045));
        assert_eq!(stats.limit, dec!(0.03));
    }
}
