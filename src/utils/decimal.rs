//! Decimal arithmetic helpers for prices, quantities and scores.

use rust_decimal::Decimal;

/// Round to tick size (e.g., 0.01 for most equity prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// Volume-weighted price after adding `qty` at `price` to `existing_qty` at `existing_price`.
pub fn blend_price(
    existing_qty: Decimal,
    existing_price: Decimal,
    qty: Decimal,
    price: Decimal,
) -> Decimal {
    weighted_average(&[(existing_price, existing_qty), (price, qty)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(98.0049), dec!(0.01)), dec!(98.00));
        assert_eq!(round_to_tick(dec!(104.456), dec!(0.05)), dec!(104.45));
        assert_eq!(round_to_tick(dec!(12.5), Decimal::ZERO), dec!(12.5));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(512.9), dec!(1)), dec!(512));
        assert_eq!(round_down_to_lot(dec!(512.9), dec!(100)), dec!(500));
        assert_eq!(round_down_to_lot(dec!(99), dec!(100)), dec!(0));
    }

    #[test]
    fn test_safe_div_by_zero() {
        assert_eq!(safe_div(dec!(5), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(safe_div(dec!(3), dec!(4)), dec!(0.75));
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![
            (dec!(0.8), dec!(0.4)),
            (dec!(0.7), dec!(0.3)),
            (dec!(0.9), dec!(0.3)),
        ];
        // (0.32 + 0.21 + 0.27) / 1.0
        assert_eq!(weighted_average(&values), dec!(0.80));
    }

    #[test]
    fn test_blend_price() {
        // 100 @ 10 + 100 @ 12 = 200 @ 11
        assert_eq!(blend_price(dec!(100), dec!(10), dec!(100), dec!(12)), dec!(11));
        assert_eq!(blend_price(Decimal::ZERO, Decimal::ZERO, dec!(5), dec!(20)), dec!(20));
    }
}
