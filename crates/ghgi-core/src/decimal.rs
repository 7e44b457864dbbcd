//! Fixed-point conversions and ratio helpers for emissions quantities.
//!
//! Quantities are carried as [`Decimal`] while being computed and only become
//! integers (whole kilograms) at the persistence boundary. Every rounding step
//! in the workspace goes through [`ROUNDING`] so persisted masses and reported
//! percentages agree on the midpoint rule.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Half away from zero, applied to persisted masses and percentages alike.
pub const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("decimal overflow while {0}")]
    Overflow(&'static str),
    #[error("value {0} does not fit the persisted integer range")]
    OutOfRange(Decimal),
}

/// Round to the nearest whole unit and narrow to the persisted integer type.
pub fn to_fixed(value: Decimal) -> Result<i64, DecimalError> {
    value
        .round_dp_with_strategy(0, ROUNDING)
        .to_i64()
        .ok_or(DecimalError::OutOfRange(value))
}

/// Lift a persisted whole-kilogram value back into decimal space.
pub fn from_fixed(value: i64) -> Decimal {
    Decimal::from(value)
}

/// Multiply in decimal space; callers convert with [`to_fixed`] afterwards.
pub fn scale(value: Decimal, factor: Decimal) -> Result<Decimal, DecimalError> {
    value
        .checked_mul(factor)
        .ok_or(DecimalError::Overflow("scaling a quantity"))
}

/// `numerator / denominator`, or `None` when the denominator is not positive.
pub fn ratio(numerator: i64, denominator: i64) -> Option<Decimal> {
    if denominator <= 0 {
        return None;
    }
    Decimal::from(numerator).checked_div(Decimal::from(denominator))
}

/// Whole-number share of `total`. A non-positive total yields 0.
pub fn percentage(part: Decimal, total: Decimal) -> i32 {
    if total <= Decimal::ZERO {
        return 0;
    }
    part.checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|scaled| scaled.checked_div(total))
        .and_then(|share| share.round_dp_with_strategy(0, ROUNDING).to_i32())
        .unwrap_or(0)
}

/// Sum persisted integers without leaving decimal space.
pub fn sum_fixed<I>(values: I) -> Decimal
where
    I: IntoIterator<Item = i64>,
{
    values.into_iter().map(from_fixed).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn to_fixed_rounds_half_away_from_zero() {
        assert_eq!(to_fixed(dec!(2.5)).unwrap(), 3);
        assert_eq!(to_fixed(dec!(3.5)).unwrap(), 4);
        assert_eq!(to_fixed(dec!(-2.5)).unwrap(), -3);
        assert_eq!(to_fixed(dec!(2.4999)).unwrap(), 2);
        assert_eq!(to_fixed(dec!(1234567.6)).unwrap(), 1234568);
    }

    #[test]
    fn to_fixed_rejects_values_beyond_i64() {
        let huge = Decimal::from(i64::MAX) * dec!(10);
        assert!(matches!(to_fixed(huge), Err(DecimalError::OutOfRange(_))));
    }

    #[test]
    fn scaling_happens_before_integer_conversion() {
        let factor = ratio(3_000_000, 20_000_000).unwrap();
        assert_eq!(factor, dec!(0.15));
        let scaled = scale(dec!(200000000), factor).unwrap();
        assert_eq!(to_fixed(scaled).unwrap(), 30_000_000);

        // 7 * (1/3) summed three times stays exact to the unit once rounded.
        let third = ratio(1, 3).unwrap();
        let total: Decimal = (0..3).map(|_| scale(dec!(7), third).unwrap()).sum();
        assert_eq!(to_fixed(total).unwrap(), 7);
        assert_eq!(to_fixed(from_fixed(30_000_000)).unwrap(), 30_000_000);
    }

    #[test]
    fn ratio_guards_non_positive_denominators() {
        assert_eq!(ratio(10, 0), None);
        assert_eq!(ratio(10, -4), None);
    }

    #[test]
    fn percentage_zero_guard() {
        assert_eq!(percentage(dec!(500), Decimal::ZERO), 0);
        assert_eq!(percentage(Decimal::ZERO, Decimal::ZERO), 0);
        assert_eq!(percentage(dec!(500), dec!(-10)), 0);
    }

    #[test]
    fn percentage_rounds_consistently() {
        assert_eq!(percentage(dec!(1), dec!(8)), 13); // 12.5
        assert_eq!(percentage(dec!(1), dec!(3)), 33);
        assert_eq!(percentage(dec!(2), dec!(3)), 67);
        assert_eq!(percentage(dec!(50), dec!(50)), 100);
    }

    #[test]
    fn sum_fixed_handles_city_scale_totals() {
        let total = sum_fixed([i64::MAX, i64::MAX, 1]);
        assert_eq!(total, Decimal::from(i64::MAX) * dec!(2) + dec!(1));
    }
}
