//! Fixed-point monetary amounts.
//!
//! [`Money`] counts nano-units: 10⁻¹⁰ of one US dollar. All accounting runs on
//! the integer; floating point only appears when rendering amounts for humans
//! or when accepting amounts from the command line.

use std::{fmt, iter::Sum, ops::Add};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nano-units in one dollar.
pub const NANOS_PER_UNIT: i64 = 10_000_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum MoneyError {
    #[error("amount {0} is outside the representable money range")]
    OutOfRange(Decimal),
}

/// An amount of money in nano-units.
///
/// Negative values are an in-band sentinel for "disabled/unbounded" wherever a
/// limit is expected; zero means "no allowance".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);
    pub const MAX: Money = Money(i64::MAX);
    /// Canonical "limiting disabled" value.
    pub const DISABLED: Money = Money(-1);

    pub const fn from_nanos(nanos: i64) -> Self {
        Money(nanos)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Convert a dollar amount, rounding to the nearest nano-unit.
    ///
    /// Values beyond the i64 range saturate; this is only used for display-grade
    /// input such as CLI flags and admin requests.
    pub fn from_dollars(dollars: f64) -> Self {
        Money((dollars * NANOS_PER_UNIT as f64).round() as i64)
    }

    /// Exact conversion from a decimal dollar amount, rounding half away from zero.
    pub fn from_decimal(dollars: Decimal) -> Result<Self, MoneyError> {
        let nanos = dollars
            .checked_mul(Decimal::from(NANOS_PER_UNIT))
            .ok_or(MoneyError::OutOfRange(dollars))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        nanos
            .to_i64()
            .map(Money)
            .ok_or(MoneyError::OutOfRange(dollars))
    }

    pub fn to_dollars(self) -> f64 {
        self.0 as f64 / NANOS_PER_UNIT as f64
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0 as i128, 10).normalize()
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_multiply(self, count: i64) -> Option<Money> {
        self.0.checked_mul(count).map(Money)
    }

    /// Sum clamped to [`Money::MAX`]; used where the operands come from outside.
    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }

    /// `self - other`, floored at zero. Only meant for "remaining allowance" figures.
    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rounded = self
            .to_decimal()
            .round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero);
        write!(f, "${:.8}", rounded)
    }
}
