//! Integer money in minor currency units.

use serde::{Deserialize, Serialize};

/// Money amount in minor units. Never floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money {
    amount: i64,
}

impl Money {
    /// Creates a money amount from minor units.
    pub const fn new(amount: i64) -> Self {
        Self { amount }
    }

    /// Returns zero money.
    pub const fn zero() -> Self {
        Self { amount: 0 }
    }

    /// Returns the amount in minor units.
    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Multiplies by a quantity.
    pub fn multiply(&self, quantity: u32) -> Money {
        Money {
            amount: self.amount * i64::from(quantity),
        }
    }

    /// Returns `percent`% of this amount, rounded down.
    pub fn percent(&self, percent: u8) -> Money {
        Money {
            amount: self.amount * i64::from(percent) / 100,
        }
    }

    /// Subtracts, clamping at zero.
    pub fn saturating_sub(&self, other: Money) -> Money {
        Money {
            amount: (self.amount - other.amount).max(0),
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.amount)
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            amount: self.amount + rhs.amount,
        }
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        Money {
            amount: self.amount - rhs.amount,
        }
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.amount += rhs.amount;
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_arithmetic() {
        let a = Money::new(10_000);
        let b = Money::new(2_500);

        assert_eq!((a + b).amount(), 12_500);
        assert_eq!((a - b).amount(), 7_500);
        assert_eq!(b.multiply(3).amount(), 7_500);
    }

    #[test]
    fn test_percent_rounds_down() {
        assert_eq!(Money::new(15_999).percent(10), Money::new(1_599));
        assert_eq!(Money::new(100).percent(0), Money::zero());
    }

    #[test]
    fn test_saturating_sub_never_negative() {
        assert_eq!(Money::new(500).saturating_sub(Money::new(800)), Money::zero());
        assert_eq!(Money::new(800).saturating_sub(Money::new(500)), Money::new(300));
    }

    #[test]
    fn test_sum() {
        let total: Money = [Money::new(1), Money::new(2), Money::new(3)].into_iter().sum();
        assert_eq!(total, Money::new(6));
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        assert_eq!(serde_json::to_string(&Money::new(15000)).unwrap(), "15000");
    }
}
