use std::fmt;
use std::iter::Sum;

use serde::{Deserialize, Serialize};

/// Fixed-point USD amount with 6 decimal places, stored as micro-dollars.
///
/// Cost accounting is single-currency; floating point never touches the
/// persisted counters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CostUsd(u64);

impl CostUsd {
    pub const ZERO: Self = Self(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    /// Lossy conversion for display-layer math only.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl Sum for CostUsd {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl fmt::Display for CostUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_six_decimals() {
        assert_eq!(CostUsd::from_micros(1_234_567).to_string(), "$1.234567");
        assert_eq!(CostUsd::from_micros(42).to_string(), "$0.000042");
        assert_eq!(CostUsd::ZERO.to_string(), "$0.000000");
    }

    #[test]
    fn arithmetic_saturates() {
        let a = CostUsd::from_micros(u64::MAX);
        assert_eq!(a.saturating_add(CostUsd::from_micros(1)), a);
        assert_eq!(
            CostUsd::from_micros(5).saturating_sub(CostUsd::from_micros(10)),
            CostUsd::ZERO
        );
    }

    #[test]
    fn sum_over_iterator() {
        let total: CostUsd = [100u64, 200, 300]
            .iter()
            .map(|m| CostUsd::from_micros(*m))
            .sum();
        assert_eq!(total, CostUsd::from_micros(600));
    }

    #[test]
    fn serde_transparent() {
        let cost = CostUsd::from_micros(750_000);
        let json = serde_json::to_string(&cost).unwrap();
        assert_eq!(json, "750000");
        let back: CostUsd = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cost);
    }
}
