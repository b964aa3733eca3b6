//! The max-plus (tropical) semiring over log probabilities.
//!
//! Every score in the chart is a natural-log probability. "Addition" picks the
//! better derivation (max) and "multiplication" combines independent
//! derivations (+), so inside scores are Viterbi-best scores.

use ordered_float::OrderedFloat;
use std::fmt::Debug;
use std::ops::{Add, Mul};

/// A natural-log probability as stored in chart and grammar arrays.
pub type LogProb = f32;

/// Score of a slot nothing has been written to. Dominated by every real score.
pub const UNPOPULATED: LogProb = f32::NEG_INFINITY;

/// A semiring provides addition (aggregation) and multiplication (combination).
pub trait Semiring: Copy + Debug + PartialEq + Add<Output = Self> + Mul<Output = Self> {
    /// The additive identity (zero element).
    fn zero() -> Self;

    /// The multiplicative identity (one element).
    fn one() -> Self;

    /// Check if this value is the additive identity.
    fn is_zero(&self) -> bool;

    /// Check if two values are approximately equal.
    fn approx_eq(&self, other: &Self) -> bool;
}

/// MaxPlus (Viterbi in log space) semiring: max and +.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaxPlus(pub OrderedFloat<LogProb>);

impl MaxPlus {
    #[inline(always)]
    pub fn new(x: LogProb) -> Self {
        MaxPlus(OrderedFloat(x))
    }

    /// Build from a plain (non-log) probability.
    pub fn from_probability(p: f64) -> Self {
        MaxPlus::new(p.ln() as LogProb)
    }

    #[inline(always)]
    pub fn value(&self) -> LogProb {
        self.0.into_inner()
    }
}

impl Default for MaxPlus {
    fn default() -> Self {
        MaxPlus::zero()
    }
}

impl Semiring for MaxPlus {
    fn zero() -> Self {
        MaxPlus::new(UNPOPULATED)
    }

    fn one() -> Self {
        MaxPlus::new(0.0)
    }

    fn is_zero(&self) -> bool {
        self.0.is_infinite() && self.0.is_sign_negative()
    }

    fn approx_eq(&self, other: &Self) -> bool {
        if self.is_zero() || other.is_zero() {
            return self.is_zero() && other.is_zero();
        }
        (self.value() - other.value()).abs() < 1e-5
    }
}

impl Add for MaxPlus {
    type Output = Self;

    #[inline(always)]
    fn add(self, other: Self) -> Self {
        MaxPlus(self.0.max(other.0))
    }
}

impl Mul for MaxPlus {
    type Output = Self;

    #[inline(always)]
    fn mul(self, other: Self) -> Self {
        MaxPlus(OrderedFloat(self.value() + other.value()))
    }
}

impl From<LogProb> for MaxPlus {
    fn from(x: LogProb) -> Self {
        MaxPlus::new(x)
    }
}

/// True if `candidate` strictly beats `current`; ties keep the incumbent.
#[inline(always)]
pub fn improves(candidate: LogProb, current: LogProb) -> bool {
    candidate > current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maxplus_semiring() {
        let a = MaxPlus::new(-3.0);
        let b = MaxPlus::new(-5.0);

        // max(-3, -5) = -3
        assert_eq!(a + b, MaxPlus::new(-3.0));
        // -3 + -5 = -8
        assert_eq!(a * b, MaxPlus::new(-8.0));

        // Identity elements
        assert_eq!(a + MaxPlus::zero(), a);
        assert_eq!(a * MaxPlus::one(), a);
    }

    #[test]
    fn test_zero_annihilates() {
        let a = MaxPlus::new(-1.5);
        assert!((a * MaxPlus::zero()).is_zero());
        assert!(MaxPlus::default().is_zero());
        assert!(!MaxPlus::one().is_zero());
    }

    #[test]
    fn test_from_probability() {
        let p = MaxPlus::from_probability(0.5);
        assert!((p.value() - 0.5f32.ln()).abs() < 1e-6);
        assert!(MaxPlus::from_probability(0.25).approx_eq(&(p * p)));
    }

    #[test]
    fn test_improves_keeps_incumbent_on_tie() {
        assert!(improves(-1.0, UNPOPULATED));
        assert!(!improves(-1.0, -1.0));
        assert!(!improves(UNPOPULATED, UNPOPULATED));
    }
}
