#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Activation functions a neuron can squash its state through.
///
/// The set is closed: the compiler lowers each variant to a single
/// instruction, so new functions mean a new variant here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Squash {
    /// `1 / (1 + e^-x)`
    #[default]
    Logistic,
    Tanh,
    Identity,
    /// Hard limit: 1 when `x > 0`, else 0. Derivative is taken as 1.
    Step,
    Relu,
}

impl Squash {
    pub const ALL: [Squash; 5] = [
        Squash::Logistic,
        Squash::Tanh,
        Squash::Identity,
        Squash::Step,
        Squash::Relu,
    ];

    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Squash::Logistic => 1.0 / (1.0 + (-x).exp()),
            Squash::Tanh => x.tanh(),
            Squash::Identity => x,
            Squash::Step => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Squash::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
        }
    }

    #[inline]
    pub fn derivative(self, x: f64) -> f64 {
        match self {
            Squash::Logistic => {
                let fx = self.apply(x);
                fx * (1.0 - fx)
            }
            Squash::Tanh => {
                let fx = x.tanh();
                1.0 - fx * fx
            }
            Squash::Identity | Squash::Step => 1.0,
            Squash::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Activation and derivative in one call; both execution modes use this.
    #[inline]
    pub fn eval(self, x: f64) -> (f64, f64) {
        (self.apply(x), self.derivative(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistic_is_centered_at_half() {
        let (fx, dfx) = Squash::Logistic.eval(0.0);
        assert_eq!(fx, 0.5);
        assert_eq!(dfx, 0.25);
    }

    #[test]
    fn relu_and_step_cut_at_zero() {
        assert_eq!(Squash::Relu.apply(-2.0), 0.0);
        assert_eq!(Squash::Relu.apply(2.0), 2.0);
        assert_eq!(Squash::Relu.derivative(-2.0), 0.0);
        assert_eq!(Squash::Step.apply(0.0), 0.0);
        assert_eq!(Squash::Step.apply(0.1), 1.0);
        assert_eq!(Squash::Step.derivative(-3.0), 1.0);
    }

    #[test]
    fn tanh_derivative_matches_finite_difference() {
        let x = 0.3;
        let h = 1e-6;
        let numeric = (Squash::Tanh.apply(x + h) - Squash::Tanh.apply(x - h)) / (2.0 * h);
        assert!((numeric - Squash::Tanh.derivative(x)).abs() < 1e-8);
    }
}
