//! Posterior density over the parameter space.
//!
//! The posterior combines the uniform prior of a [`ParameterSpace`] with a
//! Gaussian likelihood of the surrogate's prediction around a target value:
//!
//! $$ \log p(\theta) = \log \pi(\theta) - \frac{1}{2}\left(\frac{f(\theta) - y^*}{\sigma}\right)^2 $$
//!
//! The predictor is never invoked for candidates outside the prior support.

use crate::errors::{Error, Result};
use crate::parameter::ParameterSpace;
use crate::predictor::Predictor;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Desired value of the output metric and the spread accepted around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Centre of the Gaussian likelihood
    pub value: f64,

    /// Standard deviation of the Gaussian likelihood
    pub tolerance: f64,
}

impl Target {
    /// Create a target, checking that the value is finite and the tolerance positive.
    pub fn new(value: f64, tolerance: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "Target value must be finite, got {}",
                value
            )));
        }
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "Target tolerance must be finite and positive, got {}",
                tolerance
            )));
        }
        Ok(Self { value, tolerance })
    }

    /// Gaussian log-likelihood of a predicted value, without normalising constant.
    pub fn log_likelihood(&self, predicted: f64) -> f64 {
        let residual = (predicted - self.value) / self.tolerance;
        -0.5 * residual * residual
    }
}

/// Outcome of evaluating the posterior at one candidate position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// Finite log-posterior value
    Finite(f64),

    /// Candidate lies outside the prior support; the predictor was not called
    OutOfBounds,

    /// Predictor failed or returned a non-finite value
    NonFinite,
}

impl Evaluation {
    /// Log-posterior value, `-inf` for rejected candidates.
    pub fn log_prob(&self) -> f64 {
        match self {
            Evaluation::Finite(lp) => *lp,
            Evaluation::OutOfBounds | Evaluation::NonFinite => f64::NEG_INFINITY,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Evaluation::Finite(_))
    }
}

/// Log-posterior for a fixed predictor and target.
///
/// Borrows its collaborators; constructing one is cheap.
pub struct Posterior<'a, P: ?Sized> {
    space: &'a ParameterSpace,
    predictor: &'a P,
    target: Target,
}

impl<'a, P: Predictor + ?Sized> Posterior<'a, P> {
    pub fn new(space: &'a ParameterSpace, predictor: &'a P, target: Target) -> Self {
        Self {
            space,
            predictor,
            target,
        }
    }

    pub fn space(&self) -> &'a ParameterSpace {
        self.space
    }

    pub fn predictor(&self) -> &'a P {
        self.predictor
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn ndim(&self) -> usize {
        self.space.ndim()
    }

    /// Evaluate the posterior at `theta`, reporting why a candidate was rejected.
    ///
    /// Makes at most one predictor call, and none when `theta` is out of bounds.
    pub fn evaluate(&self, theta: &[f64]) -> Evaluation {
        let log_prior = self.space.log_prior(theta);
        if !log_prior.is_finite() {
            return Evaluation::OutOfBounds;
        }

        let predicted = match self.predictor.predict(theta) {
            Ok(value) if value.is_finite() => value,
            Ok(value) => {
                trace!(predicted = value, "Predictor returned a non-finite value");
                return Evaluation::NonFinite;
            }
            Err(e) => {
                trace!(error = %e, "Predictor failed; rejecting candidate");
                return Evaluation::NonFinite;
            }
        };

        let log_prob = log_prior + self.target.log_likelihood(predicted);
        if log_prob.is_finite() {
            Evaluation::Finite(log_prob)
        } else {
            // Residual overflow for extreme predictions
            Evaluation::NonFinite
        }
    }

    /// Log-posterior at `theta`: `-inf` outside bounds or when the predictor fails.
    pub fn log_posterior(&self, theta: &[f64]) -> f64 {
        self.evaluate(theta).log_prob()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::from_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPredictor {
        calls: AtomicUsize,
    }

    impl Predictor for CountingPredictor {
        fn predict(&self, theta: &[f64]) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(theta[0] + theta[1])
        }
    }

    #[test]
    fn test_target_validation() {
        assert!(Target::new(1.0, 0.05).is_ok());
        assert!(Target::new(1.0, 0.0).is_err());
        assert!(Target::new(1.0, -1.0).is_err());
        assert!(Target::new(f64::NAN, 1.0).is_err());
        assert!(Target::new(1.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_out_of_bounds_skips_predictor() {
        let space = ParameterSpace::unit_hypercube(2).unwrap();
        let predictor = CountingPredictor {
            calls: AtomicUsize::new(0),
        };
        let posterior = Posterior::new(&space, &predictor, Target::new(1.0, 0.05).unwrap());

        for theta in [[-0.1, 0.5], [0.5, 1.2], [2.0, -3.0], [f64::NAN, 0.5]] {
            assert_eq!(posterior.log_posterior(&theta), f64::NEG_INFINITY);
            assert_eq!(posterior.evaluate(&theta), Evaluation::OutOfBounds);
        }
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);

        posterior.log_posterior(&[0.2, 0.3]);
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_bounds_matches_gaussian_likelihood() {
        let space = ParameterSpace::unit_hypercube(2).unwrap();
        let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);
        let target = Target::new(1.0, 0.05).unwrap();
        let posterior = Posterior::new(&space, &predictor, target);

        for theta in [[0.5, 0.5], [0.1, 0.2], [0.0, 0.0], [1.0, 1.0], [0.7, 0.2]] {
            let predicted = theta[0] + theta[1];
            let expected = -0.5 * ((predicted - 1.0) / 0.05f64).powi(2);
            assert_eq!(posterior.log_posterior(&theta), expected);
        }
    }

    #[test]
    fn test_non_finite_prediction_is_rejected() {
        let space = ParameterSpace::unit_hypercube(1).unwrap();
        let target = Target::new(0.0, 1.0).unwrap();

        let nan = from_fn(|_: &[f64]| f64::NAN);
        let posterior = Posterior::new(&space, &nan, target);
        assert_eq!(posterior.evaluate(&[0.5]), Evaluation::NonFinite);
        assert_eq!(posterior.log_posterior(&[0.5]), f64::NEG_INFINITY);

        let inf = from_fn(|_: &[f64]| f64::INFINITY);
        let posterior = Posterior::new(&space, &inf, target);
        assert_eq!(posterior.evaluate(&[0.5]), Evaluation::NonFinite);
    }

    #[test]
    fn test_failing_predictor_is_rejected() {
        struct Failing;
        impl Predictor for Failing {
            fn predict(&self, _theta: &[f64]) -> Result<f64> {
                Err(Error::Prediction("model crashed".to_string()))
            }
        }

        let space = ParameterSpace::unit_hypercube(1).unwrap();
        let posterior = Posterior::new(&space, &Failing, Target::new(0.0, 1.0).unwrap());
        assert_eq!(posterior.evaluate(&[0.5]), Evaluation::NonFinite);
    }
}
