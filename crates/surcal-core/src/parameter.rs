//! Box-constrained parameter domain.
//!
//! Every calibrated parameter lives on a closed interval, by default the unit
//! interval `[0, 1]`. The [`ParameterSpace`] is the uniform prior of the
//! calibration: its log density is `0` inside the box and `-inf` outside.

use crate::errors::{Error, Result};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Maximum number of redraws when an initial position collides with an earlier one.
const MAX_REDRAWS: usize = 100;

/// Closed interval `[lo, hi]` for a single parameter.
///
/// Serialises as a two element array `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Bounds {
    pub lo: f64,
    pub hi: f64,
}

impl Bounds {
    /// Create bounds, checking that both ends are finite and `lo < hi`.
    pub fn new(lo: f64, hi: f64) -> Result<Self> {
        let bounds = Self { lo, hi };
        bounds.validate()?;
        Ok(bounds)
    }

    /// The unit interval `[0, 1]`.
    pub fn unit() -> Self {
        Self { lo: 0.0, hi: 1.0 }
    }

    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }

    /// Whether `value` lies inside the closed interval. NaN is never contained.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value <= self.hi
    }

    fn validate(&self) -> Result<()> {
        if !self.lo.is_finite() || !self.hi.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "Parameter bounds must be finite, got [{}, {}]",
                self.lo, self.hi
            )));
        }
        if self.lo >= self.hi {
            return Err(Error::InvalidConfiguration(format!(
                "Lower bound must be strictly less than upper bound, got [{}, {}]",
                self.lo, self.hi
            )));
        }
        Ok(())
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::unit()
    }
}

impl From<[f64; 2]> for Bounds {
    fn from(value: [f64; 2]) -> Self {
        Self {
            lo: value[0],
            hi: value[1],
        }
    }
}

impl From<Bounds> for [f64; 2] {
    fn from(value: Bounds) -> Self {
        [value.lo, value.hi]
    }
}

/// Fixed-dimension, box-constrained parameter domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    names: Vec<String>,
    bounds: Vec<Bounds>,
}

impl ParameterSpace {
    /// Create a parameter space from parameter names and their bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the space has no dimensions,
    /// the number of names and bounds differ, a name is repeated, or any bound
    /// is malformed (`lo >= hi` or non-finite).
    pub fn new(names: Vec<String>, bounds: Vec<Bounds>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::InvalidConfiguration(
                "Parameter space must have at least one dimension".to_string(),
            ));
        }
        if names.len() != bounds.len() {
            return Err(Error::InvalidConfiguration(format!(
                "Number of parameter names ({}) does not match number of bounds ({})",
                names.len(),
                bounds.len()
            )));
        }

        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "Duplicate parameter name '{}'",
                    name
                )));
            }
        }

        for (name, b) in names.iter().zip(bounds.iter()) {
            b.validate().map_err(|e| match e {
                Error::InvalidConfiguration(msg) => {
                    Error::InvalidConfiguration(format!("Parameter '{}': {}", name, msg))
                }
                other => other,
            })?;
        }

        Ok(Self { names, bounds })
    }

    /// The unit hypercube `[0, 1]^ndim` with parameters named `theta_0..theta_{ndim-1}`.
    pub fn unit_hypercube(ndim: usize) -> Result<Self> {
        Self::new(default_names(ndim), vec![Bounds::unit(); ndim])
    }

    pub fn ndim(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn bounds(&self) -> &[Bounds] {
        &self.bounds
    }

    /// Whether every component of `theta` lies within its bounds.
    ///
    /// A vector of the wrong length is never contained.
    pub fn contains(&self, theta: &[f64]) -> bool {
        theta.len() == self.ndim()
            && theta
                .iter()
                .zip(self.bounds.iter())
                .all(|(&x, b)| b.contains(x))
    }

    /// Log density of the uniform prior: `0.0` inside the box, `-inf` outside.
    ///
    /// The density is left unnormalised; only differences matter to the sampler.
    pub fn log_prior(&self, theta: &[f64]) -> f64 {
        if self.contains(theta) {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Draw `n` positions independently and uniformly from the box.
    ///
    /// Rows are pairwise distinct: a draw identical to an earlier row is redrawn,
    /// since two walkers at the same point produce degenerate stretch moves.
    pub fn sample_uniform<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Array2<f64>> {
        let ndim = self.ndim();
        let mut positions = Array2::zeros((n, ndim));

        for i in 0..n {
            let mut attempts = 0;
            loop {
                for (j, b) in self.bounds.iter().enumerate() {
                    positions[[i, j]] = b.lo + b.width() * rng.gen::<f64>();
                }

                let row = positions.row(i);
                let duplicate = (0..i).any(|k| positions.row(k) == row);
                if !duplicate {
                    break;
                }

                attempts += 1;
                if attempts >= MAX_REDRAWS {
                    return Err(Error::InvalidConfiguration(format!(
                        "Could not draw {} distinct initial positions",
                        n
                    )));
                }
            }
        }

        Ok(positions)
    }
}

/// Default parameter names `theta_0..theta_{ndim-1}`.
pub fn default_names(ndim: usize) -> Vec<String> {
    (0..ndim).map(|i| format!("theta_{}", i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_bounds_validation() {
        assert!(Bounds::new(0.0, 1.0).is_ok());
        assert!(Bounds::new(1.0, 1.0).is_err());
        assert!(Bounds::new(2.0, 1.0).is_err());
        assert!(Bounds::new(f64::NEG_INFINITY, 1.0).is_err());
        assert!(Bounds::new(0.0, f64::NAN).is_err());
    }

    #[test]
    fn test_bounds_are_closed() {
        let b = Bounds::unit();
        assert!(b.contains(0.0));
        assert!(b.contains(1.0));
        assert!(!b.contains(-1e-12));
        assert!(!b.contains(1.0 + 1e-12));
        assert!(!b.contains(f64::NAN));
    }

    #[test]
    fn test_bounds_serialise_as_pair() {
        let b = Bounds::new(-2.0, 3.5).unwrap();
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[-2.0,3.5]");
        let back: Bounds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_unit_hypercube() {
        let space = ParameterSpace::unit_hypercube(3).unwrap();
        assert_eq!(space.ndim(), 3);
        assert_eq!(space.names(), &["theta_0", "theta_1", "theta_2"]);
        assert!(space.bounds().iter().all(|b| *b == Bounds::unit()));

        assert!(ParameterSpace::unit_hypercube(0).is_err());
    }

    #[test]
    fn test_space_validation() {
        let names = vec!["a".to_string(), "b".to_string()];

        let result = ParameterSpace::new(names.clone(), vec![Bounds::unit()]);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        let result = ParameterSpace::new(
            vec!["a".to_string(), "a".to_string()],
            vec![Bounds::unit(), Bounds::unit()],
        );
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        let result = ParameterSpace::new(names, vec![Bounds::unit(), Bounds { lo: 1.0, hi: 0.0 }]);
        match result {
            Err(Error::InvalidConfiguration(msg)) => assert!(msg.contains("'b'"), "{}", msg),
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_log_prior() {
        let space = ParameterSpace::unit_hypercube(2).unwrap();

        assert_eq!(space.log_prior(&[0.5, 0.5]), 0.0);
        assert_eq!(space.log_prior(&[0.0, 1.0]), 0.0);
        assert_eq!(space.log_prior(&[-0.1, 0.5]), f64::NEG_INFINITY);
        assert_eq!(space.log_prior(&[0.5, 1.1]), f64::NEG_INFINITY);
        assert_eq!(space.log_prior(&[f64::NAN, 0.5]), f64::NEG_INFINITY);
        assert_eq!(space.log_prior(&[0.5]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_sample_uniform_in_bounds_and_distinct() {
        let space = ParameterSpace::new(
            vec!["x".to_string(), "y".to_string()],
            vec![Bounds::new(0.0, 1.0).unwrap(), Bounds::new(-5.0, 5.0).unwrap()],
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let positions = space.sample_uniform(64, &mut rng).unwrap();
        assert_eq!(positions.dim(), (64, 2));

        for row in positions.outer_iter() {
            assert!(space.contains(row.as_slice().unwrap()));
        }
        for i in 0..64 {
            for k in 0..i {
                assert_ne!(positions.row(i), positions.row(k));
            }
        }
    }

    #[test]
    fn test_sample_uniform_is_reproducible() {
        let space = ParameterSpace::unit_hypercube(4).unwrap();
        let a = space
            .sample_uniform(10, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        let b = space
            .sample_uniform(10, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
    }
}
