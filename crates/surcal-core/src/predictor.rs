//! The surrogate predictor capability.
//!
//! The calibration core treats the pre-trained regression surrogate as an
//! opaque function `predict(theta) -> scalar`. Nothing is assumed about how it
//! was fitted or how it is represented internally, so tests can substitute
//! plain closures and production code can plug in any model family.

use crate::errors::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A pure, deterministic mapping from a parameter vector to a scalar output.
///
/// Implementations must be safe to call concurrently from several threads:
/// posterior evaluations within one half-step of the sampler run in parallel.
pub trait Predictor: Send + Sync {
    /// Predict the output metric for the parameter vector `theta`.
    fn predict(&self, theta: &[f64]) -> Result<f64>;

    /// Check that the predictor can be used at all.
    ///
    /// Called once before sampling starts. Returning
    /// [`Error::PredictorUnavailable`] aborts the run before any sample is drawn.
    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    /// Predict for several parameter vectors in parallel, preserving order.
    fn predict_batch(&self, thetas: &[Vec<f64>]) -> Vec<Result<f64>> {
        thetas.par_iter().map(|theta| self.predict(theta)).collect()
    }
}

impl<T: Predictor + ?Sized> Predictor for &T {
    fn predict(&self, theta: &[f64]) -> Result<f64> {
        (**self).predict(theta)
    }

    fn check_available(&self) -> Result<()> {
        (**self).check_available()
    }
}

impl<T: Predictor + ?Sized> Predictor for Box<T> {
    fn predict(&self, theta: &[f64]) -> Result<f64> {
        (**self).predict(theta)
    }

    fn check_available(&self) -> Result<()> {
        (**self).check_available()
    }
}

impl<T: Predictor + ?Sized> Predictor for Arc<T> {
    fn predict(&self, theta: &[f64]) -> Result<f64> {
        (**self).predict(theta)
    }

    fn check_available(&self) -> Result<()> {
        (**self).check_available()
    }
}

/// Adapter turning an infallible closure into a [`Predictor`].
#[derive(Clone)]
pub struct FnPredictor<F> {
    f: F,
}

impl<F> FnPredictor<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Predictor for FnPredictor<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn predict(&self, theta: &[f64]) -> Result<f64> {
        Ok((self.f)(theta))
    }
}

/// Wrap a closure as a predictor.
///
/// ```
/// use surcal_core::predictor::{from_fn, Predictor};
///
/// let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);
/// assert_eq!(predictor.predict(&[0.25, 0.5]).unwrap(), 0.75);
/// ```
pub fn from_fn<F>(f: F) -> FnPredictor<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    FnPredictor::new(f)
}

/// A linear surrogate `intercept + coefficients · theta`.
///
/// Useful as a stand-in for a trained regression model. The coefficients are
/// typically exported from the training environment to a TOML file:
///
/// ```toml
/// intercept = 0.1
/// coefficients = [0.8, -0.3]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSurrogate {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearSurrogate {
    pub fn new(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            intercept,
            coefficients,
        }
    }

    /// Parse a surrogate from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let surrogate: LinearSurrogate = toml::from_str(contents).map_err(|e| {
            Error::PredictorUnavailable(format!("Failed to parse surrogate definition: {}", e))
        })?;
        surrogate.check_available()?;
        Ok(surrogate)
    }

    /// Load a surrogate from a TOML file.
    ///
    /// A missing or malformed file is reported as [`Error::PredictorUnavailable`].
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::PredictorUnavailable(format!(
                "Failed to read surrogate file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn ndim(&self) -> usize {
        self.coefficients.len()
    }
}

impl Predictor for LinearSurrogate {
    fn predict(&self, theta: &[f64]) -> Result<f64> {
        if theta.len() != self.coefficients.len() {
            return Err(Error::Prediction(format!(
                "Surrogate expects {} parameters, got {}",
                self.coefficients.len(),
                theta.len()
            )));
        }
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(theta.iter())
                .map(|(c, x)| c * x)
                .sum::<f64>())
    }

    fn check_available(&self) -> Result<()> {
        if self.coefficients.is_empty() {
            return Err(Error::PredictorUnavailable(
                "Linear surrogate has no coefficients".to_string(),
            ));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(Error::PredictorUnavailable(
                "Linear surrogate has non-finite coefficients".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fn_predictor() {
        let predictor = from_fn(|theta: &[f64]| theta.iter().sum());
        assert_eq!(predictor.predict(&[0.1, 0.2, 0.3]).unwrap(), 0.1 + 0.2 + 0.3);
        assert!(predictor.check_available().is_ok());
    }

    #[test]
    fn test_predict_batch_preserves_order() {
        let predictor = from_fn(|theta: &[f64]| theta[0] * 2.0);
        let thetas: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64]).collect();

        let outputs = predictor.predict_batch(&thetas);
        for (i, out) in outputs.into_iter().enumerate() {
            assert_eq!(out.unwrap(), 2.0 * i as f64);
        }
    }

    #[test]
    fn test_trait_objects_forward() {
        let boxed: Box<dyn Predictor> = Box::new(from_fn(|theta: &[f64]| theta[0]));
        assert_eq!(boxed.predict(&[3.0]).unwrap(), 3.0);

        let shared: Arc<dyn Predictor> = Arc::new(LinearSurrogate::new(1.0, vec![2.0]));
        assert_eq!((&shared).predict(&[0.5]).unwrap(), 2.0);
    }

    #[test]
    fn test_linear_surrogate() {
        let surrogate = LinearSurrogate::new(0.5, vec![1.0, -2.0]);
        assert_eq!(surrogate.predict(&[1.0, 0.25]).unwrap(), 1.0);
        assert!(matches!(
            surrogate.predict(&[1.0]),
            Err(Error::Prediction(_))
        ));
    }

    #[test]
    fn test_linear_surrogate_from_toml() {
        let surrogate =
            LinearSurrogate::from_toml_str("intercept = 0.1\ncoefficients = [0.8, -0.3]\n")
                .unwrap();
        assert_eq!(surrogate.ndim(), 2);
        assert_eq!(surrogate.coefficients, vec![0.8, -0.3]);

        let result = LinearSurrogate::from_toml_str("intercept = 0.1\ncoefficients = []\n");
        assert!(matches!(result, Err(Error::PredictorUnavailable(_))));

        let result = LinearSurrogate::from_toml_str("not toml at all = [");
        assert!(matches!(result, Err(Error::PredictorUnavailable(_))));
    }

    #[test]
    fn test_linear_surrogate_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surrogate.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "intercept = 0.0").unwrap();
        writeln!(file, "coefficients = [1.0, 1.0]").unwrap();
        drop(file);

        let surrogate = LinearSurrogate::from_toml_file(&path).unwrap();
        approx::assert_relative_eq!(surrogate.predict(&[0.3, 0.4]).unwrap(), 0.7, epsilon = 1e-12);

        let missing = LinearSurrogate::from_toml_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::PredictorUnavailable(_))));
    }
}
