//! Posterior summaries and propagation to output space.
//!
//! Works on the trimmed, convergence-approved chain: the walkers' draws are
//! pooled into one set of exchangeable samples, marginal statistics are
//! computed per parameter, and a subset of samples is passed through the
//! predictor to quantify the uncertainty of the output metric.

use crate::chain::Chain;
use crate::parallel::Parallelism;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use surcal_core::{Error, Predictor, PropagationSampling, Result};
use tracing::{debug, warn};

/// Percentile `p` (in `[0, 100]`) of sorted data by linear interpolation
/// between order statistics, matching NumPy's default method.
///
/// Returns NaN for empty input.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let pos = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

/// Percentile `p` (in `[0, 100]`) of unsorted data.
pub fn percentile(data: &[f64], p: f64) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Interval between two percentiles of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    pub lower_percentile: f64,
    pub upper_percentile: f64,
    pub lower: f64,
    pub upper: f64,
}

impl CredibleInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Location, spread and interval of a set of scalar samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,

    /// Population standard deviation (`n` denominator)
    pub std: f64,

    pub median: f64,
    pub interval: CredibleInterval,
}

impl Statistics {
    fn from_samples(samples: &[f64], percentiles: [f64; 2]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;

        Self {
            mean,
            std: variance.sqrt(),
            median: percentile_sorted(&sorted, 50.0),
            interval: CredibleInterval {
                lower_percentile: percentiles[0],
                upper_percentile: percentiles[1],
                lower: percentile_sorted(&sorted, percentiles[0]),
                upper: percentile_sorted(&sorted, percentiles[1]),
            },
        }
    }
}

/// Marginal posterior summary of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    #[serde(flatten)]
    pub stats: Statistics,
}

/// Distribution of the output metric over posterior draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationSummary {
    /// Number of posterior draws requested
    pub n_requested: usize,

    /// Predictions that failed or were non-finite and were skipped
    pub n_failed: usize,

    #[serde(flatten)]
    pub stats: Statistics,

    /// Successful predictions in draw order
    pub predictions: Vec<f64>,
}

/// Summarizes converged chains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorSummarizer {
    percentiles: [f64; 2],
}

impl Default for PosteriorSummarizer {
    fn default() -> Self {
        Self {
            percentiles: [2.5, 97.5],
        }
    }
}

impl PosteriorSummarizer {
    /// Create a summarizer reporting the interval between two percentiles.
    pub fn new(percentiles: [f64; 2]) -> Result<Self> {
        let [lo, hi] = percentiles;
        if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo >= hi {
            return Err(Error::InvalidConfiguration(format!(
                "Credible percentiles must satisfy 0 <= lo < hi <= 100, got [{}, {}]",
                lo, hi
            )));
        }
        Ok(Self { percentiles })
    }

    pub fn percentiles(&self) -> [f64; 2] {
        self.percentiles
    }

    /// Pool all walkers' draws: shape (n_walkers * n_steps, n_params).
    pub fn flatten(&self, chain: &Chain) -> Array2<f64> {
        chain.flat_samples()
    }

    /// Per-parameter mean, standard deviation, median and credible interval.
    pub fn summarize(&self, chain: &Chain) -> Result<Vec<ParameterSummary>> {
        if chain.is_empty() {
            return Err(Error::InsufficientSamples(
                "Cannot summarize an empty chain".to_string(),
            ));
        }

        let flat = self.flatten(chain);
        Ok(chain
            .param_names()
            .iter()
            .zip(flat.columns())
            .map(|(name, column)| ParameterSummary {
                name: name.clone(),
                stats: Statistics::from_samples(&column.to_vec(), self.percentiles),
            })
            .collect())
    }

    /// Pass `n_samples` rows of `pool` through the predictor.
    ///
    /// Rows are selected with `rng` according to `sampling`. Failed or
    /// non-finite predictions are skipped and counted. Predictions run on
    /// the global rayon pool; use [`PosteriorSummarizer::propagate_with`] to
    /// control concurrency.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] when `n_samples` is zero, the pool is
    ///   empty, or more rows are requested than the pool holds without replacement
    /// - [`Error::NonFiniteEvaluation`] when no prediction succeeds
    pub fn propagate<P, R>(
        &self,
        pool: &Array2<f64>,
        predictor: &P,
        n_samples: usize,
        sampling: PropagationSampling,
        rng: &mut R,
    ) -> Result<PropagationSummary>
    where
        P: Predictor + ?Sized,
        R: Rng + ?Sized,
    {
        self.propagate_with(
            pool,
            predictor,
            n_samples,
            sampling,
            rng,
            &Parallelism::default(),
        )
    }

    /// [`PosteriorSummarizer::propagate`] with predictions executed under
    /// `parallelism`.
    pub fn propagate_with<P, R>(
        &self,
        pool: &Array2<f64>,
        predictor: &P,
        n_samples: usize,
        sampling: PropagationSampling,
        rng: &mut R,
        parallelism: &Parallelism,
    ) -> Result<PropagationSummary>
    where
        P: Predictor + ?Sized,
        R: Rng + ?Sized,
    {
        let pool_size = pool.nrows();
        if n_samples == 0 || pool_size == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "Cannot propagate {} samples from a pool of {}",
                n_samples, pool_size
            )));
        }

        let indices: Vec<usize> = match sampling {
            PropagationSampling::WithoutReplacement => {
                if n_samples > pool_size {
                    return Err(Error::InvalidConfiguration(format!(
                        "Cannot draw {} samples without replacement from a pool of {}",
                        n_samples, pool_size
                    )));
                }
                rand::seq::index::sample(rng, pool_size, n_samples).into_vec()
            }
            PropagationSampling::WithReplacement => (0..n_samples)
                .map(|_| rng.gen_range(0..pool_size))
                .collect(),
        };

        let thetas: Vec<Vec<f64>> = indices
            .iter()
            .map(|&i| pool.row(i).to_vec())
            .collect();
        let outcomes = parallelism.predict_batch(predictor, &thetas);

        let mut predictions = Vec::with_capacity(n_samples);
        let mut n_failed = 0;
        for outcome in outcomes {
            match outcome {
                Ok(value) if value.is_finite() => predictions.push(value),
                Ok(value) => {
                    debug!(predicted = value, "Skipping non-finite prediction");
                    n_failed += 1;
                }
                Err(e) => {
                    debug!(error = %e, "Skipping failed prediction");
                    n_failed += 1;
                }
            }
        }

        if predictions.is_empty() {
            return Err(Error::NonFiniteEvaluation(format!(
                "All {} propagated predictions failed or were non-finite",
                n_samples
            )));
        }
        if n_failed > 0 {
            warn!(
                n_failed,
                n_requested = n_samples,
                "Some propagated predictions failed and were skipped"
            );
        }

        Ok(PropagationSummary {
            n_requested: n_samples,
            n_failed,
            stats: Statistics::from_samples(&predictions, self.percentiles),
            predictions,
        })
    }
}
