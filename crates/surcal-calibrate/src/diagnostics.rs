//! Convergence and mixing diagnostics for ensemble chains.
//!
//! Each walker's trace is treated as one chain. The Gelman-Rubin statistic
//! compares between-walker and within-walker variance per parameter; values
//! near 1.0 indicate that the walkers sample the same distribution.
//!
//! All functions expect a chain with burn-in already removed.
//!
//! # References
//!
//! Gelman, A., & Rubin, D. B. (1992). Inference from iterative simulation using
//! multiple sequences. Statistical Science, 7(4), 457-472.

use crate::chain::Chain;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use surcal_core::{Error, Result};
use tracing::info;

/// Minimum number of steps for autocorrelation estimates.
const MIN_AUTOCORR_STEPS: usize = 10;

/// Maximum lag considered in autocorrelation sums.
const MAX_AUTOCORR_LAG: usize = 100;

/// One R-hat value per parameter, in parameter order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhatVector(IndexMap<String, f64>);

impl RhatVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.values().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Largest R-hat over all parameters.
    pub fn max(&self) -> f64 {
        self.values().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn as_map(&self) -> &IndexMap<String, f64> {
        &self.0
    }

    pub fn into_inner(self) -> IndexMap<String, f64> {
        self.0
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with `n - 1` denominator.
fn sample_variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

fn check_shape(chain: &Chain, min_steps: usize) -> Result<()> {
    if chain.n_walkers() < 2 {
        return Err(Error::InsufficientSamples(format!(
            "At least 2 chains are required, got {}",
            chain.n_walkers()
        )));
    }
    if chain.len() < min_steps {
        return Err(Error::InsufficientSamples(format!(
            "At least {} steps are required, got {}",
            min_steps,
            chain.len()
        )));
    }
    Ok(())
}

/// Per-walker traces of parameter `param`.
fn walker_traces(chain: &Chain, param: usize) -> Vec<Vec<f64>> {
    (0..chain.n_walkers())
        .map(|w| chain.walker_trace(w, param).to_vec())
        .collect()
}

/// Compute the Gelman-Rubin statistic for every parameter.
///
/// For `C` chains of `n` steps with chain means `m_c`, overall mean `m` and
/// chain variances `s_c^2`:
///
/// 1. Between-chain term `B/n = Σ(m_c - m)^2 / (C - 1)`
/// 2. Within-chain variance `W = mean(s_c^2)`
/// 3. Pooled variance `var+ = (n - 1)/n * W + B/n`
/// 4. `R-hat = sqrt(var+ / W)`
///
/// # Errors
///
/// - [`Error::InsufficientSamples`] with fewer than 2 chains or 2 steps
/// - [`Error::DegenerateVariance`] when `W` is zero or non-finite for a parameter
pub fn gelman_rubin(chain: &Chain) -> Result<RhatVector> {
    check_shape(chain, 2)?;

    let n_chains = chain.n_walkers() as f64;
    let n = chain.len() as f64;
    let mut result = IndexMap::new();

    for (param_idx, name) in chain.param_names().iter().enumerate() {
        let traces = walker_traces(chain, param_idx);

        let chain_means: Vec<f64> = traces.iter().map(|t| mean(t)).collect();
        let chain_vars: Vec<f64> = traces
            .iter()
            .zip(chain_means.iter())
            .map(|(t, &m)| sample_variance(t, m))
            .collect();

        let w = mean(&chain_vars);
        if !(w.is_finite() && w > 0.0) {
            return Err(Error::DegenerateVariance {
                dimension: param_idx,
                name: name.clone(),
            });
        }

        let overall_mean = mean(&chain_means);
        let b_over_n = chain_means
            .iter()
            .map(|&m| (m - overall_mean).powi(2))
            .sum::<f64>()
            / (n_chains - 1.0);

        let var_plus = (n - 1.0) / n * w + b_over_n;
        result.insert(name.clone(), (var_plus / w).sqrt());
    }

    Ok(RhatVector(result))
}

/// Outcome of comparing R-hat values against a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub rhat: RhatVector,
    pub threshold: f64,

    /// Whether every R-hat is at most `threshold`
    pub converged: bool,
}

impl ConvergenceReport {
    pub fn new(rhat: RhatVector, threshold: f64) -> Self {
        let converged = rhat.values().all(|r| r.is_finite() && r <= threshold);
        Self {
            rhat,
            threshold,
            converged,
        }
    }

    /// Parameters whose R-hat exceeds the threshold, with their values.
    pub fn offending(&self) -> Vec<(String, f64)> {
        self.rhat
            .iter()
            .filter(|&(_, &r)| !(r.is_finite() && r <= self.threshold))
            .map(|(name, &r)| (name.clone(), r))
            .collect()
    }

    /// Turn a failing report into [`Error::NonConvergence`].
    pub fn into_result(self) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(Error::NonConvergence {
                threshold: self.threshold,
                offending: self.offending(),
            })
        }
    }
}

/// Compute R-hat for a trimmed chain and compare it against `threshold`.
///
/// A chain that has not converged is not an error here; see
/// [`ConvergenceReport::into_result`].
pub fn check_convergence(chain: &Chain, threshold: f64) -> Result<ConvergenceReport> {
    let report = ConvergenceReport::new(gelman_rubin(chain)?, threshold);
    info!(
        converged = report.converged,
        max_rhat = report.rhat.max(),
        threshold,
        "Gelman-Rubin diagnostic"
    );
    Ok(report)
}

/// Autocorrelation of `trace` at lags `1..=max_lag`.
///
/// A constant trace has zero autocorrelation at every lag.
fn compute_autocorrelation(trace: &[f64], max_lag: usize) -> Vec<f64> {
    let n = trace.len();
    let m = mean(trace);
    let variance = trace.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / n as f64;

    if variance == 0.0 {
        return vec![0.0; max_lag];
    }

    (1..=max_lag)
        .map(|lag| {
            if lag >= n {
                return 0.0;
            }
            let covariance = (0..n - lag)
                .map(|i| (trace[i] - m) * (trace[i + lag] - m))
                .sum::<f64>()
                / (n - lag) as f64;
            covariance / variance
        })
        .collect()
}

/// Integrated autocorrelation time per parameter.
///
/// τ = 1 + 2 Σ ρ(k), where ρ is the autocorrelation averaged over walkers and
/// the sum runs over lags up to `min(n/2, 100)`, stopping at the first
/// non-positive value.
///
/// # Errors
///
/// [`Error::InsufficientSamples`] with fewer than 2 walkers or 10 steps.
pub fn autocorr_time(chain: &Chain) -> Result<IndexMap<String, f64>> {
    check_shape(chain, MIN_AUTOCORR_STEPS)?;

    let n_walkers = chain.n_walkers();
    let max_lag = (chain.len() / 2).min(MAX_AUTOCORR_LAG);
    let mut result = IndexMap::new();

    for (param_idx, name) in chain.param_names().iter().enumerate() {
        let mut avg_autocorr = vec![0.0; max_lag];
        for trace in walker_traces(chain, param_idx) {
            for (avg, ac) in avg_autocorr
                .iter_mut()
                .zip(compute_autocorrelation(&trace, max_lag))
            {
                *avg += ac / n_walkers as f64;
            }
        }

        let sum_autocorr: f64 = avg_autocorr.iter().take_while(|&&ac| ac > 0.0).sum();
        result.insert(name.clone(), 1.0 + 2.0 * sum_autocorr);
    }

    Ok(result)
}

/// Effective sample size per parameter: total samples divided by τ.
pub fn effective_sample_size(chain: &Chain) -> Result<IndexMap<String, f64>> {
    let n_total = (chain.len() * chain.n_walkers()) as f64;
    Ok(autocorr_time(chain)?
        .into_iter()
        .map(|(name, tau)| (name, n_total / tau))
        .collect())
}
