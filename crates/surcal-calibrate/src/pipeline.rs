//! The gated calibration pipeline.
//!
//! Wires the pieces together in a fixed order:
//!
//! 1. validate the configuration and check the predictor is available
//! 2. run the ensemble sampler and trim burn-in once
//! 3. gate on the Gelman-Rubin diagnostic
//! 4. summarize the approved chain and propagate it through the predictor
//!
//! Each stage returns a distinct type. Only a [`ConvergedRun`] can be
//! summarized, and one can only be obtained from a diagnostic that passed.

use crate::chain::Chain;
use crate::diagnostics::{autocorr_time, check_convergence, effective_sample_size, RhatVector};
use crate::parallel::Parallelism;
use crate::sampler::{EnsembleSampler, ProgressInfo, SamplerState, WalkerInit};
use crate::summary::{ParameterSummary, PosteriorSummarizer, PropagationSummary};
use indexmap::IndexMap;
use ndarray::Array1;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use surcal_core::{
    CalibrationConfig, Error, ParameterSpace, Posterior, Predictor, Result, Target,
};
use tracing::{info, warn};

/// Stream of the generator used to pick propagation draws.
const PROPAGATION_STREAM: u64 = 1;

/// A finished sampling run with burn-in removed.
#[derive(Debug, Clone)]
pub struct SampledRun {
    /// Full chain including burn-in
    pub chain: Chain,

    /// Chain with the first `burn_in` steps removed
    pub trimmed: Chain,

    /// Number of discarded steps
    pub burn_in: usize,

    /// Final sampler state
    pub state: SamplerState,
}

impl SampledRun {
    fn new(chain: Chain, state: SamplerState, burn_in: usize) -> Self {
        let trimmed = chain.discard(burn_in);
        Self {
            chain,
            trimmed,
            burn_in,
            state,
        }
    }

    /// Gate the run on the Gelman-Rubin diagnostic of the trimmed chain.
    ///
    /// # Errors
    ///
    /// [`Error::NonConvergence`] if any R-hat exceeds `threshold`, and the
    /// errors of [`crate::diagnostics::gelman_rubin`].
    pub fn check_convergence(self, threshold: f64) -> Result<ConvergedRun> {
        let report = check_convergence(&self.trimmed, threshold)?;
        if !report.converged {
            warn!(
                threshold,
                offending = ?report.offending(),
                "Chain did not converge"
            );
        }
        let report = report.into_result()?;

        Ok(ConvergedRun {
            run: self,
            rhat: report.rhat,
            threshold,
        })
    }
}

/// A sampling run whose trimmed chain passed the convergence check.
#[derive(Debug, Clone)]
pub struct ConvergedRun {
    run: SampledRun,
    rhat: RhatVector,
    threshold: f64,
}

impl ConvergedRun {
    pub fn trimmed(&self) -> &Chain {
        &self.run.trimmed
    }

    pub fn rhat(&self) -> &RhatVector {
        &self.rhat
    }

    pub fn sampled(&self) -> &SampledRun {
        &self.run
    }

    /// Summarize the trimmed chain and propagate it through `predictor`.
    pub fn summarize<P: Predictor + ?Sized>(
        self,
        predictor: &P,
        config: &CalibrationConfig,
    ) -> Result<CalibrationReport> {
        let summarizer = PosteriorSummarizer::new(config.credible_percentiles)?;
        let trimmed = self.run.trimmed;

        let parameters = summarizer.summarize(&trimmed)?;

        let mut rng = ChaCha8Rng::seed_from_u64(config.random_seed);
        rng.set_stream(PROPAGATION_STREAM);
        let parallelism = Parallelism::new(config.parallel, config.n_threads)?;
        let output = summarizer.propagate_with(
            &summarizer.flatten(&trimmed),
            predictor,
            config.n_propagation_samples,
            config.propagation_sampling,
            &mut rng,
            &parallelism,
        )?;

        Ok(CalibrationReport {
            burn_in: self.run.burn_in,
            rhat: self.rhat,
            rhat_threshold: self.threshold,
            converged: true,
            parameters,
            output,
            acceptance_fraction: self.run.state.acceptance_fraction(),
            mean_acceptance_rate: self.run.state.mean_acceptance_rate(),
            degraded_steps: self.run.state.degraded_steps,
            autocorr_time: autocorr_time(&trimmed).ok(),
            effective_sample_size: effective_sample_size(&trimmed).ok(),
            trimmed,
        })
    }
}

/// Result of a complete calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Chain after burn-in removal
    pub trimmed: Chain,
    pub burn_in: usize,

    pub rhat: RhatVector,
    pub rhat_threshold: f64,
    pub converged: bool,

    /// Marginal summary per parameter, in parameter order
    pub parameters: Vec<ParameterSummary>,

    /// Output metric over propagated posterior draws
    pub output: PropagationSummary,

    pub acceptance_fraction: Array1<f64>,
    pub mean_acceptance_rate: f64,
    pub degraded_steps: usize,

    /// Integrated autocorrelation time, when the trimmed chain is long enough
    pub autocorr_time: Option<IndexMap<String, f64>>,
    pub effective_sample_size: Option<IndexMap<String, f64>>,
}

impl CalibrationReport {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSummary> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Calibration of a predictor against a scalar target.
///
/// # Example
///
/// ```
/// use surcal_calibrate::Calibration;
/// use surcal_core::{from_fn, CalibrationConfig};
///
/// let config = CalibrationConfig {
///     ndim: 2,
///     nwalkers: 8,
///     nsteps: 500,
///     target_value: 1.0,
///     target_tolerance: 0.1,
///     random_seed: 42,
///     n_propagation_samples: 200,
///     ..Default::default()
/// };
/// let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);
///
/// let calibration = Calibration::new(config, predictor).unwrap();
/// let run = calibration.sample().unwrap();
/// assert_eq!(run.trimmed.len(), 250);
/// ```
pub struct Calibration<P: Predictor> {
    config: CalibrationConfig,
    space: ParameterSpace,
    target: Target,
    predictor: P,
}

impl<P: Predictor> Calibration<P> {
    /// Validate `config` and check that `predictor` is usable.
    ///
    /// The configuration is checked before the predictor is touched.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] or [`Error::PredictorUnavailable`].
    pub fn new(config: CalibrationConfig, predictor: P) -> Result<Self> {
        config.validate()?;
        let space = config.parameter_space()?;
        let target = config.target()?;
        predictor.check_available()?;

        Ok(Self {
            config,
            space,
            target,
            predictor,
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    fn sampler(&self) -> Result<EnsembleSampler<'_, P>> {
        let posterior = Posterior::new(&self.space, &self.predictor, self.target);
        EnsembleSampler::new(posterior, self.config.nwalkers)?
            .with_stretch_scale(self.config.stretch_scale)?
            .with_parallelism(self.config.parallel, self.config.n_threads)
    }

    /// Run the sampler and trim burn-in.
    pub fn sample(&self) -> Result<SampledRun> {
        self.sample_inner(None::<fn(&ProgressInfo)>)
    }

    /// Run the sampler with a callback invoked after every step.
    pub fn sample_with_progress<F>(&self, progress_callback: F) -> Result<SampledRun>
    where
        F: FnMut(&ProgressInfo),
    {
        self.sample_inner(Some(progress_callback))
    }

    fn sample_inner<F>(&self, progress_callback: Option<F>) -> Result<SampledRun>
    where
        F: FnMut(&ProgressInfo),
    {
        let config = &self.config;
        info!(
            ndim = config.ndim,
            nwalkers = config.nwalkers,
            nsteps = config.nsteps,
            seed = config.random_seed,
            "Starting ensemble sampling"
        );

        let sampler = self.sampler()?;
        let state = sampler.initial_state(&WalkerInit::FromPrior, config.random_seed)?;
        let chain = Chain::new(state.param_names.clone(), config.nwalkers);
        let checkpoint_path = config
            .checkpoint_path
            .as_deref()
            .filter(|_| config.checkpoint_every > 0);

        let run = sampler.run_from_state(
            state,
            chain,
            config.nsteps,
            config.checkpoint_every,
            checkpoint_path,
            progress_callback,
        )?;
        Ok(self.finish_sampling(run.chain, run.state))
    }

    /// Continue a checkpointed run until it holds `nsteps` steps.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] without a `checkpoint_path` or when the
    /// checkpoint already holds more than `nsteps` steps, and the checkpoint
    /// errors of [`EnsembleSampler::resume_from_checkpoint`].
    pub fn resume(&self) -> Result<SampledRun> {
        let path = self.config.checkpoint_path.as_ref().ok_or_else(|| {
            Error::InvalidConfiguration("Resuming requires checkpoint_path".to_string())
        })?;

        let run = self.sampler()?.resume_from_checkpoint(
            self.config.nsteps,
            self.config.checkpoint_every,
            path,
            None::<fn(&ProgressInfo)>,
        )?;
        Ok(self.finish_sampling(run.chain, run.state))
    }

    fn finish_sampling(&self, chain: Chain, state: SamplerState) -> SampledRun {
        let burn_in = self.config.burn_in_steps();
        info!(
            steps = chain.len(),
            burn_in,
            acceptance_rate = state.mean_acceptance_rate(),
            degraded_steps = state.degraded_steps,
            "Finished ensemble sampling"
        );
        SampledRun::new(chain, state, burn_in)
    }

    /// Gate `run` on the configured R-hat threshold.
    pub fn check_convergence(&self, run: SampledRun) -> Result<ConvergedRun> {
        run.check_convergence(self.config.rhat_threshold)
    }

    /// Summarize a converged run.
    pub fn summarize(&self, run: ConvergedRun) -> Result<CalibrationReport> {
        let report = run.summarize(&self.predictor, &self.config)?;
        info!(
            output_mean = report.output.stats.mean,
            output_lower = report.output.stats.interval.lower,
            output_upper = report.output.stats.interval.upper,
            "Calibration complete"
        );
        Ok(report)
    }

    /// Sample, check convergence and summarize.
    pub fn run(&self) -> Result<CalibrationReport> {
        let sampled = self.sample()?;
        let converged = self.check_convergence(sampled)?;
        self.summarize(converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::checkpoint_paths;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use surcal_core::{from_fn, LinearSurrogate};

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            ndim: 2,
            nwalkers: 8,
            nsteps: 400,
            target_value: 1.0,
            target_tolerance: 0.1,
            random_seed: 3,
            n_propagation_samples: 100,
            ..Default::default()
        }
    }

    struct Counting {
        calls: AtomicUsize,
    }

    impl Predictor for Counting {
        fn predict(&self, theta: &[f64]) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(theta.iter().sum())
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_predictor_use() {
        let predictor = Counting {
            calls: AtomicUsize::new(0),
        };
        let bad = CalibrationConfig {
            nwalkers: 3,
            ..config()
        };
        assert!(matches!(
            Calibration::new(bad, &predictor),
            Err(Error::InvalidConfiguration(_))
        ));
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_predictor_rejected() {
        let empty = LinearSurrogate::new(0.0, vec![]);
        assert!(matches!(
            Calibration::new(config(), empty),
            Err(Error::PredictorUnavailable(_))
        ));
    }

    #[test]
    fn test_sample_trims_burn_in_once() {
        let calibration =
            Calibration::new(config(), from_fn(|theta: &[f64]| theta[0] + theta[1])).unwrap();
        let run = calibration.sample().unwrap();

        assert_eq!(run.chain.len(), 400);
        assert_eq!(run.burn_in, 200);
        assert_eq!(run.trimmed.len(), 200);
        assert_eq!(run.trimmed.step(0), run.chain.step(200));
    }

    fn separated_run() -> SampledRun {
        // Walkers oscillate around well separated centres
        let names = vec!["x".to_string()];
        let mut chain = Chain::new(names.clone(), 4);
        for step in 0..40 {
            let jitter = if step % 2 == 0 { 0.01 } else { -0.01 };
            let positions =
                ndarray::Array2::from_shape_fn((4, 1), |(w, _)| 0.1 + 0.2 * w as f64 + jitter);
            chain.push(positions, Array1::zeros(4)).unwrap();
        }
        let state = SamplerState::new(
            ndarray::Array2::zeros((4, 1)),
            names,
            ChaCha8Rng::seed_from_u64(0),
        )
        .unwrap();
        SampledRun::new(chain, state, 20)
    }

    #[test]
    fn test_non_convergence_is_an_error_value() {
        let run = separated_run();
        assert_eq!(run.trimmed.len(), 20);

        match run.check_convergence(1.1) {
            Err(Error::NonConvergence {
                threshold,
                offending,
            }) => {
                assert_eq!(threshold, 1.1);
                assert_eq!(offending.len(), 1);
                assert_eq!(offending[0].0, "x");
                assert!(offending[0].1 > 1.1);
            }
            Err(other) => panic!("expected non-convergence, got {}", other),
            Ok(_) => panic!("expected non-convergence"),
        }
    }

    #[test]
    fn test_lenient_threshold_admits_run() {
        let converged = separated_run().check_convergence(f64::INFINITY).unwrap();
        assert_eq!(converged.trimmed().len(), 20);
        assert!(converged.rhat().get("x").unwrap() > 1.1);
    }

    #[test]
    fn test_run_produces_report() {
        let calibration = Calibration::new(
            CalibrationConfig {
                nsteps: 3000,
                ..config()
            },
            from_fn(|theta: &[f64]| theta[0] + theta[1]),
        )
        .unwrap();
        let report = calibration.run().unwrap();

        assert!(report.converged);
        assert_eq!(report.parameters.len(), 2);
        assert_eq!(report.trimmed.len(), 1500);
        assert_eq!(report.output.predictions.len(), 100);
        assert!(report.parameter("theta_0").is_some());
        assert!(report.autocorr_time.is_some());
        assert_eq!(report.acceptance_fraction.len(), 8);
        assert!((report.output.stats.mean - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_checkpointed_sample_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("calibration");
        let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);

        let short = CalibrationConfig {
            nsteps: 100,
            checkpoint_every: 50,
            checkpoint_path: Some(base.clone()),
            ..config()
        };
        let long = CalibrationConfig {
            nsteps: 200,
            ..short.clone()
        };

        Calibration::new(short, &predictor).unwrap().sample().unwrap();
        let (state_path, chain_path) = checkpoint_paths(&base);
        assert!(state_path.exists() && chain_path.exists());

        let resumed = Calibration::new(long.clone(), &predictor)
            .unwrap()
            .resume()
            .unwrap();
        let uninterrupted = Calibration::new(
            CalibrationConfig {
                checkpoint_every: 0,
                checkpoint_path: None,
                ..long
            },
            &predictor,
        )
        .unwrap()
        .sample()
        .unwrap();

        assert_eq!(resumed.chain, uninterrupted.chain);
        assert_eq!(resumed.burn_in, 100);
    }

    #[test]
    fn test_resume_rejects_checkpoint_longer_than_nsteps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("calibration");
        let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);

        let long = CalibrationConfig {
            nsteps: 200,
            checkpoint_every: 50,
            checkpoint_path: Some(base),
            ..config()
        };
        let short = CalibrationConfig {
            nsteps: 50,
            ..long.clone()
        };

        Calibration::new(long, &predictor).unwrap().sample().unwrap();
        assert!(matches!(
            Calibration::new(short, &predictor).unwrap().resume(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_sequential_setting_covers_propagation() {
        struct ThreadRecorder {
            threads: Mutex<Vec<ThreadId>>,
        }

        impl Predictor for ThreadRecorder {
            fn predict(&self, theta: &[f64]) -> Result<f64> {
                self.threads.lock().unwrap().push(thread::current().id());
                Ok(theta[0] + theta[1])
            }
        }

        let recorder = ThreadRecorder {
            threads: Mutex::new(Vec::new()),
        };
        let sequential = CalibrationConfig {
            nsteps: 3000,
            parallel: false,
            ..config()
        };
        let report = Calibration::new(sequential, &recorder).unwrap().run().unwrap();

        assert_eq!(report.output.predictions.len(), 100);
        let threads = recorder.threads.lock().unwrap();
        assert!(threads.iter().all(|&id| id == thread::current().id()));
    }

    #[test]
    fn test_resume_requires_checkpoint_path() {
        let calibration =
            Calibration::new(config(), from_fn(|theta: &[f64]| theta[0] + theta[1])).unwrap();
        assert!(matches!(
            calibration.resume(),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
