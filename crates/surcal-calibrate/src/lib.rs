//! Ensemble MCMC calibration against a scalar target
//!
//! - `sampler`: the affine-invariant stretch-move ensemble sampler
//! - `chain`: storage for the sampled ensemble
//! - `diagnostics`: Gelman-Rubin R-hat and autocorrelation estimates
//! - `summary`: marginal statistics and posterior predictive propagation
//! - `parallel`: batch evaluation on the calling thread or a rayon pool
//! - `pipeline`: the gated sample, check, summarize sequence

pub mod chain;
pub mod diagnostics;
pub mod parallel;
pub mod pipeline;
pub mod sampler;
pub mod summary;

pub use chain::Chain;
pub use diagnostics::{
    autocorr_time, check_convergence, effective_sample_size, gelman_rubin, ConvergenceReport,
    RhatVector,
};
pub use parallel::Parallelism;
pub use pipeline::{Calibration, CalibrationReport, ConvergedRun, SampledRun};
pub use sampler::{
    checkpoint_paths, EnsembleSampler, ProgressInfo, SamplerRun, SamplerState, StretchMove,
    WalkerInit,
};
pub use summary::{
    percentile, percentile_sorted, CredibleInterval, ParameterSummary, PosteriorSummarizer,
    PropagationSummary, Statistics,
};
