//! Bayesian calibration of normalised model parameters against a scalar target.
//!
//! A pre-trained surrogate maps a parameter vector in a box-constrained space
//! to a scalar output. `surcal` samples the posterior over parameters given
//! an observed target value, checks the chains have mixed, and reports
//! marginal credible intervals along with the implied distribution of the
//! output.
//!
//! ```
//! use surcal::{from_fn, Calibration, CalibrationConfig};
//!
//! let config = CalibrationConfig::from_toml_str(
//!     r#"
//!     ndim = 2
//!     nwalkers = 8
//!     nsteps = 400
//!     target_value = 1.0
//!     target_tolerance = 0.1
//!     random_seed = 7
//!     "#,
//! )
//! .unwrap();
//!
//! let calibration = Calibration::new(config, from_fn(|theta: &[f64]| theta[0] + theta[1])).unwrap();
//! let run = calibration.sample().unwrap();
//! assert_eq!(run.burn_in, 200);
//! ```

pub use surcal_calibrate as calibrate;
pub use surcal_core;

pub use surcal_calibrate::{
    Calibration, CalibrationReport, Chain, ConvergedRun, ConvergenceReport, EnsembleSampler,
    ParameterSummary, PosteriorSummarizer, PropagationSummary, RhatVector, SampledRun,
    WalkerInit,
};
pub use surcal_core::{
    from_fn, Bounds, CalibrationConfig, Error, LinearSurrogate, ParameterSpace, Posterior,
    Predictor, PropagationSampling, Result, Target,
};
