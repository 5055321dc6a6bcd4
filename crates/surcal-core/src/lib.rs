//! Core types for surrogate-based Bayesian calibration
//!
//! This crate holds everything the sampler needs to know about the problem:
//!
//! - `parameter`: the box-constrained parameter domain and its uniform prior
//! - `predictor`: the surrogate capability, `predict(theta) -> scalar`
//! - `posterior`: the log-posterior combining prior and Gaussian likelihood
//! - `config`: run configuration, loadable from TOML
//! - `errors`: the shared error type

pub mod config;
pub mod errors;
pub mod parameter;
pub mod posterior;
pub mod predictor;

pub use config::{CalibrationConfig, PropagationSampling};
pub use errors::{Error, Result};
pub use parameter::{Bounds, ParameterSpace};
pub use posterior::{Evaluation, Posterior, Target};
pub use predictor::{from_fn, FnPredictor, LinearSurrogate, Predictor};
