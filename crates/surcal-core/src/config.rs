//! Calibration configuration.
//!
//! All settings of a calibration run live in one [`CalibrationConfig`]. It can
//! be built in code or loaded from TOML; missing keys take their defaults.
//!
//! ```toml
//! ndim = 2
//! nwalkers = 8
//! nsteps = 2000
//! target_value = 1.0
//! target_tolerance = 0.05
//! random_seed = 42
//! ```
//!
//! [`CalibrationConfig::validate`] checks every constraint up front, so an
//! invalid configuration is rejected before the predictor is ever called.

use crate::errors::{Error, Result};
use crate::parameter::{default_names, Bounds, ParameterSpace};
use crate::posterior::Target;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How posterior draws are picked for propagation through the predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationSampling {
    /// Each posterior sample is used at most once.
    #[default]
    WithoutReplacement,

    /// Samples are drawn independently and may repeat.
    WithReplacement,
}

/// Settings of a calibration run.
///
/// # Default Values
///
/// The defaults describe a 2-parameter calibration on the unit square with
/// 32 walkers, 2000 steps and half of the chain discarded as burn-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Number of calibrated parameters.
    /// Default: 2
    pub ndim: usize,

    /// Number of ensemble walkers. Must be even and at least `2 * (ndim + 1)`.
    /// Default: 32
    pub nwalkers: usize,

    /// Number of sampler steps.
    /// Default: 2000
    pub nsteps: usize,

    /// Fraction of the leading steps discarded as burn-in, in `[0, 1)`.
    /// `floor(nsteps * burn_in_fraction)` steps are dropped.
    /// Default: 0.5
    pub burn_in_fraction: f64,

    /// Parameter names. Defaults to `theta_0..theta_{ndim-1}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_names: Option<Vec<String>>,

    /// Per-parameter bounds, written as `[lo, hi]` pairs. Defaults to `[0, 1]` each.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_bounds: Option<Vec<Bounds>>,

    /// Desired value of the output metric.
    /// Default: 0.0
    pub target_value: f64,

    /// Standard deviation of the Gaussian likelihood.
    /// Default: 1.0
    pub target_tolerance: f64,

    /// Largest R-hat accepted as converged.
    /// Default: 1.1
    pub rhat_threshold: f64,

    /// Seed of the sampler's random number generator.
    ///
    /// Must not exceed `i64::MAX`, the largest integer TOML can represent.
    /// Default: 0
    pub random_seed: u64,

    /// Number of posterior draws passed through the predictor.
    /// Default: 1000
    pub n_propagation_samples: usize,

    /// Selection policy for propagation draws.
    /// Default: without replacement
    pub propagation_sampling: PropagationSampling,

    /// Stretch move scale `a`, must be greater than 1.
    /// Default: 2.0
    pub stretch_scale: f64,

    /// Lower and upper percentile of the reported credible intervals.
    /// Default: [2.5, 97.5]
    pub credible_percentiles: [f64; 2],

    /// Evaluate predictor calls in parallel. Covers both the proposals of a
    /// half-step and the propagation of posterior draws.
    /// Default: true
    pub parallel: bool,

    /// Size of a dedicated thread pool for sampling and propagation. Uses the
    /// global rayon pool when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<usize>,

    /// Write a checkpoint every N steps. 0 disables checkpointing.
    /// Default: 0
    pub checkpoint_every: usize,

    /// Base path of checkpoint files; `.state` and `.chain` are appended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ndim: 2,
            nwalkers: 32,
            nsteps: 2000,
            burn_in_fraction: 0.5,
            parameter_names: None,
            parameter_bounds: None,
            target_value: 0.0,
            target_tolerance: 1.0,
            rhat_threshold: 1.1,
            random_seed: 0,
            n_propagation_samples: 1000,
            propagation_sampling: PropagationSampling::default(),
            stretch_scale: 2.0,
            credible_percentiles: [2.5, 97.5],
            parallel: true,
            n_threads: None,
            checkpoint_every: 0,
            checkpoint_path: None,
        }
    }
}

fn invalid(msg: String) -> Error {
    Error::InvalidConfiguration(msg)
}

impl CalibrationConfig {
    /// Parse a configuration from a TOML string and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: CalibrationConfig = toml::from_str(contents)
            .map_err(|e| invalid(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            invalid(format!(
                "Failed to read configuration file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| invalid(format!("Failed to serialize configuration: {}", e)))
    }

    /// Number of leading steps discarded as burn-in.
    pub fn burn_in_steps(&self) -> usize {
        (self.nsteps as f64 * self.burn_in_fraction).floor() as usize
    }

    /// Number of steps kept after burn-in.
    pub fn retained_steps(&self) -> usize {
        self.nsteps.saturating_sub(self.burn_in_steps())
    }

    /// Number of flattened posterior samples after burn-in.
    pub fn pool_size(&self) -> usize {
        self.retained_steps() * self.nwalkers
    }

    /// Build the parameter space described by this configuration.
    pub fn parameter_space(&self) -> Result<ParameterSpace> {
        let names = self
            .parameter_names
            .clone()
            .unwrap_or_else(|| default_names(self.ndim));
        let bounds = self
            .parameter_bounds
            .clone()
            .unwrap_or_else(|| vec![Bounds::unit(); self.ndim]);
        ParameterSpace::new(names, bounds)
    }

    pub fn target(&self) -> Result<Target> {
        Target::new(self.target_value, self.target_tolerance)
    }

    /// Check every constraint on the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.ndim == 0 {
            return Err(invalid("ndim must be at least 1".to_string()));
        }

        let min_walkers = 2 * (self.ndim + 1);
        if self.nwalkers % 2 != 0 {
            return Err(invalid(format!(
                "nwalkers must be even, got {}",
                self.nwalkers
            )));
        }
        if self.nwalkers < min_walkers {
            return Err(invalid(format!(
                "nwalkers must be at least 2 * (ndim + 1) = {}, got {}",
                min_walkers, self.nwalkers
            )));
        }

        if self.nsteps == 0 {
            return Err(invalid("nsteps must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.burn_in_fraction) {
            return Err(invalid(format!(
                "burn_in_fraction must lie in [0, 1), got {}",
                self.burn_in_fraction
            )));
        }
        if self.retained_steps() < 2 {
            return Err(invalid(format!(
                "At least 2 steps must remain after burn-in; nsteps = {} with burn_in_fraction = {} keeps {}",
                self.nsteps,
                self.burn_in_fraction,
                self.retained_steps()
            )));
        }

        if let Some(names) = &self.parameter_names {
            if names.len() != self.ndim {
                return Err(invalid(format!(
                    "parameter_names has {} entries, expected ndim = {}",
                    names.len(),
                    self.ndim
                )));
            }
        }
        if let Some(bounds) = &self.parameter_bounds {
            if bounds.len() != self.ndim {
                return Err(invalid(format!(
                    "parameter_bounds has {} entries, expected ndim = {}",
                    bounds.len(),
                    self.ndim
                )));
            }
        }
        self.parameter_space()?;
        self.target()?;

        if self.random_seed > i64::MAX as u64 {
            return Err(invalid(format!(
                "random_seed must be at most {} to be representable in TOML, got {}",
                i64::MAX,
                self.random_seed
            )));
        }
        if !self.rhat_threshold.is_finite() || self.rhat_threshold <= 0.0 {
            return Err(invalid(format!(
                "rhat_threshold must be finite and positive, got {}",
                self.rhat_threshold
            )));
        }
        if !self.stretch_scale.is_finite() || self.stretch_scale <= 1.0 {
            return Err(invalid(format!(
                "stretch_scale must be greater than 1, got {}",
                self.stretch_scale
            )));
        }

        let [lo, hi] = self.credible_percentiles;
        if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo >= hi {
            return Err(invalid(format!(
                "credible_percentiles must satisfy 0 <= lo < hi <= 100, got [{}, {}]",
                lo, hi
            )));
        }

        if self.n_propagation_samples == 0 {
            return Err(invalid(
                "n_propagation_samples must be at least 1".to_string(),
            ));
        }
        if self.propagation_sampling == PropagationSampling::WithoutReplacement
            && self.n_propagation_samples > self.pool_size()
        {
            return Err(invalid(format!(
                "n_propagation_samples ({}) exceeds the {} posterior samples available for sampling without replacement",
                self.n_propagation_samples,
                self.pool_size()
            )));
        }

        if self.n_threads == Some(0) {
            return Err(invalid("n_threads must be at least 1".to_string()));
        }
        if self.checkpoint_every > 0 && self.checkpoint_path.is_none() {
            return Err(invalid(
                "checkpoint_path is required when checkpoint_every > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> CalibrationConfig {
        CalibrationConfig {
            ndim: 2,
            nwalkers: 8,
            nsteps: 100,
            n_propagation_samples: 50,
            ..Default::default()
        }
    }

    fn assert_invalid(config: CalibrationConfig, needle: &str) {
        match config.validate() {
            Err(Error::InvalidConfiguration(msg)) => {
                assert!(msg.contains(needle), "'{}' not in '{}'", needle, msg)
            }
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = CalibrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.burn_in_steps(), 1000);
        assert_eq!(config.retained_steps(), 1000);
        assert_eq!(config.pool_size(), 32_000);
    }

    #[test]
    fn test_burn_in_is_floored() {
        let config = CalibrationConfig {
            nsteps: 15,
            burn_in_fraction: 0.5,
            ..valid()
        };
        assert_eq!(config.burn_in_steps(), 7);
        assert_eq!(config.retained_steps(), 8);
    }

    #[test]
    fn test_walker_constraints() {
        assert_invalid(
            CalibrationConfig {
                nwalkers: 3,
                ..valid()
            },
            "even",
        );
        assert_invalid(
            CalibrationConfig {
                nwalkers: 4,
                ..valid()
            },
            "2 * (ndim + 1)",
        );
        CalibrationConfig {
            nwalkers: 6,
            ..valid()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_scalar_constraints() {
        assert_invalid(CalibrationConfig { ndim: 0, ..valid() }, "ndim");
        assert_invalid(CalibrationConfig { nsteps: 0, ..valid() }, "nsteps");
        assert_invalid(
            CalibrationConfig {
                burn_in_fraction: 1.0,
                ..valid()
            },
            "burn_in_fraction",
        );
        assert_invalid(
            CalibrationConfig {
                nsteps: 3,
                burn_in_fraction: 0.7,
                ..valid()
            },
            "remain after burn-in",
        );
        assert_invalid(
            CalibrationConfig {
                target_tolerance: 0.0,
                ..valid()
            },
            "tolerance",
        );
        assert_invalid(
            CalibrationConfig {
                rhat_threshold: f64::NAN,
                ..valid()
            },
            "rhat_threshold",
        );
        assert_invalid(
            CalibrationConfig {
                stretch_scale: 1.0,
                ..valid()
            },
            "stretch_scale",
        );
        assert_invalid(
            CalibrationConfig {
                credible_percentiles: [97.5, 2.5],
                ..valid()
            },
            "credible_percentiles",
        );
        assert_invalid(
            CalibrationConfig {
                n_threads: Some(0),
                ..valid()
            },
            "n_threads",
        );
        assert_invalid(
            CalibrationConfig {
                checkpoint_every: 10,
                ..valid()
            },
            "checkpoint_path",
        );
    }

    #[test]
    fn test_parameter_overrides() {
        assert_invalid(
            CalibrationConfig {
                parameter_names: Some(vec!["a".to_string()]),
                ..valid()
            },
            "parameter_names",
        );
        assert_invalid(
            CalibrationConfig {
                parameter_bounds: Some(vec![Bounds::unit(), Bounds { lo: 2.0, hi: 1.0 }]),
                ..valid()
            },
            "Lower bound",
        );

        let config = CalibrationConfig {
            parameter_names: Some(vec!["ecs".to_string(), "kappa".to_string()]),
            parameter_bounds: Some(vec![Bounds::unit(), Bounds::new(-1.0, 1.0).unwrap()]),
            ..valid()
        };
        let space = config.parameter_space().unwrap();
        assert_eq!(space.names(), &["ecs", "kappa"]);
        assert_eq!(space.bounds()[1], Bounds::new(-1.0, 1.0).unwrap());
    }

    #[test]
    fn test_propagation_pool_limit() {
        // 100 steps, half burn-in, 8 walkers: 400 samples in the pool
        assert_invalid(
            CalibrationConfig {
                n_propagation_samples: 401,
                ..valid()
            },
            "without replacement",
        );
        CalibrationConfig {
            n_propagation_samples: 400,
            ..valid()
        }
        .validate()
        .unwrap();
        CalibrationConfig {
            n_propagation_samples: 5000,
            propagation_sampling: PropagationSampling::WithReplacement,
            ..valid()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CalibrationConfig::from_toml_str(
            r#"
            ndim = 2
            nwalkers = 8
            target_value = 1.0
            target_tolerance = 0.05
            random_seed = 42
            parameter_bounds = [[0.0, 1.0], [0.0, 2.0]]
            propagation_sampling = "with_replacement"
            "#,
        )
        .unwrap();

        assert_eq!(config.nwalkers, 8);
        assert_eq!(config.nsteps, 2000);
        assert_eq!(config.rhat_threshold, 1.1);
        assert_eq!(config.random_seed, 42);
        assert_eq!(
            config.parameter_bounds.as_ref().unwrap()[1],
            Bounds::new(0.0, 2.0).unwrap()
        );
        assert_eq!(
            config.propagation_sampling,
            PropagationSampling::WithReplacement
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CalibrationConfig {
            parameter_names: Some(vec!["a".to_string(), "b".to_string()]),
            checkpoint_every: 10,
            checkpoint_path: Some(PathBuf::from("/tmp/run")),
            ..valid()
        };
        let serialized = config.to_toml_string().unwrap();
        let back = CalibrationConfig::from_toml_str(&serialized).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_random_seed_must_fit_toml_integer() {
        assert_invalid(
            CalibrationConfig {
                random_seed: i64::MAX as u64 + 1,
                ..valid()
            },
            "random_seed",
        );

        let largest = CalibrationConfig {
            random_seed: i64::MAX as u64,
            ..valid()
        };
        let serialized = largest.to_toml_string().unwrap();
        assert_eq!(CalibrationConfig::from_toml_str(&serialized).unwrap(), largest);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(matches!(
            CalibrationConfig::from_toml_str("nwalkers = \"many\""),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            CalibrationConfig::from_toml_str("nwalkers = 3"),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
