use thiserror::Error;

/// Error type for the calibration pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value violates a constraint. Detected before any sampling starts.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The predictor produced no usable value where one was required.
    #[error("Non-finite evaluation: {0}")]
    NonFiniteEvaluation(String),

    /// Within-chain variance is zero, so the Gelman-Rubin statistic is undefined.
    #[error("Within-chain variance of parameter '{name}' (dimension {dimension}) is zero; R-hat is undefined")]
    DegenerateVariance { dimension: usize, name: String },

    /// One or more R-hat values exceed the convergence threshold.
    #[error("Chain has not converged: R-hat above {threshold} for {}", format_offending(.offending))]
    NonConvergence {
        threshold: f64,
        offending: Vec<(String, f64)>,
    },

    /// The predictor cannot be used at all.
    #[error("Predictor unavailable: {0}")]
    PredictorUnavailable(String),

    #[error("Insufficient samples: {0}")]
    InsufficientSamples(String),

    /// Error returned by a predictor for a single candidate.
    #[error("Prediction failed: {0}")]
    Prediction(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

fn format_offending(offending: &[(String, f64)]) -> String {
    offending
        .iter()
        .map(|(name, r_hat)| format!("{}={:.4}", name, r_hat))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience type for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_convergence_message_lists_dimensions() {
        let err = Error::NonConvergence {
            threshold: 1.1,
            offending: vec![("theta_0".to_string(), 1.25), ("theta_1".to_string(), 1.5)],
        };
        let message = err.to_string();
        assert!(message.contains("theta_0=1.2500"), "{}", message);
        assert!(message.contains("theta_1=1.5000"), "{}", message);
        assert!(message.contains("1.1"), "{}", message);
    }
}
