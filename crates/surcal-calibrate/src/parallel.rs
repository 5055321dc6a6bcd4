//! Concurrency settings for batches of evaluations.
//!
//! The sampler's posterior evaluations and the propagation of posterior draws
//! through the predictor both go through a [`Parallelism`], so the
//! `parallel` and `n_threads` settings bound every batch of predictor calls.

use rayon::prelude::*;
use surcal_core::{Error, Predictor, Result};

/// How a batch of independent evaluations is executed.
#[derive(Debug, Default)]
pub struct Parallelism {
    sequential: bool,
    pool: Option<rayon::ThreadPool>,
}

impl Parallelism {
    /// Build from the `parallel` flag and optional thread bound.
    ///
    /// # Arguments
    ///
    /// * `parallel` - Evaluate on rayon threads; `false` keeps every call on the calling thread
    /// * `n_threads` - Size of a dedicated pool; `None` uses the global rayon pool.
    ///   Ignored when `parallel` is `false`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] for `Some(0)` threads or if the pool
    /// cannot be built.
    pub fn new(parallel: bool, n_threads: Option<usize>) -> Result<Self> {
        let pool = match n_threads {
            Some(0) => {
                return Err(Error::InvalidConfiguration(
                    "Thread pool must have at least one thread".to_string(),
                ))
            }
            Some(n) if parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| {
                        Error::InvalidConfiguration(format!("Failed to build thread pool: {}", e))
                    })?,
            ),
            _ => None,
        };
        Ok(Self {
            sequential: !parallel,
            pool,
        })
    }

    /// Evaluate everything on the calling thread.
    pub fn sequential() -> Self {
        Self {
            sequential: true,
            pool: None,
        }
    }

    pub fn is_parallel(&self) -> bool {
        !self.sequential
    }

    /// Number of threads in the dedicated pool, if one was built.
    pub fn pool_threads(&self) -> Option<usize> {
        self.pool.as_ref().map(rayon::ThreadPool::current_num_threads)
    }

    /// Apply `f` to every item, preserving order.
    pub fn map<T, U, F>(&self, items: &[T], f: F) -> Vec<U>
    where
        T: Sync,
        U: Send,
        F: Fn(&T) -> U + Sync,
    {
        if self.sequential {
            return items.iter().map(f).collect();
        }

        let evaluate = || items.par_iter().map(&f).collect::<Vec<_>>();
        match &self.pool {
            Some(pool) => pool.install(evaluate),
            None => evaluate(),
        }
    }

    /// Predict for every parameter vector, preserving order.
    ///
    /// In parallel mode this defers to [`Predictor::predict_batch`], run
    /// inside the dedicated pool when there is one.
    pub fn predict_batch<P>(&self, predictor: &P, thetas: &[Vec<f64>]) -> Vec<Result<f64>>
    where
        P: Predictor + ?Sized,
    {
        if self.sequential {
            return thetas.iter().map(|theta| predictor.predict(theta)).collect();
        }

        match &self.pool {
            Some(pool) => pool.install(|| predictor.predict_batch(thetas)),
            None => predictor.predict_batch(thetas),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    struct ThreadRecorder {
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Predictor for ThreadRecorder {
        fn predict(&self, theta: &[f64]) -> Result<f64> {
            self.threads.lock().unwrap().push(thread::current().id());
            Ok(theta.iter().sum())
        }
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            Parallelism::new(true, Some(0)),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_pool_only_built_when_parallel() {
        assert_eq!(Parallelism::new(true, Some(2)).unwrap().pool_threads(), Some(2));
        assert_eq!(Parallelism::new(false, Some(2)).unwrap().pool_threads(), None);
        assert!(!Parallelism::new(false, None).unwrap().is_parallel());
        assert!(Parallelism::default().is_parallel());
    }

    #[test]
    fn test_map_preserves_order() {
        let items: Vec<usize> = (0..64).collect();
        let expected: Vec<usize> = items.iter().map(|i| i * 2).collect();

        for parallelism in [
            Parallelism::sequential(),
            Parallelism::default(),
            Parallelism::new(true, Some(3)).unwrap(),
        ] {
            assert_eq!(parallelism.map(&items, |i| i * 2), expected);
        }
    }

    #[test]
    fn test_map_runs_inside_dedicated_pool() {
        let parallelism = Parallelism::new(true, Some(2)).unwrap();
        let sizes = parallelism.map(&[0usize; 8][..], |_| rayon::current_num_threads());
        assert!(sizes.iter().all(|&n| n == 2));
    }

    #[test]
    fn test_sequential_predictions_stay_on_calling_thread() {
        let recorder = ThreadRecorder {
            threads: Mutex::new(Vec::new()),
        };
        let thetas: Vec<Vec<f64>> = (0..32).map(|i| vec![i as f64, 1.0]).collect();

        let outcomes = Parallelism::sequential().predict_batch(&recorder, &thetas);

        assert_eq!(outcomes.len(), 32);
        assert_eq!(*outcomes[5].as_ref().unwrap(), 6.0);
        let threads = recorder.threads.lock().unwrap();
        assert_eq!(threads.len(), 32);
        assert!(threads.iter().all(|&id| id == thread::current().id()));
    }
}
