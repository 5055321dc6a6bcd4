//! Affine-invariant ensemble sampler (emcee algorithm).
//!
//! Implements the Goodman & Weare (2010) stretch move. An ensemble of walkers
//! explores the posterior together: each walker proposes a move along the line
//! through its own position and that of a walker from the complementary half
//! of the ensemble, which makes the sampler invariant under affine
//! reparameterisation of the parameter space.
//!
//! All randomness flows from one seeded [`ChaCha8Rng`] stored in the
//! [`SamplerState`]. For each half-step the proposals are drawn first, the
//! posterior is then evaluated (possibly in parallel), and the acceptance
//! uniforms are drawn last. Parallel evaluation therefore never changes the
//! random stream, and equal seeds give bit-identical chains.
//!
//! # References
//!
//! Goodman, J., & Weare, J. (2010). Ensemble samplers with affine invariance.
//! Communications in Applied Mathematics and Computational Science, 5(1), 65-80.

use crate::chain::{read_bincode, write_bincode, Chain};
use crate::parallel::Parallelism;
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use surcal_core::{Error, Evaluation, ParameterSpace, Posterior, Predictor, Result};
use tracing::{debug, warn};

/// Information about sampling progress.
///
/// Passed to progress callbacks after every step.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current step number (0-indexed, counted over the whole chain)
    pub iteration: usize,

    /// Total number of steps the chain will hold
    pub total: usize,

    /// Mean acceptance rate across all walkers
    pub acceptance_rate: f64,

    /// Mean log probability across all walkers
    pub mean_log_prob: f64,
}

/// State of the ensemble sampler between steps.
///
/// Contains everything needed to continue a run exactly where it stopped,
/// including the random number generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerState {
    /// Current positions of walkers: shape (n_walkers, n_params)
    pub positions: Array2<f64>,

    /// Log probabilities at current positions: shape (n_walkers,)
    pub log_probs: Array1<f64>,

    /// Total number of proposals accepted for each walker
    pub n_accepted: Array1<usize>,

    /// Total number of proposals made for each walker
    pub n_proposed: Array1<usize>,

    /// Parameter names in the order they appear in position vectors
    pub param_names: Vec<String>,

    /// Generator all proposals and acceptance draws come from
    pub rng: ChaCha8Rng,

    /// Number of completed steps
    pub iterations: usize,

    /// Number of steps in which every proposal evaluated to a non-finite value
    pub degraded_steps: usize,
}

impl SamplerState {
    /// Create a state from initial positions.
    ///
    /// # Arguments
    ///
    /// * `positions` - Initial walker positions, shape (n_walkers, n_params)
    /// * `param_names` - Names of parameters in order
    /// * `rng` - Generator that drives every subsequent proposal
    ///
    /// # Returns
    ///
    /// A state with log probabilities at negative infinity (filled in by the
    /// sampler) and zero acceptance counts.
    pub fn new(positions: Array2<f64>, param_names: Vec<String>, rng: ChaCha8Rng) -> Result<Self> {
        let (n_walkers, n_params) = positions.dim();

        if param_names.len() != n_params {
            return Err(Error::InvalidConfiguration(format!(
                "Number of parameter names ({}) does not match positions dimension ({})",
                param_names.len(),
                n_params
            )));
        }
        if n_walkers < 2 {
            return Err(Error::InvalidConfiguration(
                "Must have at least 2 walkers for ensemble sampling".to_string(),
            ));
        }

        Ok(Self {
            positions,
            log_probs: Array1::from_elem(n_walkers, f64::NEG_INFINITY),
            n_accepted: Array1::zeros(n_walkers),
            n_proposed: Array1::zeros(n_walkers),
            param_names,
            rng,
            iterations: 0,
            degraded_steps: 0,
        })
    }

    pub fn n_walkers(&self) -> usize {
        self.positions.nrows()
    }

    pub fn n_params(&self) -> usize {
        self.positions.ncols()
    }

    /// Acceptance fraction of each walker; 0.0 for walkers without proposals.
    pub fn acceptance_fraction(&self) -> Array1<f64> {
        self.n_accepted
            .iter()
            .zip(self.n_proposed.iter())
            .map(|(&accepted, &proposed)| {
                if proposed > 0 {
                    accepted as f64 / proposed as f64
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Mean acceptance rate across all walkers.
    pub fn mean_acceptance_rate(&self) -> f64 {
        let total_accepted: usize = self.n_accepted.iter().sum();
        let total_proposed: usize = self.n_proposed.iter().sum();

        if total_proposed > 0 {
            total_accepted as f64 / total_proposed as f64
        } else {
            0.0
        }
    }

    /// Save the sampler state to a bincode checkpoint file.
    ///
    /// The file is written to `{path}.tmp` and renamed into place, so an
    /// interrupted save leaves the previous checkpoint intact.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the checkpoint file to create or replace
    ///
    /// # Returns
    ///
    /// `Ok(())` on success, [`Error::Checkpoint`] if serialization or file
    /// writing fails.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_bincode(self, path.as_ref(), "checkpoint")
    }

    /// Load a sampler state written by [`SamplerState::save_checkpoint`].
    ///
    /// # Arguments
    ///
    /// * `path` - Path to an existing checkpoint file
    ///
    /// # Returns
    ///
    /// The restored state, including the random generator, or
    /// [`Error::Checkpoint`] if the file is missing or cannot be decoded.
    pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_bincode(path.as_ref(), "checkpoint")
    }
}

/// Paths of the state and chain files belonging to a checkpoint base path.
pub fn checkpoint_paths<P: AsRef<Path>>(base: P) -> (PathBuf, PathBuf) {
    let base = base.as_ref().display();
    (
        PathBuf::from(format!("{}.state", base)),
        PathBuf::from(format!("{}.chain", base)),
    )
}

/// Configuration for the stretch move proposal.
///
/// The scale parameter `a` bounds the stretch factor to `[1/a, a]`. The
/// default of 2.0 is the value recommended by Goodman & Weare (2010).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchMove {
    /// Scale parameter for the stretch move
    pub a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    /// Create a stretch move with scale `a`, which must be finite and greater than 1.
    pub fn new(a: f64) -> Result<Self> {
        if !a.is_finite() || a <= 1.0 {
            return Err(Error::InvalidConfiguration(format!(
                "Stretch move scale parameter must be > 1.0, got {}",
                a
            )));
        }
        Ok(Self { a })
    }

    /// Sample a stretch factor from g(z) ∝ 1/sqrt(z) on `[1/a, a]`.
    ///
    /// Uses the inverse transform z = ((a-1)u + 1)^2 / a with u ~ Uniform(0, 1).
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    /// Acceptance probability for a stretch move proposal.
    ///
    /// min(1, z^(n_params - 1) * exp(log_prob_new - log_prob_old))
    ///
    /// # Arguments
    ///
    /// * `z` - Stretch factor used for the proposal
    /// * `n_params` - Number of parameters (dimensionality)
    /// * `log_prob_old` - Log posterior at the current position
    /// * `log_prob_new` - Log posterior at the proposed position
    ///
    /// # Returns
    ///
    /// Acceptance probability in [0, 1]. A non-finite `log_prob_new` gives 0.
    pub fn acceptance_probability(
        &self,
        z: f64,
        n_params: usize,
        log_prob_old: f64,
        log_prob_new: f64,
    ) -> f64 {
        if !log_prob_new.is_finite() {
            return 0.0;
        }

        let log_ratio = (n_params as f64 - 1.0) * z.ln() + (log_prob_new - log_prob_old);
        log_ratio.exp().min(1.0)
    }

    /// Propose a move for the walker at `current_pos`.
    ///
    /// The proposal is y = c + z * (x - c), where:
    /// - x is the current walker position
    /// - c is a partner drawn uniformly from the complementary half
    /// - z is a stretch factor from [`StretchMove::sample_z`]
    ///
    /// The partner index is drawn before z.
    ///
    /// # Arguments
    ///
    /// * `rng` - Random number generator
    /// * `current_pos` - Current position of the walker
    /// * `complementary_positions` - Positions of the walkers in the complementary half
    ///
    /// # Returns
    ///
    /// Tuple of (proposed_position, stretch_factor)
    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        current_pos: ArrayView1<f64>,
        complementary_positions: &Array2<f64>,
    ) -> (Array1<f64>, f64) {
        let partner_idx = rng.gen_range(0..complementary_positions.nrows());
        let z = self.sample_z(rng);

        let partner = complementary_positions.row(partner_idx);
        let proposal = &partner + &((&current_pos - &partner) * z);

        (proposal, z)
    }
}

/// Walker initialization strategy.
#[derive(Debug, Clone, Default)]
pub enum WalkerInit {
    /// Draw walkers uniformly from the parameter bounds
    #[default]
    FromPrior,

    /// Caller-provided positions, shape (n_walkers, n_params)
    Explicit(Array2<f64>),
}

impl WalkerInit {
    /// Produce initial walker positions.
    ///
    /// Positions are always inside the bounds and pairwise distinct.
    pub fn initialize<R: Rng + ?Sized>(
        &self,
        n_walkers: usize,
        space: &ParameterSpace,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        match self {
            WalkerInit::FromPrior => space.sample_uniform(n_walkers, rng),
            WalkerInit::Explicit(positions) => {
                if positions.dim() != (n_walkers, space.ndim()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "Explicit positions have shape {:?}, expected ({}, {})",
                        positions.dim(),
                        n_walkers,
                        space.ndim()
                    )));
                }
                for (i, row) in positions.outer_iter().enumerate() {
                    if !space.contains(&row.to_vec()) {
                        return Err(Error::InvalidConfiguration(format!(
                            "Explicit position of walker {} lies outside the parameter bounds",
                            i
                        )));
                    }
                    if let Some(k) = (0..i).find(|&k| positions.row(k) == row) {
                        return Err(Error::InvalidConfiguration(format!(
                            "Walkers {} and {} start at the same position",
                            k, i
                        )));
                    }
                }
                Ok(positions.clone())
            }
        }
    }
}

/// Output of a sampling run: the final state and the chain it produced.
#[derive(Debug, Clone)]
pub struct SamplerRun {
    pub state: SamplerState,
    pub chain: Chain,
}

/// Affine-invariant ensemble sampler over a [`Posterior`].
///
/// Each step updates the first half of the ensemble against the second,
/// then the second half against the already updated first half, and appends
/// the ensemble to the chain. Posterior evaluations within a half run in
/// parallel through rayon, optionally on a dedicated thread pool.
///
/// # Example
///
/// ```
/// use surcal_calibrate::sampler::{EnsembleSampler, WalkerInit};
/// use surcal_core::{from_fn, ParameterSpace, Posterior, Target};
///
/// let space = ParameterSpace::unit_hypercube(2).unwrap();
/// let predictor = from_fn(|theta: &[f64]| theta[0] + theta[1]);
/// let posterior = Posterior::new(&space, &predictor, Target::new(1.0, 0.1).unwrap());
///
/// let sampler = EnsembleSampler::new(posterior, 8).unwrap();
/// let run = sampler.run(50, WalkerInit::FromPrior, 42).unwrap();
/// assert_eq!(run.chain.len(), 50);
/// ```
pub struct EnsembleSampler<'a, P: Predictor + ?Sized> {
    posterior: Posterior<'a, P>,
    stretch: StretchMove,
    n_walkers: usize,
    parallelism: Parallelism,
}

impl<'a, P: Predictor + ?Sized> EnsembleSampler<'a, P> {
    /// Create a sampler with `n_walkers` walkers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] unless `n_walkers` is even and at
    /// least `2 * (n_params + 1)`.
    pub fn new(posterior: Posterior<'a, P>, n_walkers: usize) -> Result<Self> {
        let min_walkers = 2 * (posterior.ndim() + 1);
        if n_walkers % 2 != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "Number of walkers must be even, got {}",
                n_walkers
            )));
        }
        if n_walkers < min_walkers {
            return Err(Error::InvalidConfiguration(format!(
                "Number of walkers must be at least 2 * (n_params + 1) = {}, got {}",
                min_walkers, n_walkers
            )));
        }

        Ok(Self {
            posterior,
            stretch: StretchMove::default(),
            n_walkers,
            parallelism: Parallelism::default(),
        })
    }

    /// Use a custom stretch move scale.
    pub fn with_stretch_scale(mut self, a: f64) -> Result<Self> {
        self.stretch = StretchMove::new(a)?;
        Ok(self)
    }

    /// Control parallel evaluation.
    ///
    /// With `parallel = false` proposals are evaluated sequentially on the
    /// calling thread. `n_threads` bounds the evaluation concurrency with a
    /// dedicated pool; `None` uses the global rayon pool.
    pub fn with_parallelism(mut self, parallel: bool, n_threads: Option<usize>) -> Result<Self> {
        self.parallelism = Parallelism::new(parallel, n_threads)?;
        Ok(self)
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    pub fn stretch(&self) -> StretchMove {
        self.stretch
    }

    pub fn posterior(&self) -> &Posterior<'a, P> {
        &self.posterior
    }

    /// Evaluate the posterior at several positions, preserving order.
    fn evaluate_batch(&self, thetas: &[Vec<f64>]) -> Vec<Evaluation> {
        self.parallelism
            .map(thetas, |theta| self.posterior.evaluate(theta))
    }

    /// Build the initial state: seed the generator, place the walkers and
    /// evaluate the posterior at every starting position.
    pub fn initial_state(&self, init: &WalkerInit, seed: u64) -> Result<SamplerState> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let space = self.posterior.space();
        let positions = init.initialize(self.n_walkers, space, &mut rng)?;

        let mut state = SamplerState::new(positions, space.names().to_vec(), rng)?;
        let initial_params: Vec<Vec<f64>> = state
            .positions
            .outer_iter()
            .map(|row| row.to_vec())
            .collect();
        state.log_probs = self
            .evaluate_batch(&initial_params)
            .iter()
            .map(Evaluation::log_prob)
            .collect();

        if state.log_probs.iter().all(|lp| !lp.is_finite()) {
            warn!("No walker starts at a finite log posterior; the sampler cannot accept moves until one is found");
        }

        Ok(state)
    }

    /// Run the sampler for `n_steps` steps from a fresh state.
    pub fn run(&self, n_steps: usize, init: WalkerInit, seed: u64) -> Result<SamplerRun> {
        let state = self.initial_state(&init, seed)?;
        let chain = Chain::new(state.param_names.clone(), self.n_walkers);
        self.run_from_state(state, chain, n_steps, 0, None, None::<fn(&ProgressInfo)>)
    }

    /// Run the sampler with a callback invoked after every step.
    pub fn run_with_progress<F>(
        &self,
        n_steps: usize,
        init: WalkerInit,
        seed: u64,
        progress_callback: F,
    ) -> Result<SamplerRun>
    where
        F: FnMut(&ProgressInfo),
    {
        let state = self.initial_state(&init, seed)?;
        let chain = Chain::new(state.param_names.clone(), self.n_walkers);
        self.run_from_state(state, chain, n_steps, 0, None, Some(progress_callback))
    }

    /// Run the sampler, writing `{path}.state` and `{path}.chain` every
    /// `checkpoint_every` steps.
    ///
    /// # Arguments
    ///
    /// * `n_steps` - Number of steps to run
    /// * `init` - Walker initialization strategy
    /// * `seed` - Seed of the sampler's random generator
    /// * `checkpoint_every` - Save a checkpoint every N steps (0 disables)
    /// * `checkpoint_path` - Base path for checkpoint files
    /// * `progress_callback` - Optional callback for progress reporting
    pub fn run_with_checkpoint<F, Q>(
        &self,
        n_steps: usize,
        init: WalkerInit,
        seed: u64,
        checkpoint_every: usize,
        checkpoint_path: Q,
        progress_callback: Option<F>,
    ) -> Result<SamplerRun>
    where
        F: FnMut(&ProgressInfo),
        Q: AsRef<Path>,
    {
        let state = self.initial_state(&init, seed)?;
        let chain = Chain::new(state.param_names.clone(), self.n_walkers);
        self.run_from_state(
            state,
            chain,
            n_steps,
            checkpoint_every,
            Some(checkpoint_path.as_ref()),
            progress_callback,
        )
    }

    /// Continue a checkpointed run until the chain holds `total_steps` steps.
    ///
    /// Because the generator is restored with the state, the resumed chain is
    /// identical to the one an uninterrupted run would have produced.
    ///
    /// The chain file is written before the state file, so a run interrupted
    /// between the two leaves a chain that is ahead of its state. The extra
    /// steps are dropped and sampling continues from the state.
    ///
    /// # Arguments
    ///
    /// * `total_steps` - Total number of steps to reach, including those already completed
    /// * `checkpoint_every` - Save a checkpoint every N steps (0 disables)
    /// * `checkpoint_path` - Base path of the `.state` and `.chain` files
    /// * `progress_callback` - Optional callback for progress reporting
    ///
    /// # Errors
    ///
    /// - [`Error::Checkpoint`] if the files cannot be read, belong to a
    ///   different sampler, or the chain is behind the state
    /// - [`Error::InvalidConfiguration`] if the checkpoint already holds more
    ///   than `total_steps` steps
    pub fn resume_from_checkpoint<F, Q>(
        &self,
        total_steps: usize,
        checkpoint_every: usize,
        checkpoint_path: Q,
        progress_callback: Option<F>,
    ) -> Result<SamplerRun>
    where
        F: FnMut(&ProgressInfo),
        Q: AsRef<Path>,
    {
        let (state_path, chain_path) = checkpoint_paths(&checkpoint_path);
        let state = SamplerState::load_checkpoint(&state_path)?;
        let mut chain = Chain::load(&chain_path)?;

        if state.n_walkers() != self.n_walkers || state.param_names != self.posterior.space().names()
        {
            return Err(Error::Checkpoint(format!(
                "Checkpoint holds {} walkers over {:?}, sampler expects {} walkers over {:?}",
                state.n_walkers(),
                state.param_names,
                self.n_walkers,
                self.posterior.space().names()
            )));
        }
        if chain.len() < state.iterations {
            return Err(Error::Checkpoint(format!(
                "Checkpoint state has {} steps but chain has only {}",
                state.iterations,
                chain.len()
            )));
        }
        if chain.len() > state.iterations {
            warn!(
                chain_steps = chain.len(),
                state_steps = state.iterations,
                "Checkpoint chain is ahead of its state; dropping the extra steps"
            );
            chain.truncate(state.iterations);
        }
        if chain.len() > total_steps {
            return Err(Error::InvalidConfiguration(format!(
                "Checkpoint already holds {} steps, more than the {} requested",
                chain.len(),
                total_steps
            )));
        }

        debug!(
            completed = chain.len(),
            total = total_steps,
            "Resuming from checkpoint"
        );

        let remaining = total_steps - chain.len();
        self.run_from_state(
            state,
            chain,
            remaining,
            checkpoint_every,
            Some(checkpoint_path.as_ref()),
            progress_callback,
        )
    }

    /// Core sampling loop: advance `state` by `n_steps` steps, appending to `chain`.
    ///
    /// Checkpoints are written at step boundaries when `checkpoint_every > 0`
    /// and a path is given.
    pub fn run_from_state<F>(
        &self,
        mut state: SamplerState,
        mut chain: Chain,
        n_steps: usize,
        checkpoint_every: usize,
        checkpoint_path: Option<&Path>,
        mut progress_callback: Option<F>,
    ) -> Result<SamplerRun>
    where
        F: FnMut(&ProgressInfo),
    {
        let n_walkers = state.n_walkers();
        let half = n_walkers / 2;
        let total = state.iterations + n_steps;
        let checkpoint_files = checkpoint_path
            .filter(|_| checkpoint_every > 0)
            .map(checkpoint_paths);

        for _ in 0..n_steps {
            let mut non_finite = self.update_group(&mut state, 0..half, half..n_walkers);
            non_finite += self.update_group(&mut state, half..n_walkers, 0..half);

            if non_finite == n_walkers {
                state.degraded_steps += 1;
                warn!(
                    step = state.iterations,
                    "Every proposal of this step produced a non-finite evaluation"
                );
            }

            chain.push(state.positions.clone(), state.log_probs.clone())?;
            state.iterations += 1;

            if let Some((state_path, chain_path)) = &checkpoint_files {
                if state.iterations % checkpoint_every == 0 {
                    chain.save(chain_path)?;
                    state.save_checkpoint(state_path)?;
                    debug!(step = state.iterations, path = %state_path.display(), "Wrote checkpoint");
                }
            }

            if let Some(ref mut callback) = progress_callback {
                let info = ProgressInfo {
                    iteration: state.iterations - 1,
                    total,
                    acceptance_rate: state.mean_acceptance_rate(),
                    mean_log_prob: state.log_probs.mean().unwrap_or(f64::NEG_INFINITY),
                };
                callback(&info);
            }
        }

        Ok(SamplerRun { state, chain })
    }

    /// Update the walkers in `active_range` against those in `complementary_range`.
    ///
    /// Returns the number of proposals that evaluated to a non-finite value.
    fn update_group(
        &self,
        state: &mut SamplerState,
        active_range: std::ops::Range<usize>,
        complementary_range: std::ops::Range<usize>,
    ) -> usize {
        let complementary_positions = state
            .positions
            .slice(ndarray::s![complementary_range, ..])
            .to_owned();

        let mut proposals: Vec<(Array1<f64>, f64)> = Vec::with_capacity(active_range.len());
        for i in active_range.clone() {
            proposals.push(self.stretch.propose(
                &mut state.rng,
                state.positions.row(i),
                &complementary_positions,
            ));
        }

        let proposal_params: Vec<Vec<f64>> = proposals.iter().map(|(p, _)| p.to_vec()).collect();
        let evaluations = self.evaluate_batch(&proposal_params);

        let n_params = state.n_params();
        let mut non_finite = 0;
        for (walker_idx, ((proposal, z), evaluation)) in
            active_range.zip(proposals.iter().zip(evaluations.iter()))
        {
            if *evaluation == Evaluation::NonFinite {
                non_finite += 1;
            }

            let log_prob_new = evaluation.log_prob();
            let accept_prob = self.stretch.acceptance_probability(
                *z,
                n_params,
                state.log_probs[walker_idx],
                log_prob_new,
            );

            state.n_proposed[walker_idx] += 1;
            if state.rng.gen::<f64>() < accept_prob {
                state.positions.row_mut(walker_idx).assign(proposal);
                state.log_probs[walker_idx] = log_prob_new;
                state.n_accepted[walker_idx] += 1;
            }
        }

        non_finite
    }
}
