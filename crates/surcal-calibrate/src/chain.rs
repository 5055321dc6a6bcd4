//! Storage for ensemble MCMC samples.

use indexmap::IndexMap;
use ndarray::{Array1, Array2, Array3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use surcal_core::{Error, Result};

/// Sibling path that a file is written to before being renamed into place.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".tmp");
    PathBuf::from(staged)
}

/// Serialize `value` with bincode and atomically replace `path`.
///
/// The data goes to `{path}.tmp` first and is renamed over `path` only after
/// it has been flushed and synced, so `path` always holds either the previous
/// or the new contents. A leftover staging file from an interrupted write is
/// overwritten.
pub(crate) fn write_bincode<T: Serialize>(value: &T, path: &Path, what: &str) -> Result<()> {
    let staged = staging_path(path);
    let file = File::create(&staged)
        .map_err(|e| Error::Checkpoint(format!("Failed to create {} file: {}", what, e)))?;
    let mut writer = BufWriter::new(file);

    bincode::serialize_into(&mut writer, value)
        .map_err(|e| Error::Checkpoint(format!("Failed to serialize {}: {}", what, e)))?;

    writer
        .flush()
        .map_err(|e| Error::Checkpoint(format!("Failed to flush {} file: {}", what, e)))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::Checkpoint(format!("Failed to sync {} file: {}", what, e)))?;
    drop(writer);

    fs::rename(&staged, path).map_err(|e| {
        Error::Checkpoint(format!(
            "Failed to move {} file into place at {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

/// Read a bincode file written by [`write_bincode`].
pub(crate) fn read_bincode<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| Error::Checkpoint(format!("Failed to open {} file: {}", what, e)))?;
    let mut reader = BufReader::new(file);

    bincode::deserialize_from(&mut reader)
        .map_err(|e| Error::Checkpoint(format!("Failed to deserialize {}: {}", what, e)))
}

/// Append-only record of ensemble snapshots.
///
/// Logically a `(n_walkers, n_steps, n_params)` array, stored step by step
/// together with the log-posterior of every walker at every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    /// Walker positions per step: each of shape (n_walkers, n_params)
    samples: Vec<Array2<f64>>,

    /// Log probabilities per step: each of shape (n_walkers,)
    log_probs: Vec<Array1<f64>>,

    /// Parameter names in order
    param_names: Vec<String>,

    n_walkers: usize,
}

impl Chain {
    /// Create an empty chain for `n_walkers` walkers over the named parameters.
    pub fn new(param_names: Vec<String>, n_walkers: usize) -> Self {
        Self {
            samples: Vec::new(),
            log_probs: Vec::new(),
            param_names,
            n_walkers,
        }
    }

    /// Append one ensemble snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the snapshot does not have
    /// `n_walkers` rows and one column per parameter, or if the number of log
    /// probabilities does not match the number of walkers.
    pub fn push(&mut self, positions: Array2<f64>, log_probs: Array1<f64>) -> Result<()> {
        if positions.dim() != (self.n_walkers, self.n_params()) {
            return Err(Error::InvalidConfiguration(format!(
                "Snapshot has shape {:?}, expected ({}, {})",
                positions.dim(),
                self.n_walkers,
                self.n_params()
            )));
        }
        if log_probs.len() != self.n_walkers {
            return Err(Error::InvalidConfiguration(format!(
                "Snapshot has {} log probabilities, expected {}",
                log_probs.len(),
                self.n_walkers
            )));
        }

        self.samples.push(positions);
        self.log_probs.push(log_probs);
        Ok(())
    }

    /// Number of stored steps.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    pub fn n_params(&self) -> usize {
        self.param_names.len()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Positions and log probabilities of step `i`.
    pub fn step(&self, i: usize) -> Option<(&Array2<f64>, &Array1<f64>)> {
        Some((self.samples.get(i)?, self.log_probs.get(i)?))
    }

    /// A new chain without the first `n` steps.
    ///
    /// Discarding at least as many steps as the chain holds yields an empty chain.
    pub fn discard(&self, n: usize) -> Chain {
        Chain {
            samples: self.samples.iter().skip(n).cloned().collect(),
            log_probs: self.log_probs.iter().skip(n).cloned().collect(),
            param_names: self.param_names.clone(),
            n_walkers: self.n_walkers,
        }
    }

    /// Samples as an array of shape (n_walkers, n_steps, n_params).
    pub fn to_array3(&self) -> Array3<f64> {
        let mut out = Array3::zeros((self.n_walkers, self.len(), self.n_params()));
        for (step, sample) in self.samples.iter().enumerate() {
            for (walker, row) in sample.outer_iter().enumerate() {
                out.slice_mut(ndarray::s![walker, step, ..]).assign(&row);
            }
        }
        out
    }

    /// Trace of one parameter for one walker across all steps.
    pub fn walker_trace(&self, walker: usize, param: usize) -> Array1<f64> {
        self.samples
            .iter()
            .map(|sample| sample[[walker, param]])
            .collect()
    }

    /// All samples flattened to shape (n_steps * n_walkers, n_params).
    ///
    /// Rows are ordered by step, then by walker.
    pub fn flat_samples(&self) -> Array2<f64> {
        let n_walkers = self.n_walkers;
        let mut flat = Array2::zeros((self.len() * n_walkers, self.n_params()));

        for (i, sample) in self.samples.iter().enumerate() {
            for (j, walker) in sample.outer_iter().enumerate() {
                flat.row_mut(i * n_walkers + j).assign(&walker);
            }
        }

        flat
    }

    /// All log probabilities flattened in the same order as [`Chain::flat_samples`].
    pub fn flat_log_probs(&self) -> Array1<f64> {
        self.log_probs
            .iter()
            .flat_map(|lp| lp.iter().copied())
            .collect()
    }

    /// Map from parameter name to all of its flattened samples.
    pub fn to_param_map(&self) -> IndexMap<String, Array1<f64>> {
        let flat = self.flat_samples();
        self.param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), flat.column(i).to_owned()))
            .collect()
    }

    /// Keep only the first `n` steps.
    ///
    /// Used when a checkpointed chain is ahead of its state file.
    pub(crate) fn truncate(&mut self, n: usize) {
        self.samples.truncate(n);
        self.log_probs.truncate(n);
    }

    /// Write the chain to a bincode file.
    ///
    /// The file is replaced atomically: an interrupted write leaves the
    /// previous contents of `path` intact.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the chain file to create or replace
    ///
    /// # Returns
    ///
    /// `Ok(())` on success, [`Error::Checkpoint`] if serialization or file
    /// writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_bincode(self, path.as_ref(), "chain")
    }

    /// Read a chain written by [`Chain::save`].
    ///
    /// # Errors
    ///
    /// [`Error::Checkpoint`] if the file is missing or cannot be decoded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_bincode(path.as_ref(), "chain")
    }

    /// Append the steps of `other` to this chain.
    ///
    /// Both chains must cover the same parameters with the same number of walkers.
    pub fn merge(&mut self, other: &Chain) -> Result<()> {
        if self.param_names != other.param_names {
            return Err(Error::InvalidConfiguration(format!(
                "Cannot merge chains with different parameter names: {:?} vs {:?}",
                self.param_names, other.param_names
            )));
        }
        if self.n_walkers != other.n_walkers {
            return Err(Error::InvalidConfiguration(format!(
                "Cannot merge chains with different walker counts: {} vs {}",
                self.n_walkers, other.n_walkers
            )));
        }

        self.samples.extend(other.samples.iter().cloned());
        self.log_probs.extend(other.log_probs.iter().cloned());
        Ok(())
    }
}
