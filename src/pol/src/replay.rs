use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::params::ParamSet;
use crate::storage;
use crate::train::{Hyperparams, Trainer};

/// Reproduces a recorded end state from a recorded start state.
///
/// The index slice is handed to the trainer exactly as recorded; nothing is
/// reshuffled or deduplicated.
pub struct ReplayRunner<'a> {
    trainer: &'a dyn Trainer,
    hyper: Hyperparams,
}

impl<'a> ReplayRunner<'a> {
    pub fn new(trainer: &'a dyn Trainer, hyper: Hyperparams) -> Self {
        Self { trainer, hyper }
    }

    pub fn hyper(&self) -> &Hyperparams {
        &self.hyper
    }

    pub fn replay(&self, start: &ParamSet, slice: &[usize]) -> Result<ParamSet> {
        debug!(steps = slice.len(), "replaying interval");
        self.trainer.train(start, slice, &self.hyper)
    }

    /// Replay starting from an on-disk checkpoint.
    pub fn replay_from(&self, start: &Path, slice: &[usize]) -> Result<ParamSet> {
        let start = storage::load_checkpoint(start)?;
        self.replay(&start.net, slice)
    }
}
