//! Honest proof recording.
//!
//! Trains along a fixed index sequence and leaves behind everything a
//! verifier needs: the initial and periodic checkpoints, the sequence itself
//! and the hash of the data it addresses.

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::Dataset;
use crate::error::{PolError, Result};
use crate::hash::write_hash;
use crate::params::{Checkpoint, ParamSet};
use crate::storage::ProofDir;
use crate::train::{Hyperparams, Trainer};
use crate::verifier::intervals;

/// Every sample index once per epoch, reshuffled each epoch.
pub fn shuffled_sequence(len: usize, epochs: usize, rng: &mut dyn RngCore) -> Vec<usize> {
    let mut sequence = Vec::with_capacity(len * epochs);
    for _ in 0..epochs {
        let mut epoch: Vec<usize> = (0..len).collect();
        epoch.shuffle(rng);
        sequence.extend(epoch);
    }
    sequence
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofSummary {
    pub steps: usize,
    /// Steps at which a checkpoint was written, including 0.
    pub checkpoints: Vec<usize>,
    pub dataset_hash: String,
}

/// Train from `init` along `sequence`, checkpointing every `save_freq` indices.
///
/// Each interval is trained with a fresh optimizer, matching how intervals
/// are replayed.
pub fn prove_work(
    proof: &ProofDir,
    trainer: &dyn Trainer,
    dataset: &dyn Dataset,
    hyper: &Hyperparams,
    init: ParamSet,
    sequence: &[usize],
    save_freq: usize,
) -> Result<(ParamSet, ProofSummary)> {
    if sequence.is_empty() {
        return Err(PolError::InvalidConfig("cannot record a proof over an empty sequence".to_string()));
    }
    let dataset_hash = write_hash(proof, dataset, sequence)?;
    proof.save_checkpoint(&Checkpoint::new(0, init.clone()))?;

    let mut params = init;
    let mut checkpoints = vec![0];
    for interval in intervals(sequence.len(), save_freq)? {
        params = trainer.train(&params, &sequence[interval.start..interval.end], hyper)?;
        proof.save_checkpoint(&Checkpoint::new(interval.end as u64, params.clone()))?;
        checkpoints.push(interval.end);
        info!(step = interval.end, total = sequence.len(), "checkpoint saved");
    }

    let summary = ProofSummary { steps: sequence.len(), checkpoints, dataset_hash };
    Ok((params, summary))
}
