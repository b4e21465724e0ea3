use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod config;
pub mod dataset;
pub mod distance;
pub mod error;
pub mod hash;
pub mod init_check;
pub mod lbfgs;
pub mod network;
pub mod params;
pub mod prover;
pub mod registry;
pub mod replay;
pub mod spoof;
pub mod storage;
pub mod train;
pub mod verifier;

pub use crate::config::{ProveConfig, SpoofConfig, VerifyConfig};
pub use crate::distance::{parameter_distance, DistanceRecord, Metric, ThresholdSet};
pub use crate::error::{PolError, Result};
pub use crate::hash::HashReport;
pub use crate::init_check::InitReport;
pub use crate::params::{Checkpoint, ParamSet, Tensor};
pub use crate::prover::ProofSummary;
pub use crate::spoof::SpoofOutcome;
pub use crate::storage::ProofDir;
pub use crate::verifier::{FullReport, TopQReport, Verdict, Violation};

use crate::dataset::{load_dataset, Dataset};
use crate::hash::verify_hash;
use crate::init_check::verify_initialization_dir;
use crate::prover::{prove_work, shuffled_sequence};
use crate::replay::ReplayRunner;
use crate::spoof::SpoofAttacker;
use crate::train::SgdTrainer;
use crate::verifier::Verifier;

/// Outcome of the replay stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayReport {
    Full(FullReport),
    TopQ(TopQReport),
}

impl ReplayReport {
    pub fn verdict(&self) -> &Verdict {
        match self {
            ReplayReport::Full(r) => &r.verdict,
            ReplayReport::TopQ(r) => &r.verdict,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofReport {
    pub initialization: InitReport,
    pub hash: HashReport,
    pub replay: ReplayReport,
    pub verdict: Verdict,
}

/// Check a proof directory end to end.
///
/// Runs the initialization test, the data-hash check and then top-q
/// verification (`q > 0`) or full replay (`q == 0`). Failed checks land in
/// the verdict; only unusable inputs are errors.
pub fn verify_proof(config: &VerifyConfig) -> Result<ProofReport> {
    config.validate()?;
    let proof = ProofDir::open(&config.model_dir)?;
    let dataset = load_dataset(config.dataset, true, config.data_dir.as_deref())?;

    info!(dir = %proof.root().display(), "verifying initialization");
    let initialization = verify_initialization_dir(&proof, config.architecture, config.init_threshold)?;
    info!("verifying data hash");
    let hash = verify_hash(&proof, &dataset)?;

    let network = config.architecture.network(dataset.spec())?;
    let trainer = SgdTrainer::new(network.as_ref(), &dataset);
    let runner = ReplayRunner::new(&trainer, config.hyperparams());
    let verifier = Verifier::new(proof, runner, config.threshold_set()?, config.save_freq)?;
    let replay = if config.q > 0 {
        info!(q = config.q, epochs = config.epochs, "top-q verification");
        ReplayReport::TopQ(verifier.verify_topq(&config.topq_options())?)
    } else {
        info!("full verification");
        ReplayReport::Full(verifier.verify_all()?)
    };

    let verdict = initialization
        .verdict()
        .combine(hash.verdict())
        .combine(replay.verdict().clone());
    Ok(ProofReport { initialization, hash, replay, verdict })
}

/// Train honestly on a shuffled sequence and record the proof.
pub fn prove(config: &ProveConfig) -> Result<ProofSummary> {
    config.validate()?;
    let dataset = load_dataset(config.dataset, true, config.data_dir.as_deref())?;
    let network = config.architecture.network(dataset.spec())?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let init = network.init_params(&mut rng);
    let mut sequence = shuffled_sequence(dataset.len(), config.epochs, &mut rng);
    if let Some(samples) = config.samples {
        sequence.truncate(samples);
    }

    let proof = ProofDir::create(&config.model_dir)?;
    let trainer = SgdTrainer::new(network.as_ref(), &dataset);
    let (_, summary) = prove_work(&proof, &trainer, &dataset, &config.hyperparams(), init, &sequence, config.save_freq)?;
    info!(steps = summary.steps, checkpoints = summary.checkpoints.len(), "proof recorded");
    Ok(summary)
}

/// Forge a trajectory between two genuine checkpoints of `config.proof_dir`.
pub fn spoof(config: &SpoofConfig) -> Result<SpoofOutcome> {
    let dataset = load_dataset(config.dataset, true, config.data_dir.as_deref())?;
    let network = config.architecture.network(dataset.spec())?;
    let mut attacker = SpoofAttacker::new(network.as_ref(), &dataset, config.clone())?;
    attacker.run_from_proof()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetName;

    fn recorded(dir: &std::path::Path) -> ProveConfig {
        ProveConfig {
            model_dir: dir.join("proof"),
            batch_size: 8,
            lr: 0.05,
            epochs: 1,
            save_freq: 40,
            samples: Some(120),
            seed: 3,
            ..ProveConfig::default()
        }
    }

    #[test]
    fn test_prove_then_verify_full() {
        let dir = tempfile::tempdir().unwrap();
        let prove_config = recorded(dir.path());
        let summary = prove(&prove_config).unwrap();
        assert_eq!(summary.checkpoints, vec![0, 40, 80, 120]);

        let config = VerifyConfig { q: 0, init_threshold: 1e-6, ..prove_config.verify_config() };
        let report = verify_proof(&config).unwrap();
        assert!(report.verdict.is_valid(), "{:?}", report.verdict);
        assert!(matches!(report.replay, ReplayReport::Full(ref r) if r.intervals.len() == 3));
    }

    #[test]
    fn test_tampered_checkpoint_is_caught_by_topq() {
        let dir = tempfile::tempdir().unwrap();
        let prove_config = recorded(dir.path());
        prove(&prove_config).unwrap();

        let proof = ProofDir::open(&prove_config.model_dir).unwrap();
        let mut forged = proof.load_checkpoint(80).unwrap();
        forged.net = forged.net.map(|v| v + 2.0);
        proof.save_checkpoint(&forged).unwrap();

        let config = VerifyConfig { q: 1, epochs: 1, init_threshold: 1e-6, ..prove_config.verify_config() };
        let report = verify_proof(&config).unwrap();
        assert!(!report.verdict.is_valid());
        assert!(report
            .verdict
            .violations()
            .iter()
            .any(|v| matches!(v, Violation::Distance { metric: Metric::Linf, .. })));
    }

    #[test]
    fn test_missing_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifyConfig {
            model_dir: dir.path().join("absent"),
            dataset: DatasetName::Synthetic,
            ..VerifyConfig::default()
        };
        assert!(matches!(verify_proof(&config), Err(PolError::MissingResource { kind: "model directory", .. })));
    }
}
