//! Run configuration for proving, verification and attack runs.
//!
//! Every config deserializes from partial JSON: missing fields take the
//! defaults below.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetName;
use crate::distance::{Metric, ThresholdSet};
use crate::error::{PolError, Result};
use crate::init_check::DEFAULT_INIT_THRESHOLD;
use crate::registry::Architecture;
use crate::train::Hyperparams;
use crate::verifier::{RankingMode, TopQOptions};

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(PolError::missing("config file", path));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| PolError::format(path, e.to_string()))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub model_dir: PathBuf,
    pub dataset: DatasetName,
    /// Directory holding the CIFAR binary files.
    pub data_dir: Option<PathBuf>,
    pub architecture: Architecture,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub epochs: usize,
    pub save_freq: usize,
    pub metrics: Vec<Metric>,
    pub thresholds: Vec<f64>,
    /// Intervals deep-checked per metric and epoch; 0 replays everything.
    pub q: usize,
    pub init_threshold: f64,
    pub half: bool,
    pub ranking: RankingMode,
    pub cache_replays: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("proof/CIFAR10_test"),
            dataset: DatasetName::Cifar10,
            data_dir: None,
            architecture: Architecture::Mlp,
            batch_size: 128,
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 1e-4,
            epochs: 2,
            save_freq: 100,
            metrics: Metric::ALL.to_vec(),
            thresholds: vec![10000.0, 100.0, 1.0, 0.1],
            q: 2,
            init_threshold: DEFAULT_INIT_THRESHOLD,
            half: false,
            ranking: RankingMode::Replay,
            cache_replays: false,
        }
    }
}

impl VerifyConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn validate(&self) -> Result<()> {
        self.threshold_set()?;
        if self.batch_size == 0 {
            return Err(PolError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.save_freq == 0 {
            return Err(PolError::InvalidConfig("save_freq must be positive".to_string()));
        }
        if self.q > 0 && self.epochs == 0 {
            return Err(PolError::InvalidConfig("top-q verification needs at least one epoch".to_string()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(PolError::InvalidConfig(format!("learning rate {} must be positive", self.lr)));
        }
        Ok(())
    }

    pub fn threshold_set(&self) -> Result<ThresholdSet> {
        ThresholdSet::new(&self.metrics, &self.thresholds)
    }

    pub fn hyperparams(&self) -> Hyperparams {
        Hyperparams {
            lr: self.lr,
            batch_size: self.batch_size,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            half: self.half,
        }
    }

    pub fn topq_options(&self) -> TopQOptions {
        TopQOptions { epochs: self.epochs, q: self.q, ranking: self.ranking, cache_replays: self.cache_replays }
    }
}

/// Settings for recording an honest proof.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProveConfig {
    pub model_dir: PathBuf,
    pub dataset: DatasetName,
    pub data_dir: Option<PathBuf>,
    pub architecture: Architecture,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub epochs: usize,
    pub save_freq: usize,
    /// Truncate the shuffled sequence to this many indices.
    pub samples: Option<usize>,
    pub half: bool,
    pub seed: u64,
}

impl Default for ProveConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("proof/SYNTHETIC"),
            dataset: DatasetName::Synthetic,
            data_dir: None,
            architecture: Architecture::Mlp,
            batch_size: 128,
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 1e-4,
            epochs: 2,
            save_freq: 100,
            samples: None,
            half: false,
            seed: 0,
        }
    }
}

impl ProveConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("batch_size", self.batch_size), ("epochs", self.epochs), ("save_freq", self.save_freq)] {
            if value == 0 {
                return Err(PolError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.samples == Some(0) {
            return Err(PolError::InvalidConfig("samples must be positive".to_string()));
        }
        Ok(())
    }

    pub fn hyperparams(&self) -> Hyperparams {
        Hyperparams {
            lr: self.lr,
            batch_size: self.batch_size,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            half: self.half,
        }
    }

    /// The verification settings matching this recording.
    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            model_dir: self.model_dir.clone(),
            dataset: self.dataset,
            data_dir: self.data_dir.clone(),
            architecture: self.architecture,
            batch_size: self.batch_size,
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            epochs: self.epochs,
            save_freq: self.save_freq,
            half: self.half,
            ..VerifyConfig::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofConfig {
    /// Proof directory holding the genuine start and end checkpoints.
    pub proof_dir: PathBuf,
    pub start_step: usize,
    /// Step of the genuine end checkpoint.
    pub iter: usize,
    pub dataset: DatasetName,
    pub data_dir: Option<PathBuf>,
    pub architecture: Architecture,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Forged steps between the start and end checkpoints.
    pub t: usize,
    /// Training steps each forged checkpoint claims to cover.
    pub k: usize,
    pub batch_size: usize,
    pub retry: usize,
    /// Ceiling on the residual squared gradient norm.
    pub gd: f64,
    /// Ceiling on the squared perturbation norm.
    pub nd: f64,
    pub round: usize,
    pub verify: bool,
    pub seed: u64,
    pub cut: usize,
    pub noise_penalty: f32,
    pub metrics: Vec<Metric>,
    pub thresholds: Vec<f64>,
    pub init_threshold: f64,
    pub output_root: PathBuf,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        Self {
            proof_dir: PathBuf::from("proof/CIFAR100"),
            start_step: 0,
            iter: 78125,
            dataset: DatasetName::Cifar100,
            data_dir: None,
            architecture: Architecture::Mlp,
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 1e-4,
            t: 20,
            k: 100,
            batch_size: 128,
            retry: 30,
            gd: 15.0,
            nd: 20.0,
            round: 1,
            verify: true,
            seed: 0,
            cut: 100,
            noise_penalty: 0.1,
            metrics: Metric::ALL.to_vec(),
            thresholds: vec![1000.0, 10.0, 0.1, 0.01],
            init_threshold: DEFAULT_INIT_THRESHOLD,
            output_root: PathBuf::from("spoof"),
        }
    }
}

impl SpoofConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn validate(&self) -> Result<()> {
        self.threshold_set()?;
        for (name, value) in [("t", self.t), ("k", self.k), ("batch_size", self.batch_size), ("cut", self.cut)] {
            if value == 0 {
                return Err(PolError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.k % self.cut != 0 {
            return Err(PolError::InvalidConfig(format!("cut {} must divide k {}", self.cut, self.k)));
        }
        if self.iter <= self.start_step {
            return Err(PolError::InvalidConfig(format!(
                "end step {} must come after start step {}",
                self.iter, self.start_step
            )));
        }
        Ok(())
    }

    pub fn threshold_set(&self) -> Result<ThresholdSet> {
        ThresholdSet::new(&self.metrics, &self.thresholds)
    }

    /// Samples synthesized per cut.
    pub fn sub_batch(&self) -> usize {
        self.batch_size * self.k / self.cut
    }

    /// SGD steps taken on each accepted sub-batch.
    pub fn steps_per_cut(&self) -> usize {
        self.k / self.cut
    }

    /// Where forged checkpoints, images and the data log are written.
    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(self.dataset.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: VerifyConfig = serde_json::from_str(r#"{"q": 0, "dataset": "SYNTHETIC", "metrics": ["2", "cos"], "thresholds": [1, 0.5]}"#).unwrap();
        assert_eq!(config.q, 0);
        assert_eq!(config.dataset, DatasetName::Synthetic);
        assert_eq!(config.save_freq, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_verify_defaults() {
        let config = VerifyConfig::default();
        assert_eq!(config.thresholds, vec![10000.0, 100.0, 1.0, 0.1]);
        assert_eq!(config.hyperparams().batch_size, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mismatched_thresholds_rejected() {
        let config = VerifyConfig { thresholds: vec![1.0], ..VerifyConfig::default() };
        assert!(matches!(config.validate(), Err(PolError::InvalidConfig(_))));
    }

    #[test]
    fn test_spoof_batch_geometry() {
        let config = SpoofConfig::default();
        assert_eq!(config.sub_batch(), 128);
        assert_eq!(config.steps_per_cut(), 1);
        assert_eq!(config.output_dir(), PathBuf::from("spoof/CIFAR100"));
        assert!(config.validate().is_ok());

        let bad = SpoofConfig { cut: 3, ..SpoofConfig::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SpoofConfig::from_file(&dir.path().join("spoof.json")),
            Err(PolError::MissingResource { kind: "config file", .. })
        ));
    }
}
