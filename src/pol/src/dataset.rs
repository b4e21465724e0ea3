//! Training data access.
//!
//! Samples are kept as raw bytes (the form the hash is computed over) and
//! scaled to `[0, 1]` features on demand for training.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PolError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatasetName {
    Cifar10,
    Cifar100,
    Synthetic,
}

impl DatasetName {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetName::Cifar10 => "CIFAR10",
            DatasetName::Cifar100 => "CIFAR100",
            DatasetName::Synthetic => "SYNTHETIC",
        }
    }

    pub fn spec(self) -> DatasetSpec {
        match self {
            DatasetName::Cifar10 => DatasetSpec { name: self, channels: 3, height: 32, width: 32, classes: 10 },
            DatasetName::Cifar100 => DatasetSpec { name: self, channels: 3, height: 32, width: 32, classes: 100 },
            DatasetName::Synthetic => DatasetSpec::synthetic(),
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetName {
    type Err = PolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CIFAR10" => Ok(DatasetName::Cifar10),
            "CIFAR100" => Ok(DatasetName::Cifar100),
            "SYNTHETIC" => Ok(DatasetName::Synthetic),
            _ => Err(PolError::UnknownDataset(s.to_string())),
        }
    }
}

impl TryFrom<String> for DatasetName {
    type Error = PolError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DatasetName> for String {
    fn from(d: DatasetName) -> Self {
        d.as_str().to_string()
    }
}

/// Sample geometry of a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: DatasetName,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub classes: usize,
}

impl DatasetSpec {
    pub fn synthetic() -> Self {
        DatasetSpec { name: DatasetName::Synthetic, channels: 1, height: 8, width: 8, classes: 4 }
    }

    pub fn input_dim(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Indexable raw dataset.
pub trait Dataset {
    fn spec(&self) -> &DatasetSpec;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes and label of one sample.
    fn raw(&self, idx: usize) -> Result<(&[u8], usize)>;

    /// Features scaled to `[0, 1]` and the label.
    fn sample(&self, idx: usize) -> Result<(Vec<f32>, usize)> {
        let (bytes, label) = self.raw(idx)?;
        Ok((bytes.iter().map(|&b| b as f32 / 255.0).collect(), label))
    }

    /// Canonical string of the unprocessed sample, as hashed by the hash verifier.
    fn raw_repr(&self, idx: usize) -> Result<String> {
        let (bytes, label) = self.raw(idx)?;
        let values: Vec<String> = bytes.iter().map(u8::to_string).collect();
        Ok(format!("[{}] {label}", values.join(", ")))
    }

    /// Stack samples into a `(batch, features)` matrix, keeping the given order.
    fn batch(&self, indices: &[usize]) -> Result<(Array2<f32>, Vec<usize>)> {
        let dim = self.spec().input_dim();
        let mut features = Vec::with_capacity(indices.len() * dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let (x, y) = self.sample(idx)?;
            features.extend(x);
            labels.push(y);
        }
        let inputs = Array2::from_shape_vec((indices.len(), dim), features)
            .map_err(|e| PolError::shape_mismatch(format!("({}, {dim})", indices.len()), e))?;
        Ok((inputs, labels))
    }
}

/// Fixed-size images held in memory, channel-major per sample.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    spec: DatasetSpec,
    pixels: Vec<u8>,
    labels: Vec<usize>,
}

impl ImageDataset {
    pub fn new(spec: DatasetSpec, pixels: Vec<u8>, labels: Vec<usize>) -> Result<Self> {
        if pixels.len() != labels.len() * spec.input_dim() {
            return Err(PolError::shape_mismatch(
                format!("{} bytes", labels.len() * spec.input_dim()),
                format!("{} bytes", pixels.len()),
            ));
        }
        if let Some(bad) = labels.iter().find(|&&l| l >= spec.classes) {
            return Err(PolError::InvalidConfig(format!("label {bad} outside {} classes", spec.classes)));
        }
        Ok(Self { spec, pixels, labels })
    }

    /// Deterministic stand-in data: sample `i` is derived from SHA-256 of `i`.
    pub fn synthetic(spec: DatasetSpec, len: usize) -> Self {
        let dim = spec.input_dim();
        let mut pixels = Vec::with_capacity(len * dim);
        let mut labels = Vec::with_capacity(len);
        for i in 0..len {
            let mut block = 0u64;
            let mut sample = Vec::with_capacity(dim);
            while sample.len() < dim {
                let mut hasher = Sha256::new();
                hasher.update((i as u64).to_le_bytes());
                hasher.update(block.to_le_bytes());
                sample.extend_from_slice(&hasher.finalize());
                block += 1;
            }
            sample.truncate(dim);
            labels.push(sample[0] as usize % spec.classes);
            pixels.extend(sample);
        }
        Self { spec, pixels, labels }
    }

    /// Read the CIFAR binary distribution from `dir`.
    ///
    /// CIFAR-10 records are `<label><3072 pixels>` in `data_batch_{1..5}.bin`
    /// (train) or `test_batch.bin`; CIFAR-100 records are
    /// `<coarse><fine><3072 pixels>` in `train.bin` / `test.bin`.
    pub fn from_cifar_dir(name: DatasetName, dir: &Path, train: bool) -> Result<Self> {
        let spec = name.spec();
        let (files, label_bytes): (Vec<String>, usize) = match (name, train) {
            (DatasetName::Cifar10, true) => ((1..=5).map(|i| format!("data_batch_{i}.bin")).collect(), 1),
            (DatasetName::Cifar10, false) => (vec!["test_batch.bin".to_string()], 1),
            (DatasetName::Cifar100, true) => (vec!["train.bin".to_string()], 2),
            (DatasetName::Cifar100, false) => (vec!["test.bin".to_string()], 2),
            (DatasetName::Synthetic, _) => return Err(PolError::UnknownDataset("SYNTHETIC has no files".to_string())),
        };

        let record = label_bytes + spec.input_dim();
        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for file in files {
            let path = dir.join(file);
            if !path.exists() {
                return Err(PolError::missing("dataset file", path));
            }
            let bytes = std::fs::read(&path)?;
            if bytes.len() % record != 0 {
                return Err(PolError::format(&path, format!("length {} is not a multiple of {record}", bytes.len())));
            }
            for chunk in bytes.chunks_exact(record) {
                labels.push(chunk[label_bytes - 1] as usize);
                pixels.extend_from_slice(&chunk[label_bytes..]);
            }
        }
        Self::new(spec, pixels, labels)
    }
}

impl Dataset for ImageDataset {
    fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn raw(&self, idx: usize) -> Result<(&[u8], usize)> {
        let len = self.len();
        let label = *self.labels.get(idx).ok_or(PolError::IndexOutOfRange { index: idx, len })?;
        let dim = self.spec.input_dim();
        Ok((&self.pixels[idx * dim..(idx + 1) * dim], label))
    }
}

pub const SYNTHETIC_LEN: usize = 512;

/// Load the training (or test) split of a named dataset.
///
/// The CIFAR sets are read from `data_dir`; the synthetic set needs no files.
pub fn load_dataset(name: DatasetName, train: bool, data_dir: Option<&Path>) -> Result<ImageDataset> {
    match name {
        DatasetName::Synthetic => Ok(ImageDataset::synthetic(name.spec(), SYNTHETIC_LEN)),
        _ => {
            let dir = data_dir.ok_or_else(|| PolError::missing("dataset directory", format!("<{name} data dir>")))?;
            ImageDataset::from_cifar_dir(name, dir, train)
        }
    }
}
