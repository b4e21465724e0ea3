use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::dataset::Dataset;
use crate::error::Result;
use crate::storage::ProofDir;
use crate::verifier::{Verdict, Violation};

/// Hex SHA-256 over the canonical strings of the addressed samples, in sequence order.
pub fn dataset_hash(dataset: &dyn Dataset, sequence: &[usize]) -> Result<String> {
    let mut hasher = Sha256::new();
    for &idx in sequence {
        hasher.update(dataset.raw_repr(idx)?.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashReport {
    pub expected: String,
    pub computed: String,
    pub matches: bool,
}

impl HashReport {
    pub fn verdict(&self) -> Verdict {
        if self.matches {
            Verdict::Valid
        } else {
            Verdict::from_violations(vec![Violation::DatasetHash {
                expected: self.expected.clone(),
                computed: self.computed.clone(),
            }])
        }
    }
}

/// Recompute the data hash of a proof and compare it with `hash.txt`.
///
/// A mismatch is reported, not raised; only missing files are errors.
pub fn verify_hash(proof: &ProofDir, dataset: &dyn Dataset) -> Result<HashReport> {
    let sequence = proof.load_indices()?;
    let expected = proof.load_hash()?;
    let computed = dataset_hash(dataset, &sequence)?;
    let matches = expected.eq_ignore_ascii_case(&computed);
    if matches {
        info!("Hash of the proof is valid.");
    } else {
        info!("Hash doesn't match. The proof is invalid");
    }
    Ok(HashReport { expected, computed, matches })
}

/// Record `sequence` and its data hash in the proof directory.
pub fn write_hash(proof: &ProofDir, dataset: &dyn Dataset, sequence: &[usize]) -> Result<String> {
    let digest = dataset_hash(dataset, sequence)?;
    proof.save_indices(sequence)?;
    proof.save_hash(&digest)?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetSpec, ImageDataset};
    use crate::error::PolError;

    #[test]
    fn test_hash_is_deterministic_and_order_sensitive() {
        let data = ImageDataset::synthetic(DatasetSpec::synthetic(), 16);
        let a = dataset_hash(&data, &[1, 2, 3]).unwrap();
        assert_eq!(a, dataset_hash(&data, &[1, 2, 3]).unwrap());
        assert_eq!(a.len(), 64);
        assert_ne!(a, dataset_hash(&data, &[3, 2, 1]).unwrap());
    }

    #[test]
    fn test_empty_sequence_hashes_empty_input() {
        let data = ImageDataset::synthetic(DatasetSpec::synthetic(), 4);
        assert_eq!(
            dataset_hash(&data, &[]).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_written_hash() {
        let dir = tempfile::tempdir().unwrap();
        let proof = ProofDir::create(dir.path()).unwrap();
        let data = ImageDataset::synthetic(DatasetSpec::synthetic(), 32);
        write_hash(&proof, &data, &[4, 8, 15, 16, 23]).unwrap();
        let report = verify_hash(&proof, &data).unwrap();
        assert!(report.matches);
        assert!(report.verdict().is_valid());

        proof.save_hash("00").unwrap();
        let report = verify_hash(&proof, &data).unwrap();
        assert!(!report.matches);
        assert!(matches!(report.verdict().violations(), [Violation::DatasetHash { .. }]));
    }

    #[test]
    fn test_out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let proof = ProofDir::create(dir.path()).unwrap();
        let data = ImageDataset::synthetic(DatasetSpec::synthetic(), 4);
        proof.save_indices(&[0, 9]).unwrap();
        proof.save_hash("ff").unwrap();
        assert!(matches!(verify_hash(&proof, &data), Err(PolError::IndexOutOfRange { index: 9, len: 4 })));
    }
}
