use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{PolError, Result};

pub type Tensor = ArrayD<f32>;

/// On-disk form of one named parameter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Ordered name -> tensor mapping of every trainable parameter of a network.
///
/// Treated as one long vector for distance computation; two sets are
/// comparable only when their ordered shape sequences are identical.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(try_from = "Vec<NamedTensor>", into = "Vec<NamedTensor>")]
pub struct ParamSet {
    entries: Vec<(String, Tensor)>,
}

impl TryFrom<Vec<NamedTensor>> for ParamSet {
    type Error = String;

    fn try_from(raw: Vec<NamedTensor>) -> std::result::Result<Self, String> {
        let mut set = ParamSet::new();
        for t in raw {
            let tensor = Tensor::from_shape_vec(IxDyn(&t.shape), t.data)
                .map_err(|e| format!("parameter {}: {e}", t.name))?;
            set.push(t.name, tensor);
        }
        Ok(set)
    }
}

impl From<ParamSet> for Vec<NamedTensor> {
    fn from(set: ParamSet) -> Self {
        set.entries
            .into_iter()
            .map(|(name, tensor)| NamedTensor {
                name,
                shape: tensor.shape().to_vec(),
                data: tensor.iter().copied().collect(),
            })
            .collect()
    }
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.push((name.into(), tensor));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.iter().map(|(_, t)| t)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.entries.iter().map(|(_, t)| t.shape().to_vec()).collect()
    }

    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.len()).sum()
    }

    /// Fails with `ShapeMismatch` unless both sets have the same ordered shapes.
    pub fn check_compatible(&self, other: &ParamSet) -> Result<()> {
        let (mine, theirs) = (self.shapes(), other.shapes());
        if mine != theirs {
            return Err(PolError::shape_mismatch(
                format!("{mine:?}"),
                format!("{theirs:?}"),
            ));
        }
        Ok(())
    }

    /// All values concatenated in parameter order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_elements());
        for t in self.tensors() {
            flat.extend(t.iter().copied());
        }
        flat
    }

    /// Rebuild a set with this set's names and shapes from a flat vector.
    pub fn unflatten(&self, flat: &[f32]) -> Result<ParamSet> {
        if flat.len() != self.num_elements() {
            return Err(PolError::shape_mismatch(
                format!("{} values", self.num_elements()),
                format!("{} values", flat.len()),
            ));
        }
        let mut out = ParamSet::new();
        let mut offset = 0;
        for (name, t) in self.iter() {
            let n = t.len();
            let tensor = Tensor::from_shape_vec(t.raw_dim(), flat[offset..offset + n].to_vec())
                .map_err(|e| PolError::shape_mismatch(format!("{:?}", t.shape()), e))?;
            out.push(name, tensor);
            offset += n;
        }
        Ok(out)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> ParamSet {
        ParamSet {
            entries: self
                .entries
                .iter()
                .map(|(n, t)| (n.clone(), t.mapv(&f)))
                .collect(),
        }
    }

    /// Elementwise combination of two compatible sets, keeping this set's names.
    pub fn zip_map(&self, other: &ParamSet, f: impl Fn(f32, f32) -> f32) -> Result<ParamSet> {
        self.check_compatible(other)?;
        let entries = self
            .entries
            .iter()
            .zip(other.entries.iter())
            .map(|((n, a), (_, b))| {
                let mut out = a.clone();
                Zip::from(&mut out).and(b).for_each(|x, &y| *x = f(*x, y));
                (n.clone(), out)
            })
            .collect();
        Ok(ParamSet { entries })
    }

    pub fn add(&self, other: &ParamSet) -> Result<ParamSet> {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &ParamSet) -> Result<ParamSet> {
        self.zip_map(other, |a, b| a - b)
    }

    pub fn scale(&self, factor: f32) -> ParamSet {
        self.map(|x| x * factor)
    }

    pub fn zeros_like(&self) -> ParamSet {
        self.map(|_| 0.0)
    }

    /// Round every value through IEEE binary16.
    pub fn to_half(&self) -> ParamSet {
        self.map(|x| half::f16::from_f32(x).to_f32())
    }

    pub fn squared_norm(&self) -> f64 {
        self.tensors()
            .flat_map(|t| t.iter())
            .map(|&x| (x as f64) * (x as f64))
            .sum()
    }
}

/// A persisted snapshot of all trainable parameters at a given step.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub step: u64,
    pub net: ParamSet,
}

impl Checkpoint {
    pub fn new(step: u64, net: ParamSet) -> Self {
        Self { step, net }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ParamSet {
        let mut set = ParamSet::new();
        set.push(
            "fc1.weight",
            Tensor::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
        );
        set.push("fc1.bias", Tensor::from_shape_vec(IxDyn(&[2]), vec![0.5, -0.5]).unwrap());
        set
    }

    #[test]
    fn test_flatten_keeps_parameter_order() {
        let set = sample_set();
        assert_eq!(set.flatten(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.5, -0.5]);
        assert_eq!(set.num_elements(), 8);
    }

    #[test]
    fn test_unflatten_restores_shapes() {
        let set = sample_set();
        let doubled: Vec<f32> = set.flatten().iter().map(|x| x * 2.0).collect();
        let rebuilt = set.unflatten(&doubled).unwrap();
        assert_eq!(rebuilt.shapes(), set.shapes());
        assert_eq!(rebuilt.get("fc1.bias").unwrap()[[1]], -1.0);
    }

    #[test]
    fn test_sub_rejects_different_architectures() {
        let set = sample_set();
        let mut other = ParamSet::new();
        other.push("fc1.weight", Tensor::zeros(IxDyn(&[3, 2])));
        other.push("fc1.bias", Tensor::zeros(IxDyn(&[2])));
        assert!(matches!(set.sub(&other), Err(PolError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_add_sub_and_scale() {
        let set = sample_set();
        let delta = set.sub(&set.zeros_like()).unwrap().scale(0.5);
        let back = set.add(&delta).unwrap();
        assert_eq!(back.get("fc1.weight").unwrap()[[1, 2]], 9.0);
    }

    #[test]
    fn test_checkpoint_json_roundtrip_keeps_order() {
        let ckpt = Checkpoint::new(100, sample_set());
        let json = serde_json::to_string(&ckpt).unwrap();
        assert!(json.find("fc1.weight").unwrap() < json.find("fc1.bias").unwrap());
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ckpt);
    }

    #[test]
    fn test_checkpoint_rejects_bad_shape() {
        let json = r#"{"step":0,"net":[{"name":"w","shape":[2,2],"data":[1.0]}]}"#;
        assert!(serde_json::from_str::<Checkpoint>(json).is_err());
    }

    #[test]
    fn test_to_half_rounds_values() {
        let mut set = ParamSet::new();
        set.push("w", Tensor::from_shape_vec(IxDyn(&[1]), vec![0.1]).unwrap());
        let rounded = set.to_half().flatten()[0];
        assert!(rounded != 0.1);
        assert!((rounded - 0.1).abs() < 1e-4);
    }
}
