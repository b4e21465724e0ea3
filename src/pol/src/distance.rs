//! Distance engine.
//!
//! All metrics treat a parameter set as a single vector: every tensor is
//! flattened and concatenated in parameter order before the norm is taken.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PolError, Result};
use crate::params::ParamSet;
use crate::storage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    L1,
    L2,
    Linf,
    Cos,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::L1, Metric::L2, Metric::Linf, Metric::Cos];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L1 => "1",
            Metric::L2 => "2",
            Metric::Linf => "inf",
            Metric::Cos => "cos",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = PolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(Metric::L1),
            "2" => Ok(Metric::L2),
            "inf" => Ok(Metric::Linf),
            "cos" => Ok(Metric::Cos),
            other => Err(PolError::UnknownMetric(other.to_string())),
        }
    }
}

impl TryFrom<String> for Metric {
    type Error = PolError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Metric> for String {
    fn from(m: Metric) -> Self {
        m.as_str().to_string()
    }
}

/// Metric name -> distance, in the order the metrics were requested.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistanceRecord {
    pub values: Vec<(Metric, f64)>,
}

impl DistanceRecord {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.iter().find(|(m, _)| *m == metric).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().copied()
    }
}

/// Metric name -> maximum allowed distance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub limits: Vec<(Metric, f64)>,
}

impl ThresholdSet {
    /// Pair metrics with thresholds positionally; both lists must have the same length.
    pub fn new(metrics: &[Metric], thresholds: &[f64]) -> Result<Self> {
        if metrics.len() != thresholds.len() {
            return Err(PolError::InvalidConfig(format!(
                "{} distance metrics but {} thresholds",
                metrics.len(),
                thresholds.len()
            )));
        }
        if let Some(bad) = thresholds.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(PolError::InvalidConfig(format!("threshold {bad} must be a finite non-negative number")));
        }
        Ok(Self {
            limits: metrics.iter().copied().zip(thresholds.iter().copied()).collect(),
        })
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.limits.iter().map(|(m, _)| *m).collect()
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.limits.iter().find(|(m, _)| *m == metric).map(|(_, t)| *t)
    }

    /// Metrics of `record` that are also thresholded and exceed their limit.
    ///
    /// A NaN distance counts as exceeding.
    pub fn violations(&self, record: &DistanceRecord) -> Vec<Metric> {
        record
            .iter()
            .filter(|(m, d)| self.get(*m).map_or(false, |t| exceeds(*d, t)))
            .map(|(m, _)| m)
            .collect()
    }

    pub fn passes(&self, record: &DistanceRecord) -> bool {
        self.violations(record).is_empty()
    }
}

#[allow(clippy::neg_cmp_op_on_partial_ord)]
pub fn exceeds(distance: f64, threshold: f64) -> bool {
    !(distance <= threshold)
}

/// Distances between two compatible parameter sets for every requested metric.
pub fn parameter_distance(a: &ParamSet, b: &ParamSet, metrics: &[Metric]) -> Result<DistanceRecord> {
    a.check_compatible(b)?;
    let (mut l1, mut l2, mut linf) = (0.0f64, 0.0f64, 0.0f64);
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (ta, tb) in a.tensors().zip(b.tensors()) {
        for (&x, &y) in ta.iter().zip(tb.iter()) {
            let (x, y) = (x as f64, y as f64);
            let diff = (x - y).abs();
            l1 += diff;
            l2 += diff * diff;
            linf = linf.max(diff);
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
    }

    let values = metrics
        .iter()
        .map(|&m| {
            let d = match m {
                Metric::L1 => l1,
                Metric::L2 => l2.sqrt(),
                Metric::Linf => linf,
                Metric::Cos => cosine_distance(dot, norm_a, norm_b),
            };
            (m, d)
        })
        .collect();
    Ok(DistanceRecord { values })
}

// 1 - cosine similarity; two zero vectors count as identical direction
fn cosine_distance(dot: f64, norm_a: f64, norm_b: f64) -> f64 {
    if norm_a == 0.0 && norm_b == 0.0 {
        return 0.0;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    (1.0 - similarity).max(0.0)
}

/// Same as [`parameter_distance`] with the recorded side loaded from disk.
///
/// With `half` both sides are rounded through binary16 first.
pub fn checkpoint_distance(
    recorded: &Path,
    reproduced: &ParamSet,
    metrics: &[Metric],
    half: bool,
) -> Result<DistanceRecord> {
    let recorded = storage::load_checkpoint(recorded)?.net;
    if half {
        parameter_distance(&recorded.to_half(), &reproduced.to_half(), metrics)
    } else {
        parameter_distance(&recorded, reproduced, metrics)
    }
}

/// Distance between two on-disk checkpoints.
pub fn stored_distance(a: &Path, b: &Path, metrics: &[Metric], half: bool) -> Result<DistanceRecord> {
    let a = storage::load_checkpoint(a)?.net;
    checkpoint_distance(b, &a, metrics, half)
}
