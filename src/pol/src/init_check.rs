//! Initialization verification.
//!
//! The first checkpoint of a proof must look like a fresh draw from the
//! architecture's initialization distribution. Every weight-bearing
//! parameter is tested with a one-sample Kolmogorov-Smirnov test against the
//! distribution its layer rule prescribes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PolError, Result};
use crate::params::{ParamSet, Tensor};
use crate::registry::{Architecture, LayerRole, LayerRules};
use crate::storage::ProofDir;
use crate::verifier::{Verdict, Violation};

pub const DEFAULT_INIT_THRESHOLD: f64 = 0.01;

/// Reference distribution for a parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitRule {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    Default,
    /// Same bound as `Default`, with fan-in taken from the paired weight.
    DefaultBias,
    /// `N(0, sqrt(2 / fan_out))`.
    Resnet,
    /// `N(0, sqrt(2 / fan_in))`.
    ResnetCifar,
}

impl InitRule {
    pub fn name(self) -> &'static str {
        match self {
            InitRule::Default => "default",
            InitRule::DefaultBias => "default_bias",
            InitRule::Resnet => "resnet",
            InitRule::ResnetCifar => "resnet_cifar",
        }
    }
}

impl fmt::Display for InitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What is being tested: a weight on its own, or a bias with its weight.
#[derive(Clone, Copy, Debug)]
pub enum InitTarget<'a> {
    Weight(&'a Tensor),
    Bias { weight: &'a Tensor, bias: &'a Tensor },
}

fn receptive_field(shape: &[usize]) -> usize {
    shape.iter().skip(2).product()
}

pub fn fan_in(shape: &[usize]) -> Result<usize> {
    match shape {
        [_, inputs, ..] => Ok(inputs * receptive_field(shape)),
        _ => Err(PolError::shape_mismatch("a tensor of rank >= 2", format!("{shape:?}"))),
    }
}

pub fn fan_out(shape: &[usize]) -> Result<usize> {
    match shape {
        [outputs, _, ..] => Ok(outputs * receptive_field(shape)),
        _ => Err(PolError::shape_mismatch("a tensor of rank >= 2", format!("{shape:?}"))),
    }
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7
fn erf(x: f64) -> f64 {
    const P: f64 = 0.3275911;
    const A: [f64; 5] = [0.254829592, -0.284496736, 1.421413741, -1.453152027, 1.061405429];
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(x: f64, std: f64) -> f64 {
    0.5 * (1.0 + erf(x / (std * std::f64::consts::SQRT_2)))
}

fn uniform_cdf(x: f64, bound: f64) -> f64 {
    ((x + bound) / (2.0 * bound)).clamp(0.0, 1.0)
}

/// Largest gap between the empirical CDF of `samples` and `cdf`.
pub fn ks_statistic(samples: &[f64], cdf: impl Fn(f64) -> f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len() as f64;
    sorted.iter().enumerate().fold(0.0f64, |d, (i, &x)| {
        let f = cdf(x);
        let below = f - i as f64 / n;
        let above = (i + 1) as f64 / n - f;
        d.max(below).max(above)
    })
}

/// Asymptotic Kolmogorov tail probability with Stephens' small-sample correction.
pub fn ks_p_value(statistic: f64, n: usize) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let sqrt_n = (n as f64).sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * statistic;
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    for k in 1..=100u32 {
        let kf = k as f64;
        let term = (-2.0 * kf * kf * lambda * lambda).exp();
        sum += if k % 2 == 1 { term } else { -term };
        if term < 1e-12 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// KS p-value of `target` under `rule`.
pub fn check_weights_initialization(target: InitTarget<'_>, rule: InitRule) -> Result<f64> {
    let (values, reference) = match target {
        InitTarget::Weight(w) => (w, w),
        InitTarget::Bias { weight, bias } => (bias, weight),
    };
    let shape = reference.shape();
    let samples: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let statistic = match rule {
        InitRule::Default | InitRule::DefaultBias => {
            let bound = 1.0 / (fan_in(shape)? as f64).sqrt();
            ks_statistic(&samples, |x| uniform_cdf(x, bound))
        }
        InitRule::Resnet => {
            let std = (2.0 / fan_out(shape)? as f64).sqrt();
            ks_statistic(&samples, |x| normal_cdf(x, std))
        }
        InitRule::ResnetCifar => {
            let std = (2.0 / fan_in(shape)? as f64).sqrt();
            ks_statistic(&samples, |x| normal_cdf(x, std))
        }
    };
    Ok(ks_p_value(statistic, samples.len()))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitReport {
    /// Parameter name -> p-value, in parameter order.
    pub p_values: Vec<(String, f64)>,
    pub min_p_value: f64,
    pub threshold: f64,
    pub passed: bool,
}

impl InitReport {
    pub fn verdict(&self) -> Verdict {
        if self.passed {
            Verdict::Valid
        } else {
            Verdict::from_violations(vec![Violation::Initialization {
                min_p_value: self.min_p_value,
                threshold: self.threshold,
            }])
        }
    }
}

/// Test every classified parameter of `params` against `arch`'s rules.
pub fn verify_initialization(params: &ParamSet, arch: Architecture, threshold: f64) -> Result<InitReport> {
    let rules = LayerRules::for_family(arch.family())?;
    let mut p_values = Vec::new();
    for (name, tensor) in params.iter() {
        let p = match rules.classify(name, tensor.shape()) {
            Some(LayerRole::Weight(rule)) => check_weights_initialization(InitTarget::Weight(tensor), rule)?,
            Some(LayerRole::Bias(rule)) => {
                let weight_name = name.replace("bias", "weight");
                let weight = params.get(&weight_name).ok_or_else(|| {
                    PolError::shape_mismatch(format!("weight {weight_name} paired with {name}"), "no such parameter")
                })?;
                check_weights_initialization(InitTarget::Bias { weight, bias: tensor }, rule)?
            }
            None => continue,
        };
        debug!(parameter = name, p_value = p, "initialization test");
        p_values.push((name.to_string(), p));
    }

    if p_values.is_empty() {
        return Err(PolError::InvalidRule(format!("no parameter of {arch} matched an initialization rule")));
    }
    let min_p_value = p_values.iter().map(|(_, p)| *p).fold(f64::INFINITY, f64::min);
    let passed = min_p_value >= threshold;
    if passed {
        info!("The proof-of-learning passed the initialization verification.");
    } else {
        info!(
            "The initialized weights do not follow the initialization strategy. \
             The minimum p value is {} < threshold ({}). The proof-of-learning is not valid.",
            min_p_value, threshold
        );
    }
    Ok(InitReport { p_values, min_p_value, threshold, passed })
}

/// Run [`verify_initialization`] on the proof's step-0 checkpoint.
pub fn verify_initialization_dir(proof: &ProofDir, arch: Architecture, threshold: f64) -> Result<InitReport> {
    let initial = proof.load_checkpoint(0)?;
    verify_initialization(&initial.net, arch, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Mlp, Network};
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal, Uniform};

    fn tensor(shape: &[usize], f: impl FnMut() -> f32) -> Tensor {
        let n = shape.iter().product();
        Tensor::from_shape_vec(IxDyn(shape), std::iter::repeat_with(f).take(n).collect()).unwrap()
    }

    #[test]
    fn test_fans() {
        assert_eq!(fan_in(&[64, 16, 3, 3]).unwrap(), 144);
        assert_eq!(fan_out(&[64, 16, 3, 3]).unwrap(), 576);
        assert_eq!(fan_in(&[10, 512]).unwrap(), 512);
        assert!(fan_in(&[10]).is_err());
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-0.5) + 0.5204998778).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_draws_pass_most_trials() {
        let mut rng = StdRng::seed_from_u64(3);
        let bound = 1.0 / (200.0f32).sqrt();
        let uniform = Uniform::new(-bound, bound);
        let passes = (0..100)
            .filter(|_| {
                let w = tensor(&[4, 200], || uniform.sample(&mut rng));
                check_weights_initialization(InitTarget::Weight(&w), InitRule::Default).unwrap() >= 0.05
            })
            .count();
        assert!(passes >= 88, "{passes} / 100 trials passed");
    }

    #[test]
    fn test_normal_draws_pass_and_wrong_scale_fails() {
        let mut rng = StdRng::seed_from_u64(11);
        let shape = [32, 16, 3, 3];
        let std = (2.0 / 144.0f32).sqrt();
        let normal = Normal::new(0.0, std).unwrap();
        let w = tensor(&shape, || normal.sample(&mut rng));
        assert!(check_weights_initialization(InitTarget::Weight(&w), InitRule::ResnetCifar).unwrap() > 0.01);

        // fan_out is twice fan_in here, so the expected spread is narrower
        assert!(check_weights_initialization(InitTarget::Weight(&w), InitRule::Resnet).unwrap() < 1e-6);
    }

    #[test]
    fn test_bias_uses_weight_fan_in() {
        let mut rng = StdRng::seed_from_u64(5);
        let bound = 1.0 / (50.0f32).sqrt();
        let uniform = Uniform::new(-bound, bound);
        let weight = tensor(&[400, 50], || uniform.sample(&mut rng));
        let bias = tensor(&[400], || uniform.sample(&mut rng));
        let p = check_weights_initialization(InitTarget::Bias { weight: &weight, bias: &bias }, InitRule::DefaultBias)
            .unwrap();
        assert!(p > 0.01, "p = {p}");
    }

    #[test]
    fn test_fresh_mlp_passes() {
        let net = Mlp::new(256, 128, 10);
        let params = net.init_params(&mut StdRng::seed_from_u64(2024));
        let report = verify_initialization(&params, Architecture::Mlp, 0.001).unwrap();
        assert_eq!(report.p_values.len(), 4);
        assert!(report.passed, "min p {}", report.min_p_value);
        assert!(report.verdict().is_valid());
    }

    #[test]
    fn test_trained_looking_weights_fail() {
        let net = Mlp::new(256, 128, 10);
        let params = net.init_params(&mut StdRng::seed_from_u64(1)).map(|v| v * 3.0 + 0.01);
        let report = verify_initialization(&params, Architecture::Mlp, DEFAULT_INIT_THRESHOLD).unwrap();
        assert!(!report.passed);
        assert!(matches!(report.verdict().violations(), [Violation::Initialization { .. }]));
    }

    #[test]
    fn test_unmatched_parameters_are_an_error() {
        let mut params = ParamSet::new();
        params.push("bn.running_mean", tensor(&[4], || 0.0));
        assert!(verify_initialization(&params, Architecture::Mlp, 0.01).is_err());
    }
}
