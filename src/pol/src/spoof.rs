//! Spoofing attack against checkpoint-distance verification.
//!
//! Starting from a genuine start state `W0'` and a genuine end state `Wt`,
//! the attacker walks the straight line between them in `t` equal steps.
//! Every step is "explained" by synthetic batches whose perturbations are
//! optimized so that the batch gradient vanishes; the batches are logged as
//! a fake dataset, one SGD step per batch is applied, and the network is
//! then overwritten with the linear-path target before the step's
//! checkpoint is persisted.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::ColorType;
use ndarray::{Array2, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SpoofConfig;
use crate::dataset::{Dataset, DatasetSpec};
use crate::distance::{parameter_distance, DistanceRecord, Metric, ThresholdSet};
use crate::error::{PolError, Result};
use crate::init_check::{verify_initialization, InitReport};
use crate::lbfgs::{Lbfgs, LbfgsState};
use crate::network::Network;
use crate::params::{Checkpoint, ParamSet};
use crate::storage::ProofDir;
use crate::train::Sgd;

pub const DATASET_LOG: &str = "dataset.txt";
pub const IMAGE_DIR: &str = "dataset";

// parameter offset for the finite-difference gradient-of-gradient
const HVP_STEP: f32 = 1e-3;

/// Value and perturbation gradient of the gradient-matching objective.
#[derive(Clone, Debug)]
struct MatchEval {
    /// Squared norm of the parameter gradient on the synthetic batch.
    grad_norm_sq: f64,
    /// Squared norm of the perturbation.
    noise_norm_sq: f64,
    objective: f32,
    gradient: Vec<f32>,
}

/// One accepted (or best-effort) synthetic sub-batch.
struct SyntheticBatch {
    inputs: Array2<f32>,
    labels: Vec<usize>,
    accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    /// Synthetically trained state vs. the linear-path target.
    pub organic: DistanceRecord,
    pub replay_valid: bool,
    /// Overwritten state vs. the linear-path target; absent when verification is off.
    pub overwrite: Option<DistanceRecord>,
    pub valid: bool,
    pub degraded_cuts: usize,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceStats {
    pub metric: Metric,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

fn distance_stats(metrics: &[Metric], records: &[&DistanceRecord]) -> Vec<DistanceStats> {
    metrics
        .iter()
        .map(|&metric| {
            let values: Vec<f64> = records.iter().filter_map(|r| r.get(metric)).collect();
            let n = values.len().max(1) as f64;
            DistanceStats {
                metric,
                mean: values.iter().sum::<f64>() / n,
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpoofOutcome {
    pub init: InitReport,
    pub steps: Vec<StepRecord>,
    pub valid_count: usize,
    pub replay_valid_count: usize,
    pub total_steps: usize,
    pub degraded_cuts: usize,
    pub organic_stats: Vec<DistanceStats>,
    pub overwrite_stats: Vec<DistanceStats>,
    pub elapsed_secs: f64,
    pub output_dir: PathBuf,
}

impl SpoofOutcome {
    pub fn init_valid(&self) -> bool {
        self.init.passed
    }

    pub fn degraded(&self) -> bool {
        self.degraded_cuts > 0
    }
}

pub struct SpoofAttacker<'a> {
    network: &'a dyn Network,
    dataset: &'a dyn Dataset,
    config: SpoofConfig,
    thresholds: ThresholdSet,
    rng: StdRng,
}

impl<'a> SpoofAttacker<'a> {
    pub fn new(network: &'a dyn Network, dataset: &'a dyn Dataset, config: SpoofConfig) -> Result<Self> {
        config.validate()?;
        if config.sub_batch() > dataset.len() {
            return Err(PolError::InvalidConfig(format!(
                "sub-batch of {} samples exceeds the dataset size {}",
                config.sub_batch(),
                dataset.len()
            )));
        }
        let thresholds = config.threshold_set()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { network, dataset, config, thresholds, rng })
    }

    /// Load `W0'` and `Wt` from the configured proof directory and attack.
    pub fn run_from_proof(&mut self) -> Result<SpoofOutcome> {
        let proof = ProofDir::open(&self.config.proof_dir)?;
        let start = proof.load_checkpoint(self.config.start_step)?;
        let end = proof.load_checkpoint(self.config.iter)?;
        self.run(&start.net, &end.net)
    }

    /// Forge `t` checkpoints walking from `start` to `end`.
    pub fn run(&mut self, start: &ParamSet, end: &ParamSet) -> Result<SpoofOutcome> {
        let clock = Instant::now();
        let cfg = self.config.clone();
        start.check_compatible(end)?;
        let metrics = self.thresholds.metrics();
        let output_dir = cfg.output_dir();

        info!(
            "|| Wt - W0' || distance: {}",
            parameter_distance(start, end, &[Metric::L2])?.get(Metric::L2).unwrap_or_default()
        );

        let init = verify_initialization(start, cfg.architecture, cfg.init_threshold)?;
        if !init.passed {
            warn!(min_p_value = init.min_p_value, "start state fails the initialization check, not forging");
            return Ok(SpoofOutcome {
                init,
                steps: Vec::new(),
                valid_count: 0,
                replay_valid_count: 0,
                total_steps: cfg.t,
                degraded_cuts: 0,
                organic_stats: Vec::new(),
                overwrite_stats: Vec::new(),
                elapsed_secs: clock.elapsed().as_secs_f64(),
                output_dir,
            });
        }

        let out = ProofDir::create(&output_dir)?;
        let image_dir = output_dir.join(IMAGE_DIR);
        fs::create_dir_all(&image_dir)?;
        out.save_checkpoint(&Checkpoint::new(0, start.clone()))?;
        let mut log = BufWriter::new(File::create(output_dir.join(DATASET_LOG))?);

        let step_weight = end.sub(start)?.scale(1.0 / cfg.t as f32);
        let mut params = start.clone();
        let mut base = self.draw_base()?;
        let mut img_idx = 0usize;
        let mut steps = Vec::with_capacity(cfg.t);
        let mut valid_count = 0;

        for i in 0..cfg.t {
            info!(step = i + 1, total = cfg.t, "forging step");
            let original = params.clone();
            let target = original.add(&step_weight)?;
            let mut optimizer = Sgd::new(cfg.lr, cfg.momentum, cfg.weight_decay);
            let mut degraded_cuts = 0;

            for cut in 0..cfg.cut {
                let batch = self.synthesize(&params, &mut base)?;
                if !batch.accepted {
                    degraded_cuts += 1;
                    warn!(step = i + 1, cut = cut + 1, retries = cfg.retry, "retries exhausted, keeping last attempt");
                }
                for (row, &label) in batch.inputs.rows().into_iter().zip(&batch.labels) {
                    let path = image_dir.join(format!("{img_idx}.png"));
                    save_image(&path, &row.to_vec(), self.dataset.spec())?;
                    writeln!(log, "{} {}", path.display(), label)?;
                    img_idx += 1;
                }
                for (x, y) in batch
                    .inputs
                    .axis_chunks_iter(Axis(0), cfg.batch_size)
                    .zip(batch.labels.chunks(cfg.batch_size))
                {
                    let grads = self.network.backward(&params, x, y)?;
                    params = optimizer.step(&params, &grads.params)?;
                }
            }

            let organic = parameter_distance(&target, &params, &metrics)?;
            let replay_valid = self.thresholds.passes(&organic);
            let (overwrite, valid, checkpoint) = if cfg.verify {
                params = target.clone();
                let overwrite = parameter_distance(&target, &params, &metrics)?;
                let valid = self.thresholds.passes(&overwrite);
                let path = out.save_checkpoint(&Checkpoint::new((cfg.k * (i + 1)) as u64, params.clone()))?;
                (Some(overwrite), valid, Some(path))
            } else {
                (None, false, None)
            };

            for (metric, d) in organic.iter() {
                debug!(step = i + 1, %metric, distance = d, "organic discrepancy");
            }
            valid_count += valid as usize;
            info!("=> valid rate: ({} / {}), total: {}", valid_count, i + 1, cfg.t);

            steps.push(StepRecord {
                step: i + 1,
                organic,
                replay_valid,
                overwrite,
                valid,
                degraded_cuts,
                checkpoint,
            });
        }
        log.flush()?;

        let organic: Vec<&DistanceRecord> = steps.iter().map(|s| &s.organic).collect();
        let overwritten: Vec<&DistanceRecord> = steps.iter().filter_map(|s| s.overwrite.as_ref()).collect();
        let outcome = SpoofOutcome {
            valid_count,
            replay_valid_count: steps.iter().filter(|s| s.replay_valid).count(),
            total_steps: cfg.t,
            degraded_cuts: steps.iter().map(|s| s.degraded_cuts).sum(),
            organic_stats: distance_stats(&metrics, &organic),
            overwrite_stats: if overwritten.is_empty() { Vec::new() } else { distance_stats(&metrics, &overwritten) },
            elapsed_secs: clock.elapsed().as_secs_f64(),
            output_dir,
            init,
            steps,
        };
        log_conclusion(&outcome);
        Ok(outcome)
    }

    /// Draw a fresh base batch of real samples, without replacement.
    fn draw_base(&mut self) -> Result<(Array2<f32>, Vec<usize>)> {
        let indices = rand::seq::index::sample(&mut self.rng, self.dataset.len(), self.config.sub_batch()).into_vec();
        self.dataset.batch(&indices)
    }

    /// Retry loop: optimize a perturbation over `base` until both ceilings hold.
    ///
    /// A failed attempt redraws `base`; when every attempt fails the last
    /// one is returned unaccepted.
    fn synthesize(&mut self, params: &ParamSet, base: &mut (Array2<f32>, Vec<usize>)) -> Result<SyntheticBatch> {
        let network = self.network;
        let (rounds, penalty) = (self.config.round, self.config.noise_penalty);
        let (gd, nd) = (self.config.gd, self.config.nd);
        let lbfgs = Lbfgs { lr: 1.0, max_iter: 10, tolerance_grad: 1e-1, ..Lbfgs::default() };
        let attempts = self.config.retry.max(1);
        let mut last = None;

        for attempt in 0..attempts {
            let (inputs, labels) = &*base;
            let mut delta = vec![0.0f32; inputs.len()];
            let mut state = LbfgsState::default();
            for _ in 0..rounds {
                lbfgs.minimize_with(&mut state, &mut delta, |d| {
                    let eval = gradient_match(network, params, inputs.view(), labels, d, penalty)?;
                    Ok((eval.objective, eval.gradient))
                })?;
            }
            let eval = gradient_match(network, params, inputs.view(), labels, &delta, penalty)?;
            debug!(
                attempt = attempt + 1,
                grad_norm_sq = eval.grad_norm_sq,
                noise_norm_sq = eval.noise_norm_sq,
                "gradient matching"
            );

            let accepted = eval.grad_norm_sq < gd && eval.noise_norm_sq < nd;
            let synthetic = perturbed(inputs.view(), &delta)?;
            last = Some(SyntheticBatch { inputs: synthetic, labels: labels.clone(), accepted });
            if accepted {
                break;
            }
            if attempt + 1 < attempts {
                debug!("retry");
                *base = self.draw_base()?;
            }
        }
        last.ok_or_else(|| PolError::InvalidConfig("no synthesis attempt was made".to_string()))
    }
}

/// `clamp(base + delta, 0, 1)`.
fn perturbed(base: ArrayView2<f32>, delta: &[f32]) -> Result<Array2<f32>> {
    let delta = ArrayView2::from_shape(base.raw_dim(), delta).map_err(|e| PolError::shape_mismatch(format!("{:?}", base.dim()), e))?;
    let mut out = base.to_owned();
    Zip::from(&mut out).and(&delta).for_each(|x, &d| *x = (*x + d).clamp(0.0, 1.0));
    Ok(out)
}

/// `f(delta) = ||grad_theta L(clamp(base + delta))||^2 + penalty * ||delta||^2`.
///
/// The gradient through the parameter gradient is a mixed second derivative;
/// it is taken as a central difference of input gradients along the
/// normalized parameter gradient.
fn gradient_match(
    network: &dyn Network,
    params: &ParamSet,
    base: ArrayView2<f32>,
    labels: &[usize],
    delta: &[f32],
    penalty: f32,
) -> Result<MatchEval> {
    let inputs = perturbed(base, delta)?;
    let grads = network.backward(params, inputs.view(), labels)?;
    let grad_norm_sq = grads.params.squared_norm();
    let noise_norm_sq: f64 = delta.iter().map(|&d| (d as f64) * (d as f64)).sum();

    let mut gradient: Vec<f32> = delta.iter().map(|&d| 2.0 * penalty * d).collect();
    let norm = grad_norm_sq.sqrt() as f32;
    if norm > 0.0 {
        let offset = grads.params.scale(HVP_STEP / norm);
        let plus = network.backward(&params.add(&offset)?, inputs.view(), labels)?;
        let minus = network.backward(&params.sub(&offset)?, inputs.view(), labels)?;
        let scale = norm / (2.0 * HVP_STEP);
        let raw = base.iter().zip(delta);
        for (((g, (&b, &d)), &p), &m) in gradient.iter_mut().zip(raw).zip(plus.inputs.iter()).zip(minus.inputs.iter()) {
            // clamp passes gradient only inside [0, 1]
            if (0.0..=1.0).contains(&(b + d)) {
                *g += 2.0 * scale * (p - m);
            }
        }
    }

    Ok(MatchEval {
        grad_norm_sq,
        noise_norm_sq,
        objective: (grad_norm_sq + penalty as f64 * noise_norm_sq) as f32,
        gradient,
    })
}

/// Write one `[0, 1]` CHW sample as an 8-bit PNG.
fn save_image(path: &Path, features: &[f32], spec: &DatasetSpec) -> Result<()> {
    let plane = spec.height * spec.width;
    let mut pixels = Vec::with_capacity(features.len());
    for p in 0..plane {
        for c in 0..spec.channels {
            pixels.push((features[c * plane + p] * 255.0).round().clamp(0.0, 255.0) as u8);
        }
    }
    let color = match spec.channels {
        1 => ColorType::L8,
        3 => ColorType::Rgb8,
        n => return Err(PolError::InvalidConfig(format!("cannot write {n}-channel images"))),
    };
    image::save_buffer(path, &pixels, spec.width as u32, spec.height as u32, color)?;
    Ok(())
}

fn log_conclusion(outcome: &SpoofOutcome) {
    info!("--------- conclusion ----------");
    if outcome.init_valid() {
        info!("init valid success");
    } else {
        info!("init valid not success");
    }
    info!("valid success steps ({} / {})", outcome.valid_count, outcome.total_steps);
    info!(
        "organically reproducible steps ({} / {})",
        outcome.replay_valid_count, outcome.total_steps
    );
    for s in &outcome.organic_stats {
        info!("order: {} distance: {} min: {} max: {}", s.metric, s.mean, s.min, s.max);
    }
    if outcome.degraded() {
        warn!(degraded_cuts = outcome.degraded_cuts, "some sub-batches missed the acceptance ceilings");
    }
    info!("total time consumed: {:.3}s", outcome.elapsed_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageDataset;
    use crate::network::Mlp;
    use crate::registry::Architecture;

    fn setup(dir: &Path, config: SpoofConfig) -> (Mlp, ImageDataset, SpoofConfig) {
        let net = Mlp::new(64, 8, 4);
        let data = ImageDataset::synthetic(DatasetSpec::synthetic(), 64);
        let config = SpoofConfig {
            dataset: crate::dataset::DatasetName::Synthetic,
            architecture: Architecture::Mlp,
            output_root: dir.to_path_buf(),
            t: 1,
            k: 2,
            batch_size: 4,
            cut: 2,
            retry: 3,
            gd: 1e9,
            nd: 1e9,
            init_threshold: 1e-4,
            ..config
        };
        (net, data, config)
    }

    fn endpoints(net: &Mlp) -> (ParamSet, ParamSet) {
        let start = net.init_params(&mut StdRng::seed_from_u64(9));
        let end = start.map(|v| v * 0.9 + 0.01);
        (start, end)
    }

    #[test]
    fn test_single_step_overwrite_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let (net, data, config) = setup(dir.path(), SpoofConfig::default());
        let (start, end) = endpoints(&net);
        let mut attacker = SpoofAttacker::new(&net, &data, config).unwrap();
        let outcome = attacker.run(&start, &end).unwrap();

        assert!(outcome.init_valid());
        assert_eq!(outcome.valid_count, 1);
        assert_eq!(outcome.degraded_cuts, 0);

        let out = dir.path().join("SYNTHETIC");
        let forged = ProofDir::open(&out).unwrap().load_checkpoint(2).unwrap();
        let d = parameter_distance(&forged.net, &end, &[Metric::Linf]).unwrap();
        assert!(d.get(Metric::Linf).unwrap() < 1e-5);

        // two cuts of four synthetic samples each
        let log = fs::read_to_string(out.join(DATASET_LOG)).unwrap();
        assert_eq!(log.lines().count(), 8);
        assert!(out.join(IMAGE_DIR).join("7.png").exists());
        assert!(out.join("model_step_0").exists());
    }

    #[test]
    fn test_unreachable_ceilings_degrade_but_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (net, data, config) = setup(dir.path(), SpoofConfig::default());
        let config = SpoofConfig { gd: 0.0, retry: 2, ..config };
        let (start, end) = endpoints(&net);
        let outcome = SpoofAttacker::new(&net, &data, config).unwrap().run(&start, &end).unwrap();
        assert!(outcome.degraded());
        assert_eq!(outcome.degraded_cuts, 2);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.valid_count, 1);
    }

    #[test]
    fn test_bad_start_state_stops_before_forging() {
        let dir = tempfile::tempdir().unwrap();
        let (net, data, config) = setup(dir.path(), SpoofConfig::default());
        let (start, end) = endpoints(&net);
        let start = start.map(|v| v * 5.0 + 0.3);
        let outcome = SpoofAttacker::new(&net, &data, config).unwrap().run(&start, &end).unwrap();
        assert!(!outcome.init_valid());
        assert!(outcome.steps.is_empty());
        assert!(!dir.path().join("SYNTHETIC").exists());
    }

    #[test]
    fn test_gradient_match_derivative() {
        let net = Mlp::new(6, 5, 3);
        let params = net.init_params(&mut StdRng::seed_from_u64(4));
        let base = Array2::from_shape_fn((3, 6), |(i, j)| 0.2 + 0.1 * ((i + 2 * j) % 5) as f32);
        let labels = [0, 2, 1];
        let delta: Vec<f32> = (0..18).map(|i| 0.01 * ((i % 7) as f32 - 3.0)).collect();
        let eval = gradient_match(&net, &params, base.view(), &labels, &delta, 0.1).unwrap();

        let eps = 1e-3f32;
        for idx in [0usize, 5, 11, 17] {
            let mut plus = delta.clone();
            let mut minus = delta.clone();
            plus[idx] += eps;
            minus[idx] -= eps;
            let f = |d: &[f32]| {
                let e = gradient_match(&net, &params, base.view(), &labels, d, 0.1).unwrap();
                e.grad_norm_sq + 0.1 * e.noise_norm_sq
            };
            let numeric = (f(&plus) - f(&minus)) / (2.0 * eps as f64);
            let analytic = eval.gradient[idx] as f64;
            assert!(
                (numeric - analytic).abs() < 0.05 * analytic.abs().max(1e-3) + 1e-3,
                "{idx}: {numeric} vs {analytic}"
            );
        }
    }

    #[test]
    fn test_oversized_sub_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (net, data, config) = setup(dir.path(), SpoofConfig::default());
        let config = SpoofConfig { batch_size: 128, ..config };
        assert!(matches!(SpoofAttacker::new(&net, &data, config), Err(PolError::InvalidConfig(_))));
    }
}
