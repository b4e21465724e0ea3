//! The training black box: starting parameters + ordered sample indices +
//! hyperparameters in, ending parameters out.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::{PolError, Result};
use crate::network::Network;
use crate::params::ParamSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    pub lr: f32,
    pub batch_size: usize,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Round parameters through binary16 after every step.
    pub half: bool,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self { lr: 0.01, batch_size: 128, momentum: 0.9, weight_decay: 1e-4, half: false }
    }
}

/// SGD with momentum and weight decay.
///
/// Implements: g = grad + weight_decay * p
///             v = momentum * v + g      (v = g on the first step)
///             p = p - lr * v
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Option<ParamSet>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self { lr, momentum, weight_decay, velocity: None }
    }

    pub fn step(&mut self, params: &ParamSet, grads: &ParamSet) -> Result<ParamSet> {
        let decay = self.weight_decay;
        let mut update = grads.zip_map(params, |g, p| g + decay * p)?;
        if self.momentum != 0.0 {
            let momentum = self.momentum;
            update = match self.velocity.take() {
                Some(v) => v.zip_map(&update, |v, g| momentum * v + g)?,
                None => update,
            };
            self.velocity = Some(update.clone());
        }
        let lr = self.lr;
        params.zip_map(&update, |p, u| p - lr * u)
    }
}

pub trait Trainer {
    /// Run the given index slice, in order, starting from `start`.
    fn train(&self, start: &ParamSet, sequence: &[usize], hyper: &Hyperparams) -> Result<ParamSet>;
}

/// Mini-batch SGD over consecutive `batch_size` chunks of the index slice.
pub struct SgdTrainer<'a> {
    network: &'a dyn Network,
    dataset: &'a dyn Dataset,
}

impl<'a> SgdTrainer<'a> {
    pub fn new(network: &'a dyn Network, dataset: &'a dyn Dataset) -> Self {
        Self { network, dataset }
    }
}

impl Trainer for SgdTrainer<'_> {
    fn train(&self, start: &ParamSet, sequence: &[usize], hyper: &Hyperparams) -> Result<ParamSet> {
        if hyper.batch_size == 0 {
            return Err(PolError::InvalidConfig("batch size must be positive".to_string()));
        }
        let mut optimizer = Sgd::new(hyper.lr, hyper.momentum, hyper.weight_decay);
        let mut params = if hyper.half { start.to_half() } else { start.clone() };

        for (step, batch) in sequence.chunks(hyper.batch_size).enumerate() {
            let (inputs, labels) = self.dataset.batch(batch)?;
            let grads = self.network.backward(&params, inputs.view(), &labels)?;
            params = optimizer.step(&params, &grads.params)?;
            if hyper.half {
                params = params.to_half();
            }
            debug!(step, loss = grads.loss, "training step");
        }
        Ok(params)
    }
}
