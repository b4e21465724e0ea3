//! Trainable network contract and the built-in reference network.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::RngCore;
use rand_distr::{Distribution, Uniform};

use crate::error::{PolError, Result};
use crate::params::{ParamSet, Tensor};

/// Loss and gradients of one forward/backward pass.
#[derive(Clone, Debug)]
pub struct Gradients {
    pub loss: f32,
    /// d loss / d parameters, same names and shapes as the parameters.
    pub params: ParamSet,
    /// d loss / d inputs, `(batch, features)`.
    pub inputs: Array2<f32>,
}

/// An opaque trainable function of a parameter vector.
///
/// Implementations are stateless: parameters are always passed in, so one
/// network value can serve any number of replays or attack steps.
pub trait Network {
    /// Ordered parameter names and shapes.
    fn param_specs(&self) -> Vec<(String, Vec<usize>)>;

    fn init_params(&self, rng: &mut dyn RngCore) -> ParamSet;

    /// Logits for a `(batch, features)` input matrix.
    fn forward(&self, params: &ParamSet, inputs: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Mean softmax cross-entropy and its gradients.
    fn backward(&self, params: &ParamSet, inputs: ArrayView2<f32>, labels: &[usize]) -> Result<Gradients>;
}

/// Two-layer perceptron: `fc1` -> ReLU -> `fc2`.
#[derive(Clone, Debug)]
pub struct Mlp {
    input_dim: usize,
    hidden: usize,
    classes: usize,
}

struct MlpWeights<'a> {
    w1: ArrayView2<'a, f32>,
    b1: ArrayView1<'a, f32>,
    w2: ArrayView2<'a, f32>,
    b2: ArrayView1<'a, f32>,
}

impl Mlp {
    pub fn new(input_dim: usize, hidden: usize, classes: usize) -> Self {
        Self { input_dim, hidden, classes }
    }

    fn weights<'a>(&self, params: &'a ParamSet) -> Result<MlpWeights<'a>> {
        let expected: Vec<Vec<usize>> = self.param_specs().into_iter().map(|(_, s)| s).collect();
        if params.shapes() != expected {
            return Err(PolError::shape_mismatch(format!("{expected:?}"), format!("{:?}", params.shapes())));
        }
        let view2 = |name: &str| -> Result<ArrayView2<'a, f32>> {
            param(params, name)?
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| PolError::shape_mismatch(name, e))
        };
        let view1 = |name: &str| -> Result<ArrayView1<'a, f32>> {
            param(params, name)?
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|e| PolError::shape_mismatch(name, e))
        };
        Ok(MlpWeights {
            w1: view2("fc1.weight")?,
            b1: view1("fc1.bias")?,
            w2: view2("fc2.weight")?,
            b2: view1("fc2.bias")?,
        })
    }

    fn check_inputs(&self, inputs: &ArrayView2<f32>) -> Result<()> {
        if inputs.ncols() != self.input_dim {
            return Err(PolError::shape_mismatch(
                format!("{} input features", self.input_dim),
                format!("{} input features", inputs.ncols()),
            ));
        }
        Ok(())
    }
}

fn param<'a>(params: &'a ParamSet, name: &str) -> Result<&'a Tensor> {
    params
        .get(name)
        .ok_or_else(|| PolError::shape_mismatch(format!("parameter {name}"), "no such parameter"))
}

fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

impl Network for Mlp {
    fn param_specs(&self) -> Vec<(String, Vec<usize>)> {
        vec![
            ("fc1.weight".to_string(), vec![self.hidden, self.input_dim]),
            ("fc1.bias".to_string(), vec![self.hidden]),
            ("fc2.weight".to_string(), vec![self.classes, self.hidden]),
            ("fc2.bias".to_string(), vec![self.classes]),
        ]
    }

    // Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)) for weights and biases alike
    fn init_params(&self, rng: &mut dyn RngCore) -> ParamSet {
        let mut set = ParamSet::new();
        for (fan_in, weight, bias, rows) in [
            (self.input_dim, "fc1.weight", "fc1.bias", self.hidden),
            (self.hidden, "fc2.weight", "fc2.bias", self.classes),
        ] {
            let bound = 1.0 / (fan_in as f32).sqrt();
            let uniform = Uniform::new(-bound, bound);
            let w = Array2::from_shape_fn((rows, fan_in), |_| uniform.sample(&mut *rng));
            let b = Array1::from_shape_fn(rows, |_| uniform.sample(&mut *rng));
            set.push(weight, w.into_dyn());
            set.push(bias, b.into_dyn());
        }
        set
    }

    fn forward(&self, params: &ParamSet, inputs: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_inputs(&inputs)?;
        let w = self.weights(params)?;
        let hidden = (inputs.dot(&w.w1.t()) + &w.b1).mapv(|v| v.max(0.0));
        Ok(hidden.dot(&w.w2.t()) + &w.b2)
    }

    fn backward(&self, params: &ParamSet, inputs: ArrayView2<f32>, labels: &[usize]) -> Result<Gradients> {
        self.check_inputs(&inputs)?;
        if labels.len() != inputs.nrows() {
            return Err(PolError::shape_mismatch(
                format!("{} labels", inputs.nrows()),
                format!("{} labels", labels.len()),
            ));
        }
        if let Some(bad) = labels.iter().find(|&&l| l >= self.classes) {
            return Err(PolError::InvalidConfig(format!("label {bad} outside {} classes", self.classes)));
        }
        let w = self.weights(params)?;
        let batch = inputs.nrows().max(1) as f32;

        let pre = inputs.dot(&w.w1.t()) + &w.b1;
        let hidden = pre.mapv(|v| v.max(0.0));
        let logits = hidden.dot(&w.w2.t()) + &w.b2;
        let probs = softmax_rows(&logits);

        let mut loss = 0.0f32;
        let mut d_logits = probs;
        for (i, &label) in labels.iter().enumerate() {
            loss -= d_logits[[i, label]].max(f32::MIN_POSITIVE).ln();
            d_logits[[i, label]] -= 1.0;
        }
        d_logits /= batch;

        let d_w2 = d_logits.t().dot(&hidden);
        let d_b2 = d_logits.sum_axis(Axis(0));
        let mut d_pre = d_logits.dot(&w.w2);
        d_pre.zip_mut_with(&pre, |g, &z| {
            if z <= 0.0 {
                *g = 0.0;
            }
        });
        let d_w1 = d_pre.t().dot(&inputs);
        let d_b1 = d_pre.sum_axis(Axis(0));
        let d_inputs = d_pre.dot(&w.w1);

        let mut grads = ParamSet::new();
        grads.push("fc1.weight", d_w1.into_dyn());
        grads.push("fc1.bias", d_b1.into_dyn());
        grads.push("fc2.weight", d_w2.into_dyn());
        grads.push("fc2.bias", d_b2.into_dyn());

        Ok(Gradients { loss: loss / batch, params: grads, inputs: d_inputs })
    }
}
