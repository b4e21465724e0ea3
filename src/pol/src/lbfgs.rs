//! Limited-memory BFGS without line search.
//!
//! Follows the fixed-step update used by common deep-learning optimizers:
//! the first step is scaled by `min(1, 1/|g|_1)`, later steps use `lr`
//! directly, and the search direction comes from the two-loop recursion
//! over the stored curvature pairs.

use std::collections::VecDeque;

use crate::error::{PolError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Lbfgs {
    pub lr: f32,
    pub max_iter: usize,
    pub tolerance_grad: f32,
    pub tolerance_change: f32,
    pub history_size: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self { lr: 1.0, max_iter: 20, tolerance_grad: 1e-7, tolerance_change: 1e-9, history_size: 100 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LbfgsSummary {
    pub iterations: usize,
    pub initial_loss: f32,
    pub final_loss: f32,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn max_abs(v: &[f32]) -> f32 {
    v.iter().fold(0.0f32, |m, x| m.max(x.abs()))
}

/// Two-loop recursion: approximate `-H g` from the curvature history.
fn direction(gradient: &[f32], history: &VecDeque<(Vec<f32>, Vec<f32>)>, h_diag: f32) -> Vec<f32> {
    let mut q: Vec<f32> = gradient.iter().map(|g| -g).collect();
    let mut alpha = vec![0.0f32; history.len()];
    let rho: Vec<f32> = history.iter().map(|(s, y)| 1.0 / dot(y, s)).collect();

    // newest first
    for (i, (s, y)) in history.iter().enumerate().rev() {
        alpha[i] = rho[i] * dot(s, &q);
        q.iter_mut().zip(y).for_each(|(q, y)| *q -= alpha[i] * y);
    }

    let mut r: Vec<f32> = q.into_iter().map(|q| q * h_diag).collect();
    for (i, (s, y)) in history.iter().enumerate() {
        let beta = rho[i] * dot(y, &r);
        r.iter_mut().zip(s).for_each(|(r, s)| *r += s * (alpha[i] - beta));
    }
    r
}

/// Curvature history carried between successive `minimize_with` calls.
#[derive(Clone, Debug)]
pub struct LbfgsState {
    history: VecDeque<(Vec<f32>, Vec<f32>)>,
    h_diag: f32,
    /// Gradient before the last step, and the step itself.
    prev: Option<(Vec<f32>, Vec<f32>)>,
    /// Iterations taken over the lifetime of the state.
    iterations: usize,
}

impl Default for LbfgsState {
    fn default() -> Self {
        Self { history: VecDeque::new(), h_diag: 1.0, prev: None, iterations: 0 }
    }
}

impl LbfgsState {
    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl Lbfgs {
    /// Minimize `f` starting from `x`, updating `x` in place.
    ///
    /// `f` returns the loss and its gradient at the given point.
    pub fn minimize<F>(&self, x: &mut [f32], f: F) -> Result<LbfgsSummary>
    where
        F: FnMut(&[f32]) -> Result<(f32, Vec<f32>)>,
    {
        self.minimize_with(&mut LbfgsState::default(), x, f)
    }

    /// Like `minimize`, but resumes from `state` and leaves it ready for the
    /// next call. Only the first iteration of a fresh state is rescaled.
    pub fn minimize_with<F>(&self, state: &mut LbfgsState, x: &mut [f32], mut f: F) -> Result<LbfgsSummary>
    where
        F: FnMut(&[f32]) -> Result<(f32, Vec<f32>)>,
    {
        if let Some((_, step)) = &state.prev {
            if step.len() != x.len() {
                return Err(PolError::shape_mismatch(
                    format!("point of length {}", step.len()),
                    format!("length {}", x.len()),
                ));
            }
        }
        let mut eval = |x: &[f32]| -> Result<(f32, Vec<f32>)> {
            let (loss, grad) = f(x)?;
            if grad.len() != x.len() {
                return Err(PolError::shape_mismatch(
                    format!("gradient of length {}", x.len()),
                    format!("length {}", grad.len()),
                ));
            }
            Ok((loss, grad))
        };

        let (initial_loss, mut grad) = eval(&*x)?;
        let mut loss = initial_loss;
        let mut summary = LbfgsSummary { iterations: 0, initial_loss, final_loss: loss };
        if max_abs(&grad) <= self.tolerance_grad {
            return Ok(summary);
        }

        while summary.iterations < self.max_iter {
            summary.iterations += 1;
            state.iterations += 1;

            if let Some((prev_grad, step)) = state.prev.take() {
                let y: Vec<f32> = grad.iter().zip(&prev_grad).map(|(g, p)| g - p).collect();
                let ys = dot(&y, &step);
                if ys > 1e-10 {
                    if state.history.len() == self.history_size {
                        state.history.pop_front();
                    }
                    state.h_diag = ys / dot(&y, &y);
                    state.history.push_back((step, y));
                }
            }
            let d = direction(&grad, &state.history, state.h_diag);

            let t = if state.iterations == 1 {
                let l1: f32 = grad.iter().map(|g| g.abs()).sum();
                (1.0f32).min(1.0 / l1) * self.lr
            } else {
                self.lr
            };

            if dot(&grad, &d) > -self.tolerance_change {
                break;
            }

            let step: Vec<f32> = d.iter().map(|d| d * t).collect();
            x.iter_mut().zip(&step).for_each(|(x, s)| *x += s);
            if summary.iterations == self.max_iter {
                state.prev = Some((grad, step));
                break;
            }

            let prev_loss = loss;
            let (next_loss, next_grad) = eval(&*x)?;
            loss = next_loss;
            summary.final_loss = loss;
            let small_step = max_abs(&step) <= self.tolerance_change;
            state.prev = Some((std::mem::replace(&mut grad, next_grad), step));

            if max_abs(&grad) <= self.tolerance_grad
                || small_step
                || (loss - prev_loss).abs() < self.tolerance_change
            {
                break;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // f(x) = sum_i c_i (x_i - m_i)^2
    fn quadratic(x: &[f32]) -> Result<(f32, Vec<f32>)> {
        let c = [1.0f32, 4.0, 0.5];
        let m = [3.0f32, -1.0, 2.0];
        let loss = x.iter().zip(c.iter().zip(&m)).map(|(x, (c, m))| c * (x - m) * (x - m)).sum();
        let grad = x.iter().zip(c.iter().zip(&m)).map(|(x, (c, m))| 2.0 * c * (x - m)).collect();
        Ok((loss, grad))
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut x = vec![0.0f32; 3];
        let opt = Lbfgs { max_iter: 50, ..Lbfgs::default() };
        let summary = opt.minimize(&mut x, quadratic).unwrap();
        assert!(summary.final_loss < 1e-4 * summary.initial_loss, "{summary:?}");
        assert!((x[0] - 3.0).abs() < 1e-2 && (x[1] + 1.0).abs() < 1e-2 && (x[2] - 2.0).abs() < 1e-2);
    }

    #[test]
    fn test_stops_immediately_at_optimum() {
        let mut x = vec![3.0f32, -1.0, 2.0];
        let summary = Lbfgs::default().minimize(&mut x, quadratic).unwrap();
        assert_eq!(summary.iterations, 0);
        assert_eq!(x, vec![3.0, -1.0, 2.0]);
    }

    #[test]
    fn test_first_step_is_scaled_by_gradient_l1() {
        let mut x = vec![0.0f32; 3];
        let opt = Lbfgs { max_iter: 1, ..Lbfgs::default() };
        opt.minimize(&mut x, quadratic).unwrap();
        // g0 = (-6, 8, -2), |g0|_1 = 16
        assert!((x[0] - 6.0 / 16.0).abs() < 1e-6);
        assert!((x[1] + 8.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_gradient_of_wrong_length() {
        let mut x = vec![0.0f32; 2];
        let result = Lbfgs::default().minimize(&mut x, |_| Ok((1.0, vec![1.0])));
        assert!(matches!(result, Err(PolError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_state_carries_curvature_across_calls() {
        let opt = Lbfgs { max_iter: 2, ..Lbfgs::default() };
        let mut joined = vec![0.0f32; 3];
        opt.minimize(&mut joined, quadratic).unwrap();

        let single = Lbfgs { max_iter: 1, ..Lbfgs::default() };
        let mut state = LbfgsState::default();
        let mut resumed = vec![0.0f32; 3];
        single.minimize_with(&mut state, &mut resumed, quadratic).unwrap();
        single.minimize_with(&mut state, &mut resumed, quadratic).unwrap();
        assert_eq!(state.iterations(), 2);
        assert_eq!(resumed, joined);

        // a fresh state rescales the first step again
        let mut restarted = vec![0.0f32; 3];
        single.minimize(&mut restarted, quadratic).unwrap();
        single.minimize(&mut restarted, quadratic).unwrap();
        assert_ne!(restarted, joined);
    }

    #[test]
    fn test_state_rejects_point_of_other_length() {
        let opt = Lbfgs { max_iter: 1, ..Lbfgs::default() };
        let mut state = LbfgsState::default();
        opt.minimize_with(&mut state, &mut [0.0f32; 3], quadratic).unwrap();
        let result = opt.minimize_with(&mut state, &mut [0.0f32; 2], |_| Ok((1.0, vec![1.0, 1.0])));
        assert!(matches!(result, Err(PolError::ShapeMismatch { .. })));
    }
}
