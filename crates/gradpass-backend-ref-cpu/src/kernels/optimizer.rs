//! Dense parameter updates.
//!
//! Each update is written once as a row function over equally sized slices; the dense
//! kernels apply it to the whole parameter and the lazy kernels in
//! [`super::indexed_slices`] apply it to the rows a sparse gradient touches. A row
//! updated both ways therefore produces identical bits.

use num_traits::Float;

use crate::kernels::KernelError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams<T> {
    pub learning_rate: T,
    pub weight_decay: T,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumParams<T> {
    pub learning_rate: T,
    pub beta: T,
    pub weight_decay: T,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams<T> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub weight_decay: T,
    pub do_bias_correction: bool,
    /// Completed steps before this update; the update is step `train_step + 1`.
    pub train_step: i64,
}

impl<T: Float> AdamParams<T> {
    /// Learning rate with the bias correction of both moments folded in.
    pub fn step_size(&self) -> T {
        if !self.do_bias_correction {
            return self.learning_rate;
        }
        let t = i32::try_from(self.train_step.saturating_add(1)).unwrap_or(i32::MAX);
        let one = T::one();
        self.learning_rate * (one - self.beta2.powi(t)).sqrt() / (one - self.beta1.powi(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsPropParams<T> {
    pub learning_rate: T,
    pub decay_rate: T,
    pub epsilon: T,
    pub weight_decay: T,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LarsParams<T> {
    pub learning_rate: T,
    pub momentum_beta: T,
    pub epsilon: T,
    pub lars_coefficient: T,
    pub weight_decay: T,
}

pub(crate) fn check_len(op: &'static str, expected: usize, actual: usize) -> Result<(), KernelError> {
    if expected == actual {
        return Ok(());
    }
    Err(KernelError::ShapeMismatch {
        op,
        expected: vec![expected],
        actual: vec![actual],
    })
}

pub(crate) fn sgd_row<T: Float>(model: &mut [T], diff: &[T], params: &SgdParams<T>) {
    for (w, g) in model.iter_mut().zip(diff) {
        *w = *w - params.learning_rate * (*g + params.weight_decay * *w);
    }
}

pub(crate) fn momentum_row<T: Float>(
    model: &mut [T],
    momentum: &mut [T],
    diff: &[T],
    params: &MomentumParams<T>,
) {
    for ((w, m), g) in model.iter_mut().zip(momentum.iter_mut()).zip(diff) {
        *m = params.beta * *m - params.learning_rate * (*g + params.weight_decay * *w);
        *w = *w + *m;
    }
}

pub(crate) fn adam_row<T: Float>(
    model: &mut [T],
    m: &mut [T],
    v: &mut [T],
    diff: &[T],
    params: &AdamParams<T>,
    step_size: T,
) {
    let one = T::one();
    for (((w, m), v), g) in model.iter_mut().zip(m.iter_mut()).zip(v.iter_mut()).zip(diff) {
        *m = params.beta1 * *m + (one - params.beta1) * *g;
        *v = params.beta2 * *v + (one - params.beta2) * *g * *g;
        *w = *w
            - step_size * *m / (v.sqrt() + params.epsilon)
            - params.learning_rate * params.weight_decay * *w;
    }
}

pub fn sgd_update<T: Float>(
    model: &mut [T],
    diff: &[T],
    params: &SgdParams<T>,
) -> Result<(), KernelError> {
    check_len("sgd_update", model.len(), diff.len())?;
    sgd_row(model, diff, params);
    Ok(())
}

pub fn momentum_update<T: Float>(
    model: &mut [T],
    momentum: &mut [T],
    diff: &[T],
    params: &MomentumParams<T>,
) -> Result<(), KernelError> {
    check_len("momentum_update", model.len(), diff.len())?;
    check_len("momentum_update", model.len(), momentum.len())?;
    momentum_row(model, momentum, diff, params);
    Ok(())
}

pub fn adam_update<T: Float>(
    model: &mut [T],
    m: &mut [T],
    v: &mut [T],
    diff: &[T],
    params: &AdamParams<T>,
) -> Result<(), KernelError> {
    check_len("adam_update", model.len(), diff.len())?;
    check_len("adam_update", model.len(), m.len())?;
    check_len("adam_update", model.len(), v.len())?;
    adam_row(model, m, v, diff, params, params.step_size());
    Ok(())
}

pub fn rms_prop_update<T: Float>(
    model: &mut [T],
    mean_square: &mut [T],
    diff: &[T],
    params: &RmsPropParams<T>,
) -> Result<(), KernelError> {
    check_len("rms_prop_update", model.len(), diff.len())?;
    check_len("rms_prop_update", model.len(), mean_square.len())?;
    let one = T::one();
    for ((w, ms), g) in model.iter_mut().zip(mean_square.iter_mut()).zip(diff) {
        let g = *g + params.weight_decay * *w;
        *ms = params.decay_rate * *ms + (one - params.decay_rate) * g * g;
        *w = *w - params.learning_rate * g / (*ms + params.epsilon).sqrt();
    }
    Ok(())
}

/// Layer-wise adaptive rate scaling: the step is scaled by `||w|| / ||g||` per parameter.
pub fn lars_update<T: Float>(
    model: &mut [T],
    momentum: &mut [T],
    diff: &[T],
    params: &LarsParams<T>,
) -> Result<(), KernelError> {
    check_len("lars_update", model.len(), diff.len())?;
    check_len("lars_update", model.len(), momentum.len())?;
    let norm = |values: &[T]| values.iter().fold(T::zero(), |acc, v| acc + *v * *v).sqrt();
    let model_norm = norm(model);
    let diff_norm = norm(diff);
    let local_lr = if model_norm > T::zero() && diff_norm > T::zero() {
        params.learning_rate * params.lars_coefficient * model_norm
            / (diff_norm + params.weight_decay * model_norm + params.epsilon)
    } else {
        params.learning_rate
    };
    for ((w, m), g) in model.iter_mut().zip(momentum.iter_mut()).zip(diff) {
        *m = params.momentum_beta * *m + local_lr * (*g + params.weight_decay * *w);
        *w = *w - *m;
    }
    Ok(())
}
