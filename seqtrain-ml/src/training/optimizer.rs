//! Gradient-descent optimizer adapter with parameter groups.
//!
//! The adapter owns the per-group hyperparameters and the per-parameter
//! moment buffers; the model owns the parameter values and gradients. State
//! is serializable so a checkpoint can restore momentum exactly.
//!
//! Decoupled weight decay (SGDW, AdamW) shrinks the weights by
//! `weight_decay * p` on every step, independent of the learning rate. This is
//! why the plateau scheduler anneals the decay together with the rate for
//! those optimizers.

use crate::error::{MlError, Result};
use crate::model::Parameter;
use serde::{Deserialize, Serialize};
use std::mem;

/// Global gradient-norm bound applied before every update.
pub const DEFAULT_GRAD_CLIP_NORM: f64 = 5.0;

/// Optimizer family and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd {
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        weight_decay: f64,
        #[serde(default)]
        nesterov: bool,
    },
    #[serde(rename = "sgdw")]
    SgdW {
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        weight_decay: f64,
    },
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
        #[serde(default)]
        weight_decay: f64,
    },
    #[serde(rename = "adamw")]
    AdamW {
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
        #[serde(default)]
        weight_decay: f64,
    },
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::sgd()
    }
}

impl OptimizerKind {
    /// Plain SGD without momentum or decay.
    pub fn sgd() -> Self {
        Self::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }

    pub fn sgdw(momentum: f64, weight_decay: f64) -> Self {
        Self::SgdW {
            momentum,
            weight_decay,
        }
    }

    pub fn adam() -> Self {
        Self::Adam {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }

    pub fn adamw(weight_decay: f64) -> Self {
        Self::AdamW {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sgd { .. } => "sgd",
            Self::SgdW { .. } => "sgdw",
            Self::Adam { .. } => "adam",
            Self::AdamW { .. } => "adamw",
        }
    }

    pub fn weight_decay(&self) -> f64 {
        match *self {
            Self::Sgd { weight_decay, .. }
            | Self::SgdW { weight_decay, .. }
            | Self::Adam { weight_decay, .. }
            | Self::AdamW { weight_decay, .. } => weight_decay,
        }
    }

    /// True for optimizers whose weight decay is applied outside the gradient.
    pub fn uses_decoupled_weight_decay(&self) -> bool {
        matches!(self, Self::SgdW { .. } | Self::AdamW { .. })
    }
}

/// A set of parameters sharing a learning rate and weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    /// Indices into the model's parameter slice.
    pub params: Vec<usize>,
    pub lr: f64,
    pub weight_decay: f64,
}

/// Serializable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub groups: Vec<ParamGroup>,
    pub step_count: u64,
    pub first_moments: Vec<Vec<f64>>,
    pub second_moments: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    groups: Vec<ParamGroup>,
    step_count: u64,
    first_moments: Vec<Vec<f64>>,
    second_moments: Vec<Vec<f64>>,
}

impl Optimizer {
    /// One group spanning every parameter.
    pub fn new(kind: OptimizerKind, params: &[Parameter], learning_rate: f64) -> Self {
        let group = ParamGroup {
            name: "default".to_string(),
            params: (0..params.len()).collect(),
            lr: learning_rate,
            weight_decay: kind.weight_decay(),
        };
        Self::from_parts(kind, vec![group], params.len())
    }

    /// Explicit groups. Every parameter index must be in range and belong to
    /// at most one group.
    pub fn with_groups(
        kind: OptimizerKind,
        params: &[Parameter],
        groups: Vec<ParamGroup>,
    ) -> Result<Self> {
        if groups.is_empty() {
            return Err(MlError::invalid_input("optimizer needs at least one group"));
        }
        let mut seen = vec![false; params.len()];
        for group in &groups {
            for &idx in &group.params {
                match seen.get_mut(idx) {
                    None => {
                        return Err(MlError::invalid_input(format!(
                            "group '{}' references parameter {idx}, model has {}",
                            group.name,
                            params.len()
                        )));
                    }
                    Some(true) => {
                        return Err(MlError::invalid_input(format!(
                            "parameter {idx} is in more than one group"
                        )));
                    }
                    Some(flag) => *flag = true,
                }
            }
        }
        Ok(Self::from_parts(kind, groups, params.len()))
    }

    fn from_parts(kind: OptimizerKind, groups: Vec<ParamGroup>, n_params: usize) -> Self {
        Self {
            kind,
            groups,
            step_count: 0,
            first_moments: vec![Vec::new(); n_params],
            second_moments: vec![Vec::new(); n_params],
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn uses_decoupled_weight_decay(&self) -> bool {
        self.kind.uses_decoupled_weight_decay()
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Rate of the first group; groups are kept in sync for scheduling.
    pub fn learning_rate(&self) -> f64 {
        self.groups.first().map(|g| g.lr).unwrap_or(0.0)
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn zero_gradients(&self, params: &mut [Parameter]) {
        params.iter_mut().for_each(Parameter::zero_grad);
    }

    /// Apply one update from the gradients currently stored in `params`.
    pub fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        if params.len() != self.first_moments.len() {
            return Err(MlError::training(format!(
                "optimizer was built for {} parameters, got {}",
                self.first_moments.len(),
                params.len()
            )));
        }
        self.step_count += 1;
        let t = self.step_count as i32;
        let kind = self.kind;
        let groups = mem::take(&mut self.groups);

        for group in &groups {
            for &idx in &group.params {
                let param = &mut params[idx];
                let first = &mut self.first_moments[idx];
                let second = &mut self.second_moments[idx];
                ensure_slot(first, param.len());
                match kind {
                    OptimizerKind::Sgd {
                        momentum, nesterov, ..
                    } => sgd_update(param, first, group.lr, momentum, group.weight_decay, nesterov),
                    OptimizerKind::SgdW { momentum, .. } => {
                        decay_weights(param, group.weight_decay);
                        sgd_update(param, first, group.lr, momentum, 0.0, false);
                    }
                    OptimizerKind::Adam {
                        beta1, beta2, eps, ..
                    } => {
                        ensure_slot(second, param.len());
                        adam_update(
                            param,
                            first,
                            second,
                            t,
                            group.lr,
                            (beta1, beta2, eps),
                            group.weight_decay,
                        );
                    }
                    OptimizerKind::AdamW {
                        beta1, beta2, eps, ..
                    } => {
                        ensure_slot(second, param.len());
                        decay_weights(param, group.weight_decay);
                        adam_update(param, first, second, t, group.lr, (beta1, beta2, eps), 0.0);
                    }
                }
            }
        }

        self.groups = groups;
        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            groups: self.groups.clone(),
            step_count: self.step_count,
            first_moments: self.first_moments.clone(),
            second_moments: self.second_moments.clone(),
        }
    }

    /// Restore a saved state. The optimizer family, group count and parameter
    /// count must match the running optimizer.
    pub fn restore(&mut self, state: OptimizerState) -> Result<()> {
        if mem::discriminant(&state.kind) != mem::discriminant(&self.kind) {
            return Err(MlError::invalid_input(format!(
                "saved optimizer state is for '{}', running '{}'",
                state.kind.name(),
                self.kind.name()
            )));
        }
        if state.groups.len() != self.groups.len() {
            return Err(MlError::invalid_input(format!(
                "saved optimizer state has {} groups, running optimizer has {}",
                state.groups.len(),
                self.groups.len()
            )));
        }
        if state.first_moments.len() != self.first_moments.len()
            || state.second_moments.len() != self.second_moments.len()
        {
            return Err(MlError::invalid_input(
                "saved optimizer state was built for a different parameter count",
            ));
        }
        self.kind = state.kind;
        self.groups = state.groups;
        self.step_count = state.step_count;
        self.first_moments = state.first_moments;
        self.second_moments = state.second_moments;
        Ok(())
    }
}

fn ensure_slot(slot: &mut Vec<f64>, len: usize) {
    if slot.len() != len {
        slot.clear();
        slot.resize(len, 0.0);
    }
}

fn decay_weights(param: &mut Parameter, weight_decay: f64) {
    if weight_decay != 0.0 {
        param.value.iter_mut().for_each(|p| *p -= weight_decay * *p);
    }
}

fn sgd_update(
    param: &mut Parameter,
    buf: &mut [f64],
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    nesterov: bool,
) {
    for i in 0..param.len() {
        let mut g = param.grad[i];
        if weight_decay != 0.0 {
            g += weight_decay * param.value[i];
        }
        if momentum != 0.0 {
            buf[i] = momentum * buf[i] + g;
            g = if nesterov { g + momentum * buf[i] } else { buf[i] };
        }
        param.value[i] -= lr * g;
    }
}

fn adam_update(
    param: &mut Parameter,
    m: &mut [f64],
    v: &mut [f64],
    t: i32,
    lr: f64,
    (beta1, beta2, eps): (f64, f64, f64),
    weight_decay: f64,
) {
    let bias_correction1 = 1.0 - beta1.powi(t);
    let bias_correction2 = 1.0 - beta2.powi(t);
    for i in 0..param.len() {
        let mut g = param.grad[i];
        if weight_decay != 0.0 {
            g += weight_decay * param.value[i];
        }
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
        let m_hat = m[i] / bias_correction1;
        let v_hat = v[i] / bias_correction2;
        param.value[i] -= lr * m_hat / (v_hat.sqrt() + eps);
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [Parameter], max_norm: f64) -> f64 {
    let total = params
        .iter()
        .flat_map(|p| p.grad.iter())
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt();
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        params
            .iter_mut()
            .flat_map(|p| p.grad.iter_mut())
            .for_each(|g| *g *= coef);
    }
    total
}
