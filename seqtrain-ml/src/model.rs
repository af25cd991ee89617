//! The trainable-model capability consumed by the training loop.
//!
//! The loop never looks inside a model: it asks for a loss on a batch, asks
//! for gradients, and hands the parameter buffers to the optimizer. Parameters
//! are flat `f64` buffers with a gradient buffer of the same length.

use crate::error::{MlError, Result};
use crate::training::metrics::Metric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A named trainable tensor, stored flat.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Vec<f64>,
    pub grad: Vec<f64>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Vec<f64>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Serializable snapshot of a model's weights, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: BTreeMap<String, Vec<f64>>,
}

impl ModelState {
    pub fn from_parameters(params: &[Parameter]) -> Self {
        Self {
            tensors: params
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
        }
    }

    /// Copy the snapshot into `params`. Every parameter must be present with
    /// a matching length; gradients are cleared.
    pub fn apply_to(&self, params: &mut [Parameter]) -> Result<()> {
        for param in params.iter() {
            match self.tensors.get(&param.name) {
                None => {
                    return Err(MlError::model(format!(
                        "state has no tensor for parameter '{}'",
                        param.name
                    )));
                }
                Some(values) if values.len() != param.len() => {
                    return Err(MlError::model(format!(
                        "tensor '{}' has {} values, parameter expects {}",
                        param.name,
                        values.len(),
                        param.len()
                    )));
                }
                Some(_) => {}
            }
        }
        for param in params.iter_mut() {
            if let Some(values) = self.tensors.get(&param.name) {
                param.value.copy_from_slice(values);
                param.zero_grad();
            }
        }
        Ok(())
    }
}

/// Whether the model is updating weights or being scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    Train,
    Eval,
}

/// A model the training loop can drive.
pub trait TrainableModel {
    type Example: Clone;

    /// Mean loss over `batch`. Implementations keep whatever `backward` needs.
    fn forward_loss(&mut self, batch: &[Self::Example]) -> Result<f64>;

    /// Accumulate gradients of the last `forward_loss` into the parameters.
    fn backward(&mut self) -> Result<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn set_mode(&mut self, mode: ModelMode);

    /// Score `data` and return the metric plus the mean loss. When `out_path`
    /// is given, per-example predictions are written there.
    fn evaluate(
        &mut self,
        data: &[Self::Example],
        batch_size: usize,
        out_path: Option<&Path>,
    ) -> Result<(Metric, f64)>;

    fn state(&self) -> ModelState {
        ModelState::from_parameters(self.parameters())
    }

    fn load_state(&mut self, state: &ModelState) -> Result<()> {
        state.apply_to(self.parameters_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_parameters() {
        let mut params = vec![
            Parameter::new("weight", vec![1.0, 2.0, 3.0]),
            Parameter::new("bias", vec![0.5]),
        ];
        let state = ModelState::from_parameters(&params);

        params[0].value = vec![0.0; 3];
        params[0].grad = vec![9.0; 3];
        state.apply_to(&mut params).unwrap();

        assert_eq!(params[0].value, vec![1.0, 2.0, 3.0]);
        assert_eq!(params[0].grad, vec![0.0; 3]);
    }

    #[test]
    fn test_apply_rejects_missing_tensor() {
        let mut params = vec![Parameter::new("weight", vec![1.0])];
        let state = ModelState::default();
        assert!(matches!(
            state.apply_to(&mut params),
            Err(MlError::Model(_))
        ));
    }

    #[test]
    fn test_apply_rejects_shape_mismatch_without_partial_write() {
        let mut params = vec![
            Parameter::new("a", vec![1.0]),
            Parameter::new("b", vec![1.0, 1.0]),
        ];
        let mut state = ModelState::default();
        state.tensors.insert("a".into(), vec![7.0]);
        state.tensors.insert("b".into(), vec![7.0]);

        assert!(state.apply_to(&mut params).is_err());
        assert_eq!(params[0].value, vec![1.0]);
    }
}
