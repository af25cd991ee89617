//! Configuration types for the seqtrain-ml crate.
//!
//! Loaded through `seqtrain_core::config::load_layered`; every field has a
//! serde default so partial TOML files are valid.

use crate::classifier::TextClassifierConfig;
use crate::error::{MlError, Result};
use crate::training::metrics::EvaluationMetric;
use crate::training::optimizer::{DEFAULT_GRAD_CLIP_NORM, OptimizerKind};
use crate::training::outputs::LEARNING_RATE_FILE;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeqtrainConfig {
    /// Training loop settings.
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// Learning-rate finder settings.
    #[serde(default)]
    pub lr_finder: LrFinderConfig,
    /// Reference classifier settings.
    #[serde(default)]
    pub classifier: TextClassifierConfig,
}

impl SeqtrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.trainer.validate()?;
        self.lr_finder.validate()
    }
}

/// Training loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Aggregate used for model selection and the final score.
    #[serde(default)]
    pub evaluation_metric: EvaluationMetric,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_mini_batch_size")]
    pub mini_batch_size: usize,
    /// Batch size for evaluation; falls back to `mini_batch_size`.
    #[serde(default)]
    pub eval_mini_batch_size: Option<usize>,
    /// Epochs to run in this session.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_anneal_factor")]
    pub anneal_factor: f64,
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Schedule on the training loss (min) instead of the dev score (max).
    #[serde(default = "default_true")]
    pub anneal_against_train_loss: bool,
    /// Fold the dev split into training; disables dev selection.
    #[serde(default)]
    pub train_with_dev: bool,
    /// Also evaluate on the training split each epoch.
    #[serde(default)]
    pub monitor_train: bool,
    /// Save `checkpoint.pt` after every epoch.
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default = "default_true")]
    pub save_final_model: bool,
    /// Reload `best-model.pt` whenever the learning rate drops.
    #[serde(default)]
    pub anneal_with_restarts: bool,
    /// Deterministic batch order (no shuffling).
    #[serde(default)]
    pub test_mode: bool,
    /// Hyperparameter-search mode: write no files.
    #[serde(default)]
    pub param_selection_mode: bool,
    /// Seed for shuffling and weight sampling.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Record sampled weights to `weights.txt`.
    #[serde(default = "default_true")]
    pub snapshot_weights: bool,
    /// Training stops once the learning rate falls below this.
    #[serde(default = "default_min_learning_rate")]
    pub min_learning_rate: f64,
    #[serde(default = "default_grad_clip_norm")]
    pub grad_clip_norm: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            evaluation_metric: EvaluationMetric::default(),
            learning_rate: default_learning_rate(),
            mini_batch_size: default_mini_batch_size(),
            eval_mini_batch_size: None,
            max_epochs: default_max_epochs(),
            anneal_factor: default_anneal_factor(),
            patience: default_patience(),
            anneal_against_train_loss: true,
            train_with_dev: false,
            monitor_train: false,
            checkpoint: false,
            save_final_model: true,
            anneal_with_restarts: false,
            test_mode: false,
            param_selection_mode: false,
            seed: None,
            snapshot_weights: true,
            min_learning_rate: default_min_learning_rate(),
            grad_clip_norm: default_grad_clip_norm(),
            optimizer: OptimizerKind::default(),
        }
    }
}

impl TrainerConfig {
    pub fn eval_batch_size(&self) -> usize {
        self.eval_mini_batch_size.unwrap_or(self.mini_batch_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mini_batch_size == 0 {
            return Err(MlError::config("mini_batch_size must be positive"));
        }
        if self.eval_mini_batch_size == Some(0) {
            return Err(MlError::config("eval_mini_batch_size must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MlError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.anneal_factor > 0.0 && self.anneal_factor < 1.0) {
            return Err(MlError::config(format!(
                "anneal_factor must be in (0, 1), got {}",
                self.anneal_factor
            )));
        }
        if !(self.grad_clip_norm > 0.0) {
            return Err(MlError::config("grad_clip_norm must be positive"));
        }
        if self.min_learning_rate < 0.0 {
            return Err(MlError::config("min_learning_rate must not be negative"));
        }
        Ok(())
    }
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_mini_batch_size() -> usize {
    32
}

fn default_max_epochs() -> usize {
    100
}

fn default_anneal_factor() -> f64 {
    0.5
}

fn default_patience() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_min_learning_rate() -> f64 {
    0.0001
}

fn default_grad_clip_norm() -> f64 {
    DEFAULT_GRAD_CLIP_NORM
}

/// Learning-rate range test configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrFinderConfig {
    #[serde(default = "default_lr_file_name")]
    pub file_name: String,
    #[serde(default = "default_start_learning_rate")]
    pub start_learning_rate: f64,
    #[serde(default = "default_end_learning_rate")]
    pub end_learning_rate: f64,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_mini_batch_size")]
    pub mini_batch_size: usize,
    /// Stop once the smoothed loss exceeds four times the best.
    #[serde(default = "default_true")]
    pub stop_early: bool,
    /// EMA coefficient for the reported loss; 0 disables smoothing.
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_grad_clip_norm")]
    pub grad_clip_norm: f64,
}

impl Default for LrFinderConfig {
    fn default() -> Self {
        Self {
            file_name: default_lr_file_name(),
            start_learning_rate: default_start_learning_rate(),
            end_learning_rate: default_end_learning_rate(),
            iterations: default_iterations(),
            mini_batch_size: default_mini_batch_size(),
            stop_early: true,
            smoothing_factor: default_smoothing_factor(),
            test_mode: false,
            seed: None,
            grad_clip_norm: default_grad_clip_norm(),
        }
    }
}

impl LrFinderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.start_learning_rate > 0.0 && self.end_learning_rate > 0.0) {
            return Err(MlError::config("learning-rate bounds must be positive"));
        }
        if self.iterations == 0 || self.mini_batch_size == 0 {
            return Err(MlError::config(
                "iterations and mini_batch_size must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.smoothing_factor) {
            return Err(MlError::config(format!(
                "smoothing_factor must be in [0, 1), got {}",
                self.smoothing_factor
            )));
        }
        if self.file_name.trim().is_empty() {
            return Err(MlError::config("file_name must not be empty"));
        }
        Ok(())
    }
}

fn default_lr_file_name() -> String {
    LEARNING_RATE_FILE.to_string()
}

fn default_start_learning_rate() -> f64 {
    1e-7
}

fn default_end_learning_rate() -> f64 {
    10.0
}

fn default_iterations() -> usize {
    100
}

fn default_smoothing_factor() -> f64 {
    0.98
}
