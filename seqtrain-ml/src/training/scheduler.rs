//! Learning-rate schedules: plateau annealing for the training loop and an
//! exponential sweep for the learning-rate finder.

use crate::error::{MlError, Result};
use crate::training::optimizer::Optimizer;
use serde::{Deserialize, Serialize};

/// Whether lower or higher scores are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateauMode {
    Min,
    Max,
}

/// Informational lifecycle of the plateau scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateauPhase {
    /// No score observed yet.
    Warm,
    Monitoring,
    /// The last reduction lowered at least one learning rate.
    Annealed,
    /// A reduction was due but every group already sits at `min_lr`.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    pub mode: PlateauMode,
    pub factor: f64,
    pub patience: usize,
    pub cooldown: usize,
    pub min_lr: f64,
    /// Reductions smaller than this are skipped.
    pub eps: f64,
}

impl PlateauConfig {
    pub fn new(mode: PlateauMode, factor: f64, patience: usize) -> Self {
        Self {
            mode,
            factor,
            patience,
            ..Self::default()
        }
    }
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            mode: PlateauMode::Min,
            factor: 0.5,
            patience: 3,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
        }
    }
}

/// Everything needed to resume the scheduler mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    pub mode: PlateauMode,
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
    pub cooldown_counter: usize,
    pub last_lrs: Vec<f64>,
    pub phase: PlateauPhase,
    pub steps: usize,
}

/// Outcome of one scheduler step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauStep {
    /// The score set a new best.
    pub improved: bool,
    /// At least one group's learning rate was lowered.
    pub reduced: bool,
    pub bad_epochs: usize,
    pub learning_rates: Vec<f64>,
}

/// Reduce-on-plateau scheduler.
///
/// With `scale_weight_decay` set (decoupled-decay optimizers) each group's
/// weight decay is multiplied by the same factor as its learning rate.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    scale_weight_decay: bool,
    state: PlateauState,
}

impl PlateauScheduler {
    pub fn new(config: PlateauConfig, scale_weight_decay: bool) -> Result<Self> {
        if !(config.factor > 0.0 && config.factor < 1.0) {
            return Err(MlError::config(format!(
                "anneal factor must be in (0, 1), got {}",
                config.factor
            )));
        }
        let state = PlateauState {
            mode: config.mode,
            best: None,
            num_bad_epochs: 0,
            cooldown_counter: 0,
            last_lrs: Vec::new(),
            phase: PlateauPhase::Warm,
            steps: 0,
        };
        Ok(Self {
            config,
            scale_weight_decay,
            state,
        })
    }

    /// Build a scheduler matched to the optimizer's weight-decay style.
    pub fn for_optimizer(config: PlateauConfig, optimizer: &Optimizer) -> Result<Self> {
        Self::new(config, optimizer.uses_decoupled_weight_decay())
    }

    pub fn mode(&self) -> PlateauMode {
        self.config.mode
    }

    pub fn best(&self) -> Option<f64> {
        self.state.best
    }

    pub fn bad_epochs(&self) -> usize {
        self.state.num_bad_epochs
    }

    pub fn phase(&self) -> PlateauPhase {
        self.state.phase
    }

    pub fn scales_weight_decay(&self) -> bool {
        self.scale_weight_decay
    }

    fn is_better(&self, score: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match (self.state.best, self.config.mode) {
            (None, _) => true,
            (Some(best), PlateauMode::Min) => score < best,
            (Some(best), PlateauMode::Max) => score > best,
        }
    }

    /// Observe one epoch's score, annealing `optimizer` when the patience
    /// window is exceeded.
    pub fn step(&mut self, score: f64, optimizer: &mut Optimizer) -> PlateauStep {
        self.state.steps += 1;
        let improved = self.is_better(score);
        if improved {
            self.state.best = Some(score);
            self.state.num_bad_epochs = 0;
            self.state.phase = PlateauPhase::Monitoring;
        } else {
            self.state.num_bad_epochs += 1;
            if self.state.phase == PlateauPhase::Warm {
                self.state.phase = PlateauPhase::Monitoring;
            }
        }

        if self.state.cooldown_counter > 0 {
            self.state.cooldown_counter -= 1;
            self.state.num_bad_epochs = 0;
        }

        let mut reduced = false;
        if self.state.num_bad_epochs > self.config.patience {
            reduced = self.reduce(optimizer);
            self.state.cooldown_counter = self.config.cooldown;
            self.state.num_bad_epochs = 0;
            self.state.phase = if reduced {
                PlateauPhase::Annealed
            } else {
                PlateauPhase::Terminated
            };
        }

        self.state.last_lrs = optimizer.learning_rates();
        PlateauStep {
            improved,
            reduced,
            bad_epochs: self.state.num_bad_epochs,
            learning_rates: self.state.last_lrs.clone(),
        }
    }

    fn reduce(&self, optimizer: &mut Optimizer) -> bool {
        let mut any = false;
        for group in optimizer.groups_mut() {
            let old = group.lr;
            let new = (old * self.config.factor).max(self.config.min_lr);
            if old - new > self.config.eps {
                group.lr = new;
                if self.scale_weight_decay {
                    group.weight_decay *= self.config.factor;
                }
                tracing::debug!(
                    group = %group.name,
                    old_lr = old,
                    new_lr = new,
                    "Reduced learning rate"
                );
                any = true;
            }
        }
        any
    }

    pub fn state(&self) -> PlateauState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: PlateauState) -> Result<()> {
        if state.mode != self.config.mode {
            return Err(MlError::invalid_input(format!(
                "saved scheduler state uses mode {:?}, running scheduler uses {:?}",
                state.mode, self.config.mode
            )));
        }
        self.state = state;
        Ok(())
    }
}

/// Exponential learning-rate sweep from `start` to `end` over `iterations` steps.
#[derive(Debug, Clone)]
pub struct ExpAnnealSchedule {
    start: f64,
    end: f64,
    iterations: usize,
    step: usize,
}

impl ExpAnnealSchedule {
    pub fn new(start: f64, end: f64, iterations: usize) -> Result<Self> {
        if start <= 0.0 || end <= 0.0 {
            return Err(MlError::config("learning-rate sweep bounds must be positive"));
        }
        if iterations == 0 {
            return Err(MlError::config("learning-rate sweep needs at least one iteration"));
        }
        Ok(Self {
            start,
            end,
            iterations,
            step: 0,
        })
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        self.start * (self.end / self.start).powf(step as f64 / self.iterations as f64)
    }

    /// Advance one step and push the new rate into the optimizer.
    pub fn step(&mut self, optimizer: &mut Optimizer) -> f64 {
        self.step += 1;
        let lr = self.lr_at(self.step);
        optimizer.set_learning_rate(lr);
        lr
    }
}
