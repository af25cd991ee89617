//! The training loop.
//!
//! [`ModelTrainer`] owns a model and a corpus and runs plateau-annealed
//! mini-batch training: one optimizer step per batch, one scheduler step per
//! epoch, dev-set model selection, optional checkpoints, and a final test of
//! the best model. Progress is reported through an [`EventSink`] and, unless
//! running in parameter-selection mode, the run directory's output files.

use crate::config::TrainerConfig;
use crate::corpus::Corpus;
use crate::error::{MlError, Result};
use crate::model::{ModelMode, TrainableModel};
use crate::training::checkpoint::{CheckpointManager, load_checkpoint};
use crate::training::events::{EventSink, TrainingEvent};
use crate::training::metrics::{EvaluationMetric, Metric, ScoreHistory};
use crate::training::optimizer::{Optimizer, OptimizerKind, OptimizerState, clip_grad_norm};
use crate::training::outputs::{
    LossLog, LossRow, TEST_PREDICTIONS_FILE, TrainingLog, WeightExtractor,
};
use crate::training::scheduler::{PlateauConfig, PlateauMode, PlateauScheduler, PlateauState};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loss a fresh session starts from.
const INITIAL_LOSS: f64 = 10000.0;

/// Where the trainer currently is. Every change is emitted as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerPhase {
    Initializing,
    EpochRunning,
    Evaluating,
    Persisting,
    LearningRateTooSmall,
    Interrupted,
    Completed,
}

/// Why a training session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// All requested epochs ran.
    Completed,
    /// The learning rate fell below the configured floor.
    LearningRateTooSmall,
    /// The cancellation token fired.
    Interrupted,
}

/// Outcome of [`ModelTrainer::train`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub test_score: f64,
    pub dev_score_history: Vec<f64>,
    pub dev_loss_history: Vec<f64>,
    pub train_loss_history: Vec<f64>,
    pub history: ScoreHistory,
    pub termination: Termination,
    pub epochs_run: usize,
}

/// A training session: model, corpus, optimizer choice and resume state.
pub struct ModelTrainer<M: TrainableModel> {
    pub(super) model: M,
    pub(super) corpus: Corpus<M::Example>,
    pub(super) optimizer_kind: OptimizerKind,
    epoch: usize,
    loss: f64,
    optimizer_state: Option<OptimizerState>,
    scheduler_state: Option<PlateauState>,
    sink: Arc<dyn EventSink>,
    phase: TrainerPhase,
    training_log: Option<TrainingLog>,
}

impl<M: TrainableModel> ModelTrainer<M> {
    /// A fresh session starting at epoch 0.
    pub fn new(
        model: M,
        corpus: Corpus<M::Example>,
        optimizer_kind: OptimizerKind,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            model,
            corpus,
            optimizer_kind,
            epoch: 0,
            loss: INITIAL_LOSS,
            optimizer_state: None,
            scheduler_state: None,
            sink,
            phase: TrainerPhase::Initializing,
            training_log: None,
        }
    }

    /// Resume from `checkpoint.pt`: the model weights are loaded from the
    /// checkpoint and the optimizer and scheduler state are restored when
    /// [`train`](Self::train) starts.
    pub fn from_checkpoint(
        path: &Path,
        mut model: M,
        corpus: Corpus<M::Example>,
        optimizer_kind: OptimizerKind,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let checkpoint = load_checkpoint(path)?;
        model.load_state(&checkpoint.model)?;
        tracing::info!(
            path = %path.display(),
            epoch = checkpoint.epoch,
            loss = checkpoint.loss,
            "Resuming from checkpoint"
        );
        let mut trainer = Self::new(model, corpus, optimizer_kind, sink);
        trainer.epoch = checkpoint.epoch;
        trainer.loss = checkpoint.loss;
        trainer.optimizer_state = Some(checkpoint.optimizer_state);
        trainer.scheduler_state = Some(checkpoint.scheduler_state);
        Ok(trainer)
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Index of the next epoch to run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Mean training loss of the last completed epoch.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn corpus(&self) -> &Corpus<M::Example> {
        &self.corpus
    }

    pub(super) fn emit(&self, event: TrainingEvent) {
        self.sink.emit(&event);
        if let Some(log) = &self.training_log {
            if let Err(e) = log.write_event(&event) {
                tracing::warn!(error = %e, "Failed to write training log");
            }
        }
    }

    fn set_phase(&mut self, phase: TrainerPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.emit(TrainingEvent::PhaseChanged { phase });
        }
    }

    fn emit_evaluated(&self, split: &str, metric: &Metric, loss: f64, selector: EvaluationMetric) {
        let (f_score, accuracy) = if selector.is_macro() {
            (metric.macro_avg_f_score(), metric.macro_avg_accuracy())
        } else {
            (metric.micro_avg_f_score(), metric.micro_avg_accuracy())
        };
        self.emit(TrainingEvent::Evaluated {
            split: split.to_string(),
            loss,
            f_score,
            accuracy,
        });
    }

    /// Run up to `config.max_epochs` epochs starting at the session's epoch,
    /// then test the best model.
    ///
    /// On error `training.log` is closed, the phase goes back to
    /// [`TrainerPhase::Initializing`] and any optimizer or scheduler state
    /// loaded from a checkpoint is kept.
    pub fn train(
        &mut self,
        base_path: &Path,
        config: &TrainerConfig,
        cancel: &CancellationToken,
    ) -> Result<TrainingResult> {
        let outcome = self.run_training(base_path, config, cancel);
        self.training_log = None;
        match outcome {
            Ok(result) => {
                self.optimizer_state = None;
                self.scheduler_state = None;
                Ok(result)
            }
            Err(e) => {
                self.phase = TrainerPhase::Initializing;
                Err(e)
            }
        }
    }

    fn run_training(
        &mut self,
        base_path: &Path,
        config: &TrainerConfig,
        cancel: &CancellationToken,
    ) -> Result<TrainingResult> {
        config.validate()?;
        if !config.anneal_against_train_loss && config.train_with_dev {
            return Err(MlError::config(
                "annealing against the dev score is impossible when training with dev",
            ));
        }
        if !config.anneal_against_train_loss && self.corpus.dev.is_empty() {
            return Err(MlError::config(
                "annealing against the dev score needs a non-empty dev split",
            ));
        }

        let persist = !config.param_selection_mode;
        if persist {
            std::fs::create_dir_all(base_path)?;
            self.training_log = Some(TrainingLog::open(base_path)?);
        }
        self.set_phase(TrainerPhase::Initializing);
        let manager = CheckpointManager::new(base_path);

        let mut optimizer = Optimizer::new(
            self.optimizer_kind,
            self.model.parameters(),
            config.learning_rate,
        );
        if let Some(state) = &self.optimizer_state {
            optimizer.restore(state.clone())?;
        }

        let mode = if config.anneal_against_train_loss {
            PlateauMode::Min
        } else {
            PlateauMode::Max
        };
        let mut scheduler = PlateauScheduler::for_optimizer(
            PlateauConfig::new(mode, config.anneal_factor, config.patience),
            &optimizer,
        )?;
        if let Some(state) = &self.scheduler_state {
            scheduler.load_state(state.clone())?;
        }

        let mut train_data = self.corpus.train.clone();
        if config.train_with_dev {
            train_data.extend(self.corpus.dev.iter().cloned());
        }
        if train_data.is_empty() {
            return Err(MlError::dataset("training split is empty"));
        }

        let loss_log = if persist {
            Some(LossLog::create(base_path)?)
        } else {
            None
        };
        let mut weights = if persist && config.snapshot_weights {
            Some(WeightExtractor::create(base_path, config.seed)?)
        } else {
            None
        };
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let start_epoch = self.epoch;
        self.emit(TrainingEvent::RunStarted {
            evaluation_metric: config.evaluation_metric,
            optimizer: self.optimizer_kind.name().to_string(),
            learning_rate: optimizer.learning_rate(),
            mini_batch_size: config.mini_batch_size,
            max_epochs: config.max_epochs,
            start_epoch,
            train_examples: train_data.len(),
        });

        let eval_batch_size = config.eval_batch_size();
        let dev_selection = !config.train_with_dev && persist;
        let evaluate_dev = !config.train_with_dev && !self.corpus.dev.is_empty();
        let mut history = ScoreHistory::default();
        let mut termination = Termination::Completed;
        let mut epochs_run = 0;
        let mut final_model_saved = false;
        let mut previous_lr = optimizer.learning_rate();

        for epoch in start_epoch..start_epoch + config.max_epochs {
            if cancel.is_cancelled() {
                self.set_phase(TrainerPhase::Interrupted);
                self.emit(TrainingEvent::Interrupted { epoch });
                termination = Termination::Interrupted;
                if persist {
                    self.set_phase(TrainerPhase::Persisting);
                    let path = manager.save_final_model(&self.model.state())?;
                    self.emit(TrainingEvent::FinalModelSaved { path });
                    final_model_saved = true;
                }
                break;
            }

            let bad_epochs = scheduler.bad_epochs();
            let learning_rate = optimizer.learning_rate();

            if learning_rate != previous_lr
                && config.anneal_with_restarts
                && persist
                && manager.has_best_model()
            {
                let state = manager.load_best_model()?;
                self.model.load_state(&state)?;
                self.emit(TrainingEvent::BestModelRestored {
                    epoch,
                    learning_rate,
                });
            }
            previous_lr = learning_rate;

            if learning_rate < config.min_learning_rate {
                self.set_phase(TrainerPhase::LearningRateTooSmall);
                self.emit(TrainingEvent::LearningRateTooSmall {
                    epoch,
                    learning_rate,
                });
                termination = Termination::LearningRateTooSmall;
                break;
            }

            self.set_phase(TrainerPhase::EpochRunning);
            if !config.test_mode {
                train_data.shuffle(&mut rng);
            }
            self.model.set_mode(ModelMode::Train);

            let batches = train_data.len().div_ceil(config.mini_batch_size);
            let modulo = (batches / 10).max(1);
            let mut loss_sum = 0.0;
            let mut seen = 0usize;

            for (batch_no, batch) in train_data.chunks(config.mini_batch_size).enumerate() {
                let loss = self.model.forward_loss(batch)?;
                if !loss.is_finite() {
                    return Err(MlError::NonFiniteLoss {
                        epoch,
                        batch: batch_no,
                    });
                }
                optimizer.zero_gradients(self.model.parameters_mut());
                self.model.backward()?;
                clip_grad_norm(self.model.parameters_mut(), config.grad_clip_norm);
                optimizer.step(self.model.parameters_mut())?;

                loss_sum += loss * batch.len() as f64;
                seen += batch.len();

                if batch_no % modulo == 0 {
                    self.emit(TrainingEvent::BatchProgress {
                        epoch,
                        batch: batch_no,
                        batches,
                        loss: loss_sum / seen as f64,
                    });
                    if let Some(extractor) = weights.as_mut() {
                        extractor.extract(self.model.parameters(), epoch * batches + batch_no)?;
                    }
                }
            }

            let train_loss = loss_sum / seen as f64;
            self.loss = train_loss;
            self.emit(TrainingEvent::EpochCompleted {
                epoch,
                train_loss,
                learning_rate,
                bad_epochs,
            });

            self.set_phase(TrainerPhase::Evaluating);
            self.model.set_mode(ModelMode::Eval);

            let train_metric = if config.monitor_train {
                let (metric, loss) =
                    self.model.evaluate(&self.corpus.train, eval_batch_size, None)?;
                self.emit_evaluated("TRAIN", &metric, loss, config.evaluation_metric);
                Some(metric)
            } else {
                None
            };

            let dev_result = if evaluate_dev {
                let (metric, loss) = self.model.evaluate(&self.corpus.dev, eval_batch_size, None)?;
                self.emit_evaluated("DEV", &metric, loss, config.evaluation_metric);
                Some((metric, loss))
            } else {
                None
            };

            let test_metric = if persist && !self.corpus.test.is_empty() {
                let out = base_path.join(TEST_PREDICTIONS_FILE);
                let (metric, loss) = self.model.evaluate(
                    &self.corpus.test,
                    eval_batch_size,
                    Some(out.as_path()),
                )?;
                self.emit_evaluated("TEST", &metric, loss, config.evaluation_metric);
                Some(metric)
            } else {
                None
            };

            if let Some(log) = &loss_log {
                log.append(&LossRow {
                    epoch,
                    bad_epochs,
                    learning_rate,
                    train_loss,
                    train_metric: train_metric.as_ref(),
                    dev_loss: dev_result.as_ref().map(|(_, loss)| *loss),
                    dev_metric: dev_result.as_ref().map(|(metric, _)| metric),
                    test_metric: test_metric.as_ref(),
                })?;
            }

            let dev_score = dev_result
                .as_ref()
                .map(|(metric, _)| config.evaluation_metric.score(metric));
            let current_score = if config.anneal_against_train_loss {
                train_loss
            } else {
                dev_score.unwrap_or(f64::NAN)
            };
            let step = scheduler.step(current_score, &mut optimizer);
            self.emit(TrainingEvent::SchedulerStepped {
                epoch,
                score: current_score,
                improved: step.improved,
                reduced: step.reduced,
                bad_epochs: step.bad_epochs,
                learning_rate: optimizer.learning_rate(),
            });
            history.record_epoch(
                epoch,
                train_loss,
                dev_score,
                dev_result.as_ref().map(|(_, loss)| *loss),
            );
            self.epoch = epoch + 1;
            epochs_run += 1;

            if config.checkpoint && persist {
                self.set_phase(TrainerPhase::Persisting);
                let path = manager.save(
                    self.model.state(),
                    optimizer.state(),
                    scheduler.state(),
                    epoch + 1,
                    train_loss,
                )?;
                self.emit(TrainingEvent::CheckpointSaved { epoch, path });
            }

            if dev_selection && step.improved {
                self.set_phase(TrainerPhase::Persisting);
                let path = manager.save_best_model(&self.model.state())?;
                self.emit(TrainingEvent::BestModelSaved {
                    epoch,
                    score: current_score,
                    path,
                });
            }
        }

        if persist && config.save_final_model && !final_model_saved {
            self.set_phase(TrainerPhase::Persisting);
            let path = manager.save_final_model(&self.model.state())?;
            self.emit(TrainingEvent::FinalModelSaved { path });
        }

        let test_score = if self.corpus.test.is_empty() {
            self.emit(TrainingEvent::TestSkipped);
            0.0
        } else {
            self.final_test(base_path, config)?
        };

        self.set_phase(match termination {
            Termination::Completed => TrainerPhase::Completed,
            Termination::LearningRateTooSmall => TrainerPhase::LearningRateTooSmall,
            Termination::Interrupted => TrainerPhase::Interrupted,
        });
        self.emit(TrainingEvent::TrainingFinished {
            termination,
            epochs_run,
            test_score,
        });

        Ok(TrainingResult {
            test_score,
            dev_score_history: history.dev_score_history(),
            dev_loss_history: history.dev_loss_history(),
            train_loss_history: history.train_loss_history(),
            history,
            termination,
            epochs_run,
        })
    }

    /// Evaluate the test split with the best saved model (or the current one
    /// when none was saved) and return the configured aggregate.
    pub fn final_test(&mut self, base_path: &Path, config: &TrainerConfig) -> Result<f64> {
        let persist = !config.param_selection_mode;
        let manager = CheckpointManager::new(base_path);
        let eval_batch_size = config.eval_batch_size();

        self.set_phase(TrainerPhase::Evaluating);
        self.model.set_mode(ModelMode::Eval);

        let best_model_loaded = persist && manager.has_best_model();
        if best_model_loaded {
            let state = manager.load_best_model()?;
            self.model.load_state(&state)?;
        }
        self.emit(TrainingEvent::TestStarted { best_model_loaded });

        let (metric, _) = self.model.evaluate(&self.corpus.test, eval_batch_size, None)?;
        self.emit(TrainingEvent::TestAggregate {
            micro_accuracy: metric.micro_avg_accuracy(),
            micro_f_score: metric.micro_avg_f_score(),
            macro_accuracy: metric.macro_avg_accuracy(),
            macro_f_score: metric.macro_avg_f_score(),
        });
        for class in metric.classes() {
            let counts = metric.counts(class);
            self.emit(TrainingEvent::ClassReport {
                class: class.to_string(),
                tp: counts.tp,
                fp: counts.fp,
                fn_: counts.fn_,
                tn: counts.tn,
                precision: metric.precision(class),
                recall: metric.recall(class),
                accuracy: metric.accuracy(class),
                f_score: metric.f_score(class),
            });
        }

        if self.corpus.is_composite() {
            let out = persist.then(|| base_path.join(TEST_PREDICTIONS_FILE));
            for sub in self.corpus.sub_corpora() {
                let (sub_metric, loss) =
                    self.model.evaluate(&sub.test, eval_batch_size, out.as_deref())?;
                self.emit_evaluated(&sub.name, &sub_metric, loss, config.evaluation_metric);
            }
        }

        Ok(config.evaluation_metric.score(&metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelState, Parameter};
    use crate::training::events::RecordingSink;
    use tempfile::TempDir;

    /// Predicts `w` for every example; loss is the mean squared error.
    struct MeanModel {
        params: Vec<Parameter>,
        last: Vec<f64>,
    }

    impl MeanModel {
        fn new() -> Self {
            Self {
                params: vec![Parameter::new("w", vec![0.0])],
                last: Vec::new(),
            }
        }
    }

    impl TrainableModel for MeanModel {
        type Example = f64;

        fn forward_loss(&mut self, batch: &[f64]) -> Result<f64> {
            let w = self.params[0].value[0];
            self.last = batch.to_vec();
            Ok(batch.iter().map(|y| (w - y).powi(2)).sum::<f64>() / batch.len() as f64)
        }

        fn backward(&mut self) -> Result<()> {
            let w = self.params[0].value[0];
            let n = self.last.len() as f64;
            self.params[0].grad[0] += self.last.iter().map(|y| 2.0 * (w - y)).sum::<f64>() / n;
            Ok(())
        }

        fn parameters(&self) -> &[Parameter] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.params
        }

        fn set_mode(&mut self, _mode: ModelMode) {}

        fn evaluate(
            &mut self,
            data: &[f64],
            _batch_size: usize,
            _out: Option<&Path>,
        ) -> Result<(Metric, f64)> {
            let w = self.params[0].value[0];
            let mut metric = Metric::new("mean");
            for y in data {
                if (w - y).abs() < 0.5 {
                    metric.add_tp("close");
                } else {
                    metric.add_fn("close");
                }
            }
            let loss = data.iter().map(|y| (w - y).powi(2)).sum::<f64>() / data.len().max(1) as f64;
            Ok((metric, loss))
        }
    }

    fn trainer(
        train: Vec<f64>,
        dev: Vec<f64>,
        test: Vec<f64>,
    ) -> (ModelTrainer<MeanModel>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let corpus = Corpus::new("toy", train, dev, test);
        let trainer =
            ModelTrainer::new(MeanModel::new(), corpus, OptimizerKind::sgd(), sink.clone());
        (trainer, sink)
    }

    fn quiet_config() -> TrainerConfig {
        TrainerConfig {
            max_epochs: 3,
            mini_batch_size: 2,
            test_mode: true,
            param_selection_mode: true,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn test_fresh_session_defaults() {
        let (trainer, _) = trainer(vec![1.0], vec![], vec![]);
        assert_eq!(trainer.epoch(), 0);
        assert_eq!(trainer.loss(), 10000.0);
        assert_eq!(trainer.phase(), TrainerPhase::Initializing);
    }

    #[test]
    fn test_train_moves_towards_mean() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, sink) = trainer(vec![1.0, 1.0, 1.0, 1.0], vec![1.0], vec![]);
        let result = trainer
            .train(dir.path(), &quiet_config(), &CancellationToken::new())
            .unwrap();

        assert_eq!(result.epochs_run, 3);
        assert_eq!(result.termination, Termination::Completed);
        assert_eq!(trainer.epoch(), 3);
        assert_eq!(trainer.phase(), TrainerPhase::Completed);
        let losses = &result.train_loss_history;
        assert!(losses[2] < losses[0]);
        assert_eq!(sink.count("epoch_completed"), 3);
        assert_eq!(sink.count("test_skipped"), 1);
    }

    #[test]
    fn test_dev_annealing_requires_dev_split() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, _) = trainer(vec![1.0], vec![], vec![]);
        let config = TrainerConfig {
            anneal_against_train_loss: false,
            ..quiet_config()
        };
        let err = trainer
            .train(dir.path(), &config, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, MlError::Config(_)));
    }

    #[test]
    fn test_empty_training_split_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, _) = trainer(vec![], vec![], vec![]);
        let err = trainer
            .train(dir.path(), &quiet_config(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)));
    }

    #[test]
    fn test_train_with_dev_folds_dev_into_training() {
        let dir = TempDir::new().unwrap();
        let (mut trainer, sink) = trainer(vec![1.0, 1.0], vec![1.0, 1.0], vec![]);
        let config = TrainerConfig {
            train_with_dev: true,
            max_epochs: 1,
            ..quiet_config()
        };
        let result = trainer
            .train(dir.path(), &config, &CancellationToken::new())
            .unwrap();
        assert!(result.dev_score_history.is_empty());
        match &sink.named("run_started")[0] {
            TrainingEvent::RunStarted { train_examples, .. } => assert_eq!(*train_examples, 4),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_from_checkpoint_restores_weights_and_epoch() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let model = MeanModel::new();
        let optimizer = Optimizer::new(OptimizerKind::sgd(), model.parameters(), 0.1);
        let scheduler = PlateauScheduler::new(PlateauConfig::default(), false).unwrap();
        let mut state = ModelState::default();
        state.tensors.insert("w".into(), vec![0.75]);
        let path = manager
            .save(state, optimizer.state(), scheduler.state(), 4, 0.125)
            .unwrap();

        let corpus = Corpus::new("toy", vec![1.0], vec![], vec![]);
        let trainer = ModelTrainer::from_checkpoint(
            &path,
            MeanModel::new(),
            corpus,
            OptimizerKind::sgd(),
            Arc::new(RecordingSink::new()),
        )
        .unwrap();
        assert_eq!(trainer.epoch(), 4);
        assert_eq!(trainer.loss(), 0.125);
        assert_eq!(trainer.model().parameters()[0].value, vec![0.75]);
    }
}
