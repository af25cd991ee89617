//! Structured training events and the sinks that receive them.
//!
//! The trainer never logs directly: it emits [`TrainingEvent`]s into the
//! [`EventSink`] it was built with. [`TracingSink`] forwards them to
//! `tracing`, [`RecordingSink`] keeps them for assertions.

use crate::training::metrics::EvaluationMetric;
use crate::training::trainer::{Termination, TrainerPhase};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainingEvent {
    RunStarted {
        evaluation_metric: EvaluationMetric,
        optimizer: String,
        learning_rate: f64,
        mini_batch_size: usize,
        max_epochs: usize,
        start_epoch: usize,
        train_examples: usize,
    },
    PhaseChanged {
        phase: TrainerPhase,
    },
    BestModelRestored {
        epoch: usize,
        learning_rate: f64,
    },
    LearningRateTooSmall {
        epoch: usize,
        learning_rate: f64,
    },
    BatchProgress {
        epoch: usize,
        batch: usize,
        batches: usize,
        loss: f64,
    },
    EpochCompleted {
        epoch: usize,
        train_loss: f64,
        learning_rate: f64,
        bad_epochs: usize,
    },
    Evaluated {
        split: String,
        loss: f64,
        f_score: f64,
        accuracy: f64,
    },
    SchedulerStepped {
        epoch: usize,
        score: f64,
        improved: bool,
        reduced: bool,
        bad_epochs: usize,
        learning_rate: f64,
    },
    CheckpointSaved {
        epoch: usize,
        path: PathBuf,
    },
    BestModelSaved {
        epoch: usize,
        score: f64,
        path: PathBuf,
    },
    FinalModelSaved {
        path: PathBuf,
    },
    Interrupted {
        epoch: usize,
    },
    TestSkipped,
    TestStarted {
        best_model_loaded: bool,
    },
    TestAggregate {
        micro_accuracy: f64,
        micro_f_score: f64,
        macro_accuracy: f64,
        macro_f_score: f64,
    },
    ClassReport {
        class: String,
        tp: usize,
        fp: usize,
        fn_: usize,
        tn: usize,
        precision: f64,
        recall: f64,
        accuracy: f64,
        f_score: f64,
    },
    TrainingFinished {
        termination: Termination,
        epochs_run: usize,
        test_score: f64,
    },
    LrFinderStarted {
        start_learning_rate: f64,
        end_learning_rate: f64,
        iterations: usize,
    },
    LrFinderDiverged {
        iteration: usize,
        loss: f64,
        best_loss: f64,
    },
    LrFinderFinished {
        path: PathBuf,
        iterations_run: usize,
    },
}

impl TrainingEvent {
    /// Stable snake_case name, matching the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::BestModelRestored { .. } => "best_model_restored",
            Self::LearningRateTooSmall { .. } => "learning_rate_too_small",
            Self::BatchProgress { .. } => "batch_progress",
            Self::EpochCompleted { .. } => "epoch_completed",
            Self::Evaluated { .. } => "evaluated",
            Self::SchedulerStepped { .. } => "scheduler_stepped",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::BestModelSaved { .. } => "best_model_saved",
            Self::FinalModelSaved { .. } => "final_model_saved",
            Self::Interrupted { .. } => "interrupted",
            Self::TestSkipped => "test_skipped",
            Self::TestStarted { .. } => "test_started",
            Self::TestAggregate { .. } => "test_aggregate",
            Self::ClassReport { .. } => "class_report",
            Self::TrainingFinished { .. } => "training_finished",
            Self::LrFinderStarted { .. } => "lr_finder_started",
            Self::LrFinderDiverged { .. } => "lr_finder_diverged",
            Self::LrFinderFinished { .. } => "lr_finder_finished",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            Self::PhaseChanged { .. }
            | Self::SchedulerStepped { .. }
            | Self::CheckpointSaved { .. } => EventLevel::Debug,
            Self::Interrupted { .. } | Self::LrFinderDiverged { .. } => EventLevel::Warn,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for TrainingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                evaluation_metric,
                optimizer,
                learning_rate,
                mini_batch_size,
                max_epochs,
                start_epoch,
                train_examples,
            } => write!(
                f,
                "Evaluation method: {evaluation_metric} - optimizer {optimizer} - lr {learning_rate} - \
                 mini-batch {mini_batch_size} - epochs {start_epoch}..{} - {train_examples} train examples",
                start_epoch + max_epochs
            ),
            Self::PhaseChanged { phase } => write!(f, "phase -> {phase:?}"),
            Self::BestModelRestored {
                epoch,
                learning_rate,
            } => write!(
                f,
                "resetting to best model before epoch {} (lr {learning_rate:.4})",
                epoch + 1
            ),
            Self::LearningRateTooSmall {
                learning_rate, ..
            } => write!(
                f,
                "learning rate too small ({learning_rate:.6}) - quitting training!"
            ),
            Self::BatchProgress {
                epoch,
                batch,
                batches,
                loss,
            } => write!(
                f,
                "epoch {} - iter {batch}/{batches} - loss {loss:.8}",
                epoch + 1
            ),
            Self::EpochCompleted {
                epoch,
                train_loss,
                learning_rate,
                bad_epochs,
            } => write!(
                f,
                "EPOCH {} done: loss {train_loss:.4} - lr {learning_rate:.4} - bad epochs {bad_epochs}",
                epoch + 1
            ),
            Self::Evaluated {
                split,
                loss,
                f_score,
                accuracy,
            } => write!(
                f,
                "{split:<5}: loss {loss:.8} - f-score {f_score:.4} - acc {accuracy:.4}"
            ),
            Self::SchedulerStepped {
                score,
                improved,
                reduced,
                bad_epochs,
                learning_rate,
                ..
            } => write!(
                f,
                "scheduler: score {score:.6} - improved {improved} - annealed {reduced} - \
                 bad epochs {bad_epochs} - lr {learning_rate:.6}"
            ),
            Self::CheckpointSaved { epoch, path } => {
                write!(f, "saved checkpoint for epoch {} to {}", epoch + 1, path.display())
            }
            Self::BestModelSaved { epoch, score, path } => write!(
                f,
                "new best score {score:.4} in epoch {} - saved {}",
                epoch + 1,
                path.display()
            ),
            Self::FinalModelSaved { path } => write!(f, "saved final model to {}", path.display()),
            Self::Interrupted { epoch } => {
                write!(f, "Exiting from training early (before epoch {}).", epoch + 1)
            }
            Self::TestSkipped => f.write_str("Test data not provided setting final score to 0"),
            Self::TestStarted { best_model_loaded } => {
                if *best_model_loaded {
                    f.write_str("Testing using best model ...")
                } else {
                    f.write_str("Testing using last model ...")
                }
            }
            Self::TestAggregate {
                micro_accuracy,
                micro_f_score,
                macro_accuracy,
                macro_f_score,
            } => write!(
                f,
                "MICRO_AVG: acc {micro_accuracy:.4} - f1-score {micro_f_score:.4} | \
                 MACRO_AVG: acc {macro_accuracy:.4} - f1-score {macro_f_score:.4}"
            ),
            Self::ClassReport {
                class,
                tp,
                fp,
                fn_,
                tn,
                precision,
                recall,
                accuracy,
                f_score,
            } => write!(
                f,
                "{class:<10} tp: {tp} - fp: {fp} - fn: {fn_} - tn: {tn} - precision: {precision:.4} - \
                 recall: {recall:.4} - accuracy: {accuracy:.4} - f1-score: {f_score:.4}"
            ),
            Self::TrainingFinished {
                termination,
                epochs_run,
                test_score,
            } => write!(
                f,
                "training finished ({termination:?}) after {epochs_run} epochs - test score {test_score:.4}"
            ),
            Self::LrFinderStarted {
                start_learning_rate,
                end_learning_rate,
                iterations,
            } => write!(
                f,
                "learning rate finder: {start_learning_rate:e} -> {end_learning_rate:e} over {iterations} iterations"
            ),
            Self::LrFinderDiverged {
                iteration,
                loss,
                best_loss,
            } => write!(
                f,
                "loss diverged at iteration {iteration} ({loss:.6} vs best {best_loss:.6}) - stopping early!"
            ),
            Self::LrFinderFinished {
                path,
                iterations_run,
            } => write!(
                f,
                "learning rate finder finished after {iterations_run} iterations - plot {}",
                path.display()
            ),
        }
    }
}

/// Receiver of training events. Implementations must not panic.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TrainingEvent);
}

/// Forwards events to `tracing` with the event name and JSON payload as fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TrainingEvent) {
        let details = serde_json::to_string(event).unwrap_or_default();
        match event.level() {
            EventLevel::Debug => {
                tracing::debug!(target: "seqtrain::training", event = event.name(), %details, "{event}")
            }
            EventLevel::Info => {
                tracing::info!(target: "seqtrain::training", event = event.name(), %details, "{event}")
            }
            EventLevel::Warn => {
                tracing::warn!(target: "seqtrain::training", event = event.name(), %details, "{event}")
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: &TrainingEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TrainingEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrainingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events whose name matches `name`.
    pub fn named(&self, name: &str) -> Vec<TrainingEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.named(name).len()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &TrainingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
