//! Training infrastructure: optimizer, schedulers, checkpoints, output files,
//! events, the training loop and the learning-rate finder.

pub mod checkpoint;
pub mod events;
pub mod lr_finder;
pub mod metrics;
pub mod optimizer;
pub mod outputs;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use events::{EventSink, NoOpSink, RecordingSink, TracingSink, TrainingEvent};
pub use metrics::{EvaluationMetric, Metric, ScoreHistory};
pub use optimizer::{Optimizer, OptimizerKind, OptimizerState};
pub use scheduler::{ExpAnnealSchedule, PlateauConfig, PlateauMode, PlateauScheduler, PlateauState};
pub use trainer::{ModelTrainer, Termination, TrainerPhase, TrainingResult};
