//! # seqtrain-ml: supervised training orchestration
//!
//! A plateau-annealed training loop for sequence and text models: mini-batch
//! gradient descent through an [`Optimizer`](training::Optimizer), learning
//! rate annealing with [`PlateauScheduler`](training::PlateauScheduler),
//! dev-set model selection, resumable checkpoints, cooperative interruption
//! and a learning-rate range finder.
//!
//! Models plug in through [`TrainableModel`]; [`TextClassifier`] is the
//! bundled reference implementation.

// Foundation
pub mod config;
pub mod error;
pub mod model;

// Data and reference model
pub mod classifier;
pub mod corpus;

// Training
pub mod training;

// Re-exports
pub use classifier::{TextClassifier, TextClassifierConfig};
pub use config::{LrFinderConfig, SeqtrainConfig, TrainerConfig};
pub use corpus::{Corpus, LabeledText, load_fasttext_corpus};
pub use error::{MlError, Result};
pub use model::{ModelMode, ModelState, Parameter, TrainableModel};
