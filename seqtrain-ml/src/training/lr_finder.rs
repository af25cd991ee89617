//! Learning-rate range test.
//!
//! Trains for a bounded number of batches while the learning rate grows
//! exponentially, recording the smoothed loss at every step. The model is put
//! back exactly as it was afterwards; only `learning_rate.tsv` is written.

use crate::config::LrFinderConfig;
use crate::error::Result;
use crate::model::{ModelMode, TrainableModel};
use crate::training::events::TrainingEvent;
use crate::training::optimizer::{Optimizer, clip_grad_norm};
use crate::training::outputs::LearningRateLog;
use crate::training::scheduler::ExpAnnealSchedule;
use crate::training::trainer::ModelTrainer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

/// Exponential moving average with bias correction.
#[derive(Debug, Clone)]
struct SmoothedLoss {
    beta: f64,
    avg: f64,
    count: i32,
}

impl SmoothedLoss {
    fn new(beta: f64) -> Self {
        Self {
            beta,
            avg: 0.0,
            count: 0,
        }
    }

    fn update(&mut self, loss: f64) -> f64 {
        if self.beta == 0.0 {
            return loss;
        }
        self.count += 1;
        self.avg = self.beta * self.avg + (1.0 - self.beta) * loss;
        self.avg / (1.0 - self.beta.powi(self.count))
    }
}

impl<M: TrainableModel> ModelTrainer<M> {
    /// Sweep the learning rate from `start_learning_rate` to
    /// `end_learning_rate` and write `(iteration, lr, smoothed loss)` rows to
    /// `base_path/file_name`. Returns the path of the written table.
    ///
    /// The weights are restored afterwards and the model is left in
    /// [`ModelMode::Eval`], whatever mode it was in before the sweep.
    pub fn find_learning_rate(
        &mut self,
        base_path: &Path,
        config: &LrFinderConfig,
    ) -> Result<PathBuf> {
        config.validate()?;
        std::fs::create_dir_all(base_path)?;
        let log = LearningRateLog::create(base_path.join(&config.file_name))?;

        let mut data = self.corpus.train.clone();
        if !config.test_mode {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            data.shuffle(&mut rng);
        }

        self.emit(TrainingEvent::LrFinderStarted {
            start_learning_rate: config.start_learning_rate,
            end_learning_rate: config.end_learning_rate,
            iterations: config.iterations,
        });

        let snapshot = self.model.state();
        self.model.set_mode(ModelMode::Train);
        let outcome = self.sweep(&data, config, &log);
        self.model.load_state(&snapshot)?;
        self.model.set_mode(ModelMode::Eval);
        let iterations_run = outcome?;

        let path = log.path().to_path_buf();
        self.emit(TrainingEvent::LrFinderFinished {
            path: path.clone(),
            iterations_run,
        });
        Ok(path)
    }

    fn sweep(
        &mut self,
        data: &[M::Example],
        config: &LrFinderConfig,
        log: &LearningRateLog,
    ) -> Result<usize> {
        let mut optimizer = Optimizer::new(
            self.optimizer_kind,
            self.model.parameters(),
            config.start_learning_rate,
        );
        let mut schedule = ExpAnnealSchedule::new(
            config.start_learning_rate,
            config.end_learning_rate,
            config.iterations,
        )?;
        let mut smoother = SmoothedLoss::new(config.smoothing_factor);
        let mut best_loss = f64::INFINITY;
        let mut iterations_run = 0;

        for (iteration, batch) in data
            .chunks(config.mini_batch_size)
            .take(config.iterations)
            .enumerate()
        {
            let loss = self.model.forward_loss(batch)?;
            optimizer.zero_gradients(self.model.parameters_mut());
            self.model.backward()?;
            clip_grad_norm(self.model.parameters_mut(), config.grad_clip_norm);
            optimizer.step(self.model.parameters_mut())?;
            let learning_rate = schedule.step(&mut optimizer);
            iterations_run = iteration + 1;

            let smoothed = smoother.update(loss);
            if smoothed < best_loss {
                best_loss = smoothed;
            }

            if config.stop_early && (smoothed > 4.0 * best_loss || !loss.is_finite()) {
                self.emit(TrainingEvent::LrFinderDiverged {
                    iteration,
                    loss: smoothed,
                    best_loss,
                });
                break;
            }

            log.append(iteration, learning_rate, smoothed)?;
        }

        Ok(iterations_run)
    }
}
