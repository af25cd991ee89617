//! Run-directory output files: `training.log`, `loss.tsv`, `weights.txt` and
//! `learning_rate.tsv`. All of them are append-only after creation.

use crate::error::Result;
use crate::model::Parameter;
use crate::training::events::{EventLevel, TrainingEvent};
use crate::training::metrics::Metric;
use chrono::Local;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use seqtrain_core::AppendLog;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const TRAINING_LOG_FILE: &str = "training.log";
pub const LOSS_FILE: &str = "loss.tsv";
pub const WEIGHTS_FILE: &str = "weights.txt";
pub const TEST_PREDICTIONS_FILE: &str = "test.tsv";
pub const LEARNING_RATE_FILE: &str = "learning_rate.tsv";

/// Placeholder for a value that was not computed.
const EMPTY: &str = "_";

fn clock() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Free-text progress log. Appends across runs in the same directory.
#[derive(Debug, Clone)]
pub struct TrainingLog {
    log: AppendLog,
}

impl TrainingLog {
    pub fn open(base_dir: &Path) -> Result<Self> {
        Ok(Self {
            log: AppendLog::open(base_dir.join(TRAINING_LOG_FILE))?,
        })
    }

    pub fn write_event(&self, event: &TrainingEvent) -> Result<()> {
        let level = match event.level() {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
        };
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.log.append_line(&format!("{stamp} {level} {event}"))?;
        Ok(())
    }
}

/// One `loss.tsv` row.
#[derive(Debug, Clone, Copy)]
pub struct LossRow<'a> {
    pub epoch: usize,
    pub bad_epochs: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_metric: Option<&'a Metric>,
    pub dev_loss: Option<f64>,
    pub dev_metric: Option<&'a Metric>,
    pub test_metric: Option<&'a Metric>,
}

/// Per-epoch table of losses and metrics.
#[derive(Debug, Clone)]
pub struct LossLog {
    log: AppendLog,
}

impl LossLog {
    pub fn header() -> String {
        format!(
            "EPOCH\tTIMESTAMP\tBAD_EPOCHS\tLEARNING_RATE\tTRAIN_LOSS\t{}\tDEV_LOSS\t{}\tTEST_LOSS\t{}",
            Metric::tsv_header("TRAIN"),
            Metric::tsv_header("DEV"),
            Metric::tsv_header("TEST")
        )
    }

    pub fn create(base_dir: &Path) -> Result<Self> {
        let log = AppendLog::create(base_dir.join(LOSS_FILE), Some(&Self::header()))?;
        Ok(Self { log })
    }

    pub fn format_row(row: &LossRow<'_>, timestamp: &str) -> String {
        let block =
            |metric: Option<&Metric>| metric.map_or_else(Metric::to_empty_tsv, Metric::to_tsv);
        let dev_loss = row
            .dev_loss
            .map_or_else(|| EMPTY.to_string(), |l| l.to_string());
        format!(
            "{}\t{timestamp}\t{}\t{:.4}\t{}\t{}\t{dev_loss}\t{}\t{EMPTY}\t{}",
            row.epoch,
            row.bad_epochs,
            row.learning_rate,
            row.train_loss,
            block(row.train_metric),
            block(row.dev_metric),
            block(row.test_metric),
        )
    }

    pub fn append(&self, row: &LossRow<'_>) -> Result<()> {
        self.log.append_line(&Self::format_row(row, &clock()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

/// Samples a fixed set of weight indices per parameter and records their
/// values over time, for plotting weight trajectories.
#[derive(Debug)]
pub struct WeightExtractor {
    log: AppendLog,
    indices: HashMap<String, Vec<usize>>,
    rng: StdRng,
    per_parameter: usize,
}

impl WeightExtractor {
    pub fn create(base_dir: &Path, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            log: AppendLog::create(base_dir.join(WEIGHTS_FILE), None)?,
            indices: HashMap::new(),
            rng,
            per_parameter: 10,
        })
    }

    pub fn extract(&mut self, params: &[Parameter], iteration: usize) -> Result<()> {
        for param in params {
            if param.is_empty() {
                continue;
            }
            let count = self.per_parameter.min(param.len());
            let rng = &mut self.rng;
            let chosen = self
                .indices
                .entry(param.name.clone())
                .or_insert_with(|| {
                    let mut picked = sample(rng, param.len(), count).into_vec();
                    picked.sort_unstable();
                    picked
                });
            for &idx in chosen.iter() {
                if let Some(value) = param.value.get(idx) {
                    self.log
                        .append_line(&format!("{iteration}\t{}\t{idx}\t{value}", param.name))?;
                }
            }
        }
        Ok(())
    }
}

/// Loss-versus-learning-rate table written by the learning-rate finder.
#[derive(Debug, Clone)]
pub struct LearningRateLog {
    log: AppendLog,
}

impl LearningRateLog {
    pub const HEADER: &'static str = "ITERATION\tTIMESTAMP\tLEARNING_RATE\tTRAIN_LOSS";

    pub fn create(path: PathBuf) -> Result<Self> {
        Ok(Self {
            log: AppendLog::create(path, Some(Self::HEADER))?,
        })
    }

    pub fn append(&self, iteration: usize, learning_rate: f64, loss: f64) -> Result<()> {
        self.log
            .append_line(&format!("{iteration}\t{}\t{learning_rate}\t{loss}", clock()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}
