//! Evaluation metrics and per-epoch score tracking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Confusion counts for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
    pub tn: usize,
}

impl ClassCounts {
    fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    fn accuracy(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp + self.fn_)
    }

    fn f_score(&self) -> f64 {
        harmonic(self.precision(), self.recall())
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn harmonic(p: f64, r: f64) -> f64 {
    if p + r == 0.0 {
        0.0
    } else {
        2.0 * p * r / (p + r)
    }
}

/// Classification metric over named classes.
///
/// Accuracy follows the sequence-labeling convention `tp / (tp + fp + fn)`:
/// true negatives are tracked and reported but do not enter any score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    classes: BTreeMap<String, ClassCounts>,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: BTreeMap::new(),
        }
    }

    fn entry(&mut self, class: &str) -> &mut ClassCounts {
        self.classes.entry(class.to_string()).or_default()
    }

    pub fn add_tp(&mut self, class: &str) {
        self.entry(class).tp += 1;
    }

    pub fn add_fp(&mut self, class: &str) {
        self.entry(class).fp += 1;
    }

    pub fn add_fn(&mut self, class: &str) {
        self.entry(class).fn_ += 1;
    }

    pub fn add_tn(&mut self, class: &str) {
        self.entry(class).tn += 1;
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn counts(&self, class: &str) -> ClassCounts {
        self.classes.get(class).copied().unwrap_or_default()
    }

    pub fn precision(&self, class: &str) -> f64 {
        self.counts(class).precision()
    }

    pub fn recall(&self, class: &str) -> f64 {
        self.counts(class).recall()
    }

    pub fn accuracy(&self, class: &str) -> f64 {
        self.counts(class).accuracy()
    }

    pub fn f_score(&self, class: &str) -> f64 {
        self.counts(class).f_score()
    }

    fn totals(&self) -> ClassCounts {
        self.classes
            .values()
            .fold(ClassCounts::default(), |acc, c| ClassCounts {
                tp: acc.tp + c.tp,
                fp: acc.fp + c.fp,
                fn_: acc.fn_ + c.fn_,
                tn: acc.tn + c.tn,
            })
    }

    fn macro_mean(&self, score: impl Fn(&ClassCounts) -> f64) -> f64 {
        if self.classes.is_empty() {
            return 0.0;
        }
        self.classes.values().map(score).sum::<f64>() / self.classes.len() as f64
    }

    pub fn micro_avg_precision(&self) -> f64 {
        self.totals().precision()
    }

    pub fn micro_avg_recall(&self) -> f64 {
        self.totals().recall()
    }

    pub fn micro_avg_accuracy(&self) -> f64 {
        self.totals().accuracy()
    }

    pub fn micro_avg_f_score(&self) -> f64 {
        self.totals().f_score()
    }

    pub fn macro_avg_accuracy(&self) -> f64 {
        self.macro_mean(ClassCounts::accuracy)
    }

    pub fn macro_avg_f_score(&self) -> f64 {
        self.macro_mean(ClassCounts::f_score)
    }

    /// Column names for one metric block in `loss.tsv`.
    pub fn tsv_header(prefix: &str) -> String {
        format!("{prefix}_PRECISION\t{prefix}_RECALL\t{prefix}_ACCURACY\t{prefix}_F-SCORE")
    }

    /// Micro-averaged precision, recall, accuracy and F1, tab separated.
    pub fn to_tsv(&self) -> String {
        format!(
            "{:.4}\t{:.4}\t{:.4}\t{:.4}",
            self.micro_avg_precision(),
            self.micro_avg_recall(),
            self.micro_avg_accuracy(),
            self.micro_avg_f_score()
        )
    }

    /// Placeholder block for a metric that was not computed.
    pub fn to_empty_tsv() -> String {
        "_\t_\t_\t_".to_string()
    }
}

/// Which aggregate drives model selection and the final score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluationMetric {
    MacroAccuracy,
    MicroAccuracy,
    #[serde(rename = "macro-f1")]
    MacroF1,
    #[default]
    #[serde(rename = "micro-f1")]
    MicroF1,
}

impl EvaluationMetric {
    pub fn score(self, metric: &Metric) -> f64 {
        match self {
            Self::MacroAccuracy => metric.macro_avg_accuracy(),
            Self::MicroAccuracy => metric.micro_avg_accuracy(),
            Self::MacroF1 => metric.macro_avg_f_score(),
            Self::MicroF1 => metric.micro_avg_f_score(),
        }
    }

    /// Macro selectors report macro aggregates in progress lines, micro selectors micro ones.
    pub fn is_macro(self) -> bool {
        matches!(self, Self::MacroAccuracy | Self::MacroF1)
    }
}

impl fmt::Display for EvaluationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MacroAccuracy => "MACRO_ACCURACY",
            Self::MicroAccuracy => "MICRO_ACCURACY",
            Self::MacroF1 => "MACRO_F1_SCORE",
            Self::MicroF1 => "MICRO_F1_SCORE",
        };
        f.write_str(name)
    }
}

/// One row of the session's score history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochScore {
    pub epoch: usize,
    pub dev_score: Option<f64>,
    pub dev_loss: Option<f64>,
    pub train_loss: f64,
}

/// Append-only score history for one training session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreHistory {
    rows: Vec<EpochScore>,
    best_epoch: Option<usize>,
}

impl ScoreHistory {
    pub fn record_epoch(
        &mut self,
        epoch: usize,
        train_loss: f64,
        dev_score: Option<f64>,
        dev_loss: Option<f64>,
    ) {
        let improved = match (dev_score, self.best_dev_score()) {
            (Some(score), Some(best)) => score > best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if improved {
            self.best_epoch = Some(epoch);
        }
        self.rows.push(EpochScore {
            epoch,
            dev_score,
            dev_loss,
            train_loss,
        });
    }

    pub fn rows(&self) -> &[EpochScore] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    fn best_dev_score(&self) -> Option<f64> {
        let epoch = self.best_epoch?;
        self.rows
            .iter()
            .find(|r| r.epoch == epoch)
            .and_then(|r| r.dev_score)
    }

    pub fn dev_score_history(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.dev_score).collect()
    }

    pub fn dev_loss_history(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.dev_loss).collect()
    }

    pub fn train_loss_history(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.train_loss).collect()
    }
}
