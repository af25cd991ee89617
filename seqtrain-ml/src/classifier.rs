//! Reference text classifier: hashed bag-of-words features, one linear layer,
//! softmax cross-entropy on the primary label.
//!
//! Small enough to train on a CPU in seconds, which makes it the model the
//! CLI drives and the end-to-end tests exercise.

use crate::corpus::{Corpus, LabeledText};
use crate::error::{MlError, Result};
use crate::model::{ModelMode, Parameter, TrainableModel};
use crate::training::metrics::Metric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

const WEIGHT: usize = 0;
const BIAS: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextClassifierConfig {
    /// Number of hash buckets for token features.
    #[serde(default = "default_buckets")]
    pub buckets: usize,
    /// Seed for weight initialization.
    #[serde(default)]
    pub seed: u64,
    /// Half-width of the uniform initialization range.
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
}

fn default_buckets() -> usize {
    4096
}

fn default_init_scale() -> f64 {
    0.05
}

impl Default for TextClassifierConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            seed: 0,
            init_scale: default_init_scale(),
        }
    }
}

type Features = Vec<(usize, f64)>;

#[derive(Debug, Clone)]
struct CachedExample {
    features: Features,
    probs: Vec<f64>,
    gold: usize,
}

#[derive(Debug, Clone)]
pub struct TextClassifier {
    labels: Vec<String>,
    label_index: HashMap<String, usize>,
    buckets: usize,
    params: Vec<Parameter>,
    mode: ModelMode,
    cache: Vec<CachedExample>,
}

/// 64-bit FNV-1a; stable across platforms and releases.
fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl TextClassifier {
    pub fn new(labels: Vec<String>, config: &TextClassifierConfig) -> Result<Self> {
        if labels.len() < 2 {
            return Err(MlError::model("a classifier needs at least two labels"));
        }
        if config.buckets == 0 {
            return Err(MlError::model("feature bucket count must be positive"));
        }
        let label_index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let scale = config.init_scale;
        let weights = (0..labels.len() * config.buckets)
            .map(|_| rng.gen_range(-scale..=scale))
            .collect();
        let params = vec![
            Parameter::new("linear.weight", weights),
            Parameter::new("linear.bias", vec![0.0; labels.len()]),
        ];
        Ok(Self {
            labels,
            label_index,
            buckets: config.buckets,
            params,
            mode: ModelMode::Train,
            cache: Vec::new(),
        })
    }

    /// Build a classifier over every primary label that occurs in `corpus`.
    pub fn from_corpus(
        corpus: &Corpus<LabeledText>,
        config: &TextClassifierConfig,
    ) -> Result<Self> {
        let labels: BTreeSet<String> = corpus
            .train
            .iter()
            .chain(&corpus.dev)
            .chain(&corpus.test)
            .filter_map(|e| e.primary_label().map(str::to_string))
            .collect();
        Self::new(labels.into_iter().collect(), config)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    fn features(&self, text: &str) -> Features {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        let mut total = 0.0;
        for token in text.split_whitespace() {
            let bucket = (fnv1a(&token.to_lowercase()) % self.buckets as u64) as usize;
            *counts.entry(bucket).or_default() += 1.0;
            total += 1.0;
        }
        let mut features: Features = counts.into_iter().map(|(b, c)| (b, c / total)).collect();
        features.sort_unstable_by_key(|(b, _)| *b);
        features
    }

    fn probabilities(&self, features: &Features) -> Vec<f64> {
        let weight = &self.params[WEIGHT].value;
        let bias = &self.params[BIAS].value;
        let logits: Vec<f64> = (0..self.labels.len())
            .map(|c| {
                let row = c * self.buckets;
                bias[c] + features.iter().map(|&(b, x)| weight[row + b] * x).sum::<f64>()
            })
            .collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }

    fn gold_index(&self, example: &LabeledText) -> Option<usize> {
        example
            .primary_label()
            .and_then(|l| self.label_index.get(l).copied())
    }

    /// Most likely label for `text`.
    pub fn predict(&self, text: &str) -> &str {
        let probs = self.probabilities(&self.features(text));
        &self.labels[argmax(&probs)]
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

fn cross_entropy(probs: &[f64], gold: usize) -> f64 {
    -probs[gold].max(f64::MIN_POSITIVE).ln()
}

impl TrainableModel for TextClassifier {
    type Example = LabeledText;

    fn forward_loss(&mut self, batch: &[LabeledText]) -> Result<f64> {
        if batch.is_empty() {
            return Err(MlError::model("empty batch"));
        }
        let mut cache = Vec::with_capacity(batch.len());
        let mut loss = 0.0;
        for example in batch {
            let gold = self.gold_index(example).ok_or_else(|| {
                MlError::model(format!("unknown or missing label in {:?}", example.labels))
            })?;
            let features = self.features(&example.text);
            let probs = self.probabilities(&features);
            loss += cross_entropy(&probs, gold);
            cache.push(CachedExample {
                features,
                probs,
                gold,
            });
        }
        self.cache = cache;
        Ok(loss / batch.len() as f64)
    }

    fn backward(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Err(MlError::model("backward called without a forward pass"));
        }
        let n = self.cache.len() as f64;
        let buckets = self.buckets;
        let cache = std::mem::take(&mut self.cache);
        let (weight, bias) = self.params.split_at_mut(BIAS);
        let weight_grad = &mut weight[WEIGHT].grad;
        let bias_grad = &mut bias[0].grad;
        for example in &cache {
            for (c, &p) in example.probs.iter().enumerate() {
                let delta = (p - if c == example.gold { 1.0 } else { 0.0 }) / n;
                bias_grad[c] += delta;
                let row = c * buckets;
                for &(b, x) in &example.features {
                    weight_grad[row + b] += delta * x;
                }
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn evaluate(
        &mut self,
        data: &[LabeledText],
        batch_size: usize,
        out_path: Option<&Path>,
    ) -> Result<(Metric, f64)> {
        let mut metric = Metric::new("evaluation");
        let mut loss = 0.0;
        let mut scored = 0usize;
        let mut lines = Vec::new();

        for batch in data.chunks(batch_size.max(1)) {
            for example in batch {
                let probs = self.probabilities(&self.features(&example.text));
                let predicted = argmax(&probs);
                let gold = self.gold_index(example);
                if let Some(g) = gold {
                    loss += cross_entropy(&probs, g);
                    scored += 1;
                }
                for (c, label) in self.labels.iter().enumerate() {
                    match (predicted == c, gold == Some(c)) {
                        (true, true) => metric.add_tp(label),
                        (true, false) => metric.add_fp(label),
                        (false, true) => metric.add_fn(label),
                        (false, false) => metric.add_tn(label),
                    }
                }
                if out_path.is_some() {
                    lines.push(format!(
                        "{}\t{}\t{}",
                        example.text,
                        example.primary_label().unwrap_or("_"),
                        self.labels[predicted]
                    ));
                }
            }
        }

        if let Some(path) = out_path {
            let mut body = lines.join("\n");
            body.push('\n');
            seqtrain_core::atomic_write(path, body.as_bytes())?;
        }

        let mean = if scored == 0 { 0.0 } else { loss / scored as f64 };
        Ok((metric, mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::{Optimizer, OptimizerKind, clip_grad_norm};

    fn toy_data() -> Vec<LabeledText> {
        vec![
            LabeledText::new("great fun film", "pos"),
            LabeledText::new("wonderful great acting", "pos"),
            LabeledText::new("boring dull film", "neg"),
            LabeledText::new("dull awful plot", "neg"),
        ]
    }

    fn classifier() -> TextClassifier {
        TextClassifier::new(
            vec!["neg".into(), "pos".into()],
            &TextClassifierConfig {
                buckets: 64,
                ..TextClassifierConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_initial_loss_is_near_uniform() {
        let mut model = classifier();
        let loss = model.forward_loss(&toy_data()).unwrap();
        assert!((loss - 2f64.ln()).abs() < 0.1);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut model = classifier();
        let data = toy_data();
        model.forward_loss(&data).unwrap();
        model.backward().unwrap();
        let analytic = model.params[BIAS].grad[1];

        let h = 1e-6;
        model.params[BIAS].value[1] += h;
        let plus = model.forward_loss(&data).unwrap();
        model.params[BIAS].value[1] -= 2.0 * h;
        let minus = model.forward_loss(&data).unwrap();
        let numeric = (plus - minus) / (2.0 * h);
        assert!((analytic - numeric).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_learns_toy_data() {
        let mut model = classifier();
        let data = toy_data();
        let mut opt = Optimizer::new(OptimizerKind::sgd(), model.parameters(), 1.0);
        let first = model.forward_loss(&data).unwrap();
        for _ in 0..50 {
            model.forward_loss(&data).unwrap();
            opt.zero_gradients(model.parameters_mut());
            model.backward().unwrap();
            clip_grad_norm(model.parameters_mut(), 5.0);
            opt.step(model.parameters_mut()).unwrap();
        }
        let last = model.forward_loss(&data).unwrap();
        assert!(last < first);
        assert_eq!(model.predict("great film"), "pos");

        let (metric, _) = model.evaluate(&data, 2, None).unwrap();
        assert_eq!(metric.micro_avg_accuracy(), 1.0);
    }

    #[test]
    fn test_unknown_label_in_training_is_error() {
        let mut model = classifier();
        let err = model
            .forward_loss(&[LabeledText::new("x", "neutral")])
            .unwrap_err();
        assert!(matches!(err, MlError::Model(_)));
    }

    #[test]
    fn test_evaluate_writes_predictions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.tsv");
        let mut model = classifier();
        model.evaluate(&toy_data(), 3, Some(&path)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.starts_with("great fun film\tpos\t"));
    }

    #[test]
    fn test_from_corpus_collects_sorted_labels() {
        let corpus = Corpus::new(
            "toy",
            toy_data(),
            vec![LabeledText::new("meh", "neutral")],
            Vec::new(),
        );
        let model = TextClassifier::from_corpus(&corpus, &TextClassifierConfig::default()).unwrap();
        assert_eq!(model.labels(), ["neg", "neutral", "pos"]);
    }
}
