//! Corpora: train/dev/test splits, optionally composed of named sub-corpora.

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A text with one or more class labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledText {
    pub text: String,
    pub labels: Vec<String>,
}

impl LabeledText {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            labels: vec![label.into()],
        }
    }

    /// The label training is performed against.
    pub fn primary_label(&self) -> Option<&str> {
        self.labels.first().map(String::as_str)
    }
}

/// Train/dev/test splits. A composite corpus keeps its parts so the final
/// test can be repeated per part.
#[derive(Debug, Clone, Default)]
pub struct Corpus<E> {
    pub name: String,
    pub train: Vec<E>,
    pub dev: Vec<E>,
    pub test: Vec<E>,
    sub_corpora: Vec<Corpus<E>>,
}

impl<E: Clone> Corpus<E> {
    pub fn new(name: impl Into<String>, train: Vec<E>, dev: Vec<E>, test: Vec<E>) -> Self {
        Self {
            name: name.into(),
            train,
            dev,
            test,
            sub_corpora: Vec::new(),
        }
    }

    /// Concatenate the splits of `corpora` into one corpus.
    pub fn multi(name: impl Into<String>, corpora: Vec<Corpus<E>>) -> Self {
        let mut merged = Self::new(name, Vec::new(), Vec::new(), Vec::new());
        for corpus in &corpora {
            merged.train.extend(corpus.train.iter().cloned());
            merged.dev.extend(corpus.dev.iter().cloned());
            merged.test.extend(corpus.test.iter().cloned());
        }
        merged.sub_corpora = corpora;
        merged
    }

    pub fn is_composite(&self) -> bool {
        !self.sub_corpora.is_empty()
    }

    pub fn sub_corpora(&self) -> &[Corpus<E>] {
        &self.sub_corpora
    }
}

fn parse_fasttext_line(line: &str) -> Option<LabeledText> {
    const PREFIX: &str = "__label__";
    let mut labels = Vec::new();
    let mut words = Vec::new();
    for token in line.split_whitespace() {
        match token.strip_prefix(PREFIX) {
            Some(label) if words.is_empty() && !label.is_empty() => labels.push(label.to_string()),
            _ => words.push(token),
        }
    }
    if labels.is_empty() || words.is_empty() {
        return None;
    }
    Some(LabeledText {
        text: words.join(" "),
        labels,
    })
}

/// Read one fastText-format file (`__label__A __label__B some text`).
/// Lines without a label or without text are skipped.
pub fn read_fasttext_file(path: &Path) -> Result<Vec<LabeledText>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MlError::dataset(format!("{}: {e}", path.display())))?;
    let mut examples = Vec::new();
    let mut skipped = 0usize;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match parse_fasttext_line(line) {
            Some(example) => examples.push(example),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "Skipped malformed corpus lines");
    }
    Ok(examples)
}

/// Load `train.txt`, `dev.txt` and `test.txt` from `dir`. Only the training
/// file is required; missing dev/test files yield empty splits.
pub fn load_fasttext_corpus(dir: &Path) -> Result<Corpus<LabeledText>> {
    let train_path = dir.join("train.txt");
    if !train_path.exists() {
        return Err(MlError::dataset(format!(
            "no train.txt in {}",
            dir.display()
        )));
    }
    let optional = |file: &str| -> Result<Vec<LabeledText>> {
        let path = dir.join(file);
        if path.exists() {
            read_fasttext_file(&path)
        } else {
            Ok(Vec::new())
        }
    };
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corpus".to_string());
    let corpus = Corpus::new(
        name,
        read_fasttext_file(&train_path)?,
        optional("dev.txt")?,
        optional("test.txt")?,
    );
    tracing::info!(
        corpus = %corpus.name,
        train = corpus.train.len(),
        dev = corpus.dev.len(),
        test = corpus.test.len(),
        "Loaded corpus"
    );
    Ok(corpus)
}
