//! Learning-rate finder behavior.

mod common;

use common::{ConstantModel, DivergingModel, LinearModel, Sample, line};
use seqtrain_ml::training::scheduler::ExpAnnealSchedule;
use seqtrain_ml::training::{ModelTrainer, OptimizerKind, RecordingSink, TrainingEvent};
use seqtrain_ml::{Corpus, LrFinderConfig, ModelMode, TrainableModel};
use std::sync::Arc;
use tempfile::TempDir;

fn corpus(train: usize) -> Corpus<Sample> {
    Corpus::new("line", line(train), Vec::new(), Vec::new())
}

fn rows(path: &std::path::Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}

#[test]
fn test_stops_early_on_rising_loss_and_restores_parameters() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::new());
    let mut trainer = ModelTrainer::new(
        DivergingModel::new(),
        corpus(40),
        OptimizerKind::sgd(),
        sink.clone(),
    );
    let before = trainer.model().parameters().to_vec();
    let config = LrFinderConfig {
        iterations: 20,
        mini_batch_size: 2,
        test_mode: true,
        ..LrFinderConfig::default()
    };

    let path = trainer.find_learning_rate(dir.path(), &config).unwrap();

    let written = rows(&path);
    assert!(!written.is_empty());
    assert!(written.len() < 20);
    assert_eq!(sink.count("lr_finder_diverged"), 1);
    match &sink.named("lr_finder_finished")[0] {
        TrainingEvent::LrFinderFinished { iterations_run, .. } => {
            // the diverging iteration runs but is not written
            assert_eq!(*iterations_run, written.len() + 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let after = trainer.model().parameters();
    for (b, a) in before.iter().zip(after) {
        assert_eq!(b.value, a.value);
    }
}

#[test]
fn test_sweep_is_truncated_to_available_batches() {
    let dir = TempDir::new().unwrap();
    let mut trainer = ModelTrainer::new(
        ConstantModel::new(),
        corpus(6),
        OptimizerKind::sgd(),
        Arc::new(RecordingSink::new()),
    );
    let config = LrFinderConfig {
        mini_batch_size: 2,
        test_mode: true,
        ..LrFinderConfig::default()
    };

    let path = trainer.find_learning_rate(dir.path(), &config).unwrap();

    assert_eq!(path, dir.path().join("learning_rate.tsv"));
    let written = rows(&path);
    assert_eq!(written.len(), 3);
    let schedule = ExpAnnealSchedule::new(1e-7, 10.0, 100).unwrap();
    for (i, row) in written.iter().enumerate() {
        assert_eq!(row[0], i.to_string());
        let lr: f64 = row[2].parse().unwrap();
        assert!((lr - schedule.lr_at(i + 1)).abs() <= 1e-12 * lr.abs().max(1.0));
        let loss: f64 = row[3].parse().unwrap();
        assert!((loss - 1.0).abs() < 1e-9);
    }
}

#[test]
fn test_rising_loss_is_fully_logged_without_early_stop() {
    let dir = TempDir::new().unwrap();
    let mut trainer = ModelTrainer::new(
        DivergingModel::new(),
        corpus(10),
        OptimizerKind::sgd(),
        Arc::new(RecordingSink::new()),
    );
    let config = LrFinderConfig {
        iterations: 5,
        mini_batch_size: 2,
        stop_early: false,
        smoothing_factor: 0.0,
        test_mode: true,
        file_name: "sweep.tsv".into(),
        ..LrFinderConfig::default()
    };

    let path = trainer.find_learning_rate(dir.path(), &config).unwrap();

    let header = std::fs::read_to_string(&path).unwrap();
    assert!(header.starts_with("ITERATION\tTIMESTAMP\tLEARNING_RATE\tTRAIN_LOSS\n"));
    let losses: Vec<f64> = rows(&path).iter().map(|r| r[3].parse().unwrap()).collect();
    assert_eq!(losses, vec![1.0, 2.0, 4.0, 8.0, 16.0]);
}

#[test]
fn test_model_is_left_in_eval_mode_with_original_weights() {
    let dir = TempDir::new().unwrap();
    let mut trainer = ModelTrainer::new(
        LinearModel::new(),
        corpus(10),
        OptimizerKind::sgd(),
        Arc::new(RecordingSink::new()),
    );
    assert_eq!(trainer.model().mode, ModelMode::Train);
    let before = trainer.model().state();
    let config = LrFinderConfig {
        iterations: 5,
        mini_batch_size: 2,
        test_mode: true,
        ..LrFinderConfig::default()
    };

    trainer.find_learning_rate(dir.path(), &config).unwrap();

    assert_eq!(trainer.model().mode, ModelMode::Eval);
    assert_eq!(trainer.model().state(), before);
}
