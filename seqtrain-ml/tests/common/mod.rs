//! Deterministic models and sinks shared by the integration tests.

#![allow(dead_code)]

use seqtrain_ml::training::events::{EventSink, RecordingSink, TrainingEvent};
use seqtrain_ml::training::metrics::Metric;
use seqtrain_ml::{ModelMode, Parameter, Result, TrainableModel};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One regression example `y ≈ a·x + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
}

/// `n` points on the line `y = 2x + 1` with `x` spread over `[0, 1)`.
pub fn line(n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            Sample { x, y: 2.0 * x + 1.0 }
        })
        .collect()
}

fn write_predictions(out: Option<&Path>, rows: &[String]) -> Result<()> {
    if let Some(path) = out {
        let mut body = rows.join("\n");
        body.push('\n');
        std::fs::write(path, body)?;
    }
    Ok(())
}

/// Linear regression trained with mean squared error. Evaluation counts a
/// prediction within 0.25 of the target as a hit.
pub struct LinearModel {
    params: Vec<Parameter>,
    batch: Vec<Sample>,
    pub mode: ModelMode,
}

impl LinearModel {
    pub fn new() -> Self {
        Self {
            params: vec![
                Parameter::new("linear.weight", vec![0.0]),
                Parameter::new("linear.bias", vec![0.0]),
            ],
            batch: Vec::new(),
            mode: ModelMode::Train,
        }
    }

    fn predict(&self, x: f64) -> f64 {
        self.params[0].value[0] * x + self.params[1].value[0]
    }
}

impl TrainableModel for LinearModel {
    type Example = Sample;

    fn forward_loss(&mut self, batch: &[Sample]) -> Result<f64> {
        self.batch = batch.to_vec();
        let n = batch.len() as f64;
        Ok(batch.iter().map(|s| (self.predict(s.x) - s.y).powi(2)).sum::<f64>() / n)
    }

    fn backward(&mut self) -> Result<()> {
        let n = self.batch.len() as f64;
        let (mut gw, mut gb) = (0.0, 0.0);
        for s in &self.batch {
            let err = self.predict(s.x) - s.y;
            gw += 2.0 * err * s.x / n;
            gb += 2.0 * err / n;
        }
        self.params[0].grad[0] += gw;
        self.params[1].grad[0] += gb;
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
        data: &[Sample],
        _batch_size: usize,
        out: Option<&Path>,
    ) -> Result<(Metric, f64)> {
        let mut metric = Metric::new("regression");
        let mut loss = 0.0;
        let mut rows = Vec::new();
        for s in data {
            let pred = self.predict(s.x);
            loss += (pred - s.y).powi(2);
            if (pred - s.y).abs() < 0.25 {
                metric.add_tp("hit");
            } else {
                metric.add_fn("hit");
            }
            rows.push(format!("{}\t{}\t{pred}", s.x, s.y));
        }
        write_predictions(out, &rows)?;
        Ok((metric, loss / data.len().max(1) as f64))
    }
}

/// Reports the same loss forever and never produces a gradient.
pub struct ConstantModel {
    params: Vec<Parameter>,
}

impl ConstantModel {
    pub fn new() -> Self {
        Self {
            params: vec![Parameter::new("w", vec![0.5, -0.5])],
        }
    }
}

impl TrainableModel for ConstantModel {
    type Example = Sample;

    fn forward_loss(&mut self, _batch: &[Sample]) -> Result<f64> {
        Ok(1.0)
    }

    fn backward(&mut self) -> Result<()> {
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
        data: &[Sample],
        _batch_size: usize,
        out: Option<&Path>,
    ) -> Result<(Metric, f64)> {
        let mut metric = Metric::new("constant");
        data.iter().for_each(|_| metric.add_fp("hit"));
        write_predictions(out, &[])?;
        Ok((metric, 1.0))
    }
}

/// Loss doubles on every forward pass; gradients are all ones.
pub struct DivergingModel {
    params: Vec<Parameter>,
    calls: i32,
}

impl DivergingModel {
    pub fn new() -> Self {
        Self {
            params: vec![Parameter::new("w", vec![0.1, 0.2, 0.3])],
            calls: 0,
        }
    }
}

impl TrainableModel for DivergingModel {
    type Example = Sample;

    fn forward_loss(&mut self, _batch: &[Sample]) -> Result<f64> {
        let loss = 2f64.powi(self.calls);
        self.calls += 1;
        Ok(loss)
    }

    fn backward(&mut self) -> Result<()> {
        self.params[0].grad.iter_mut().for_each(|g| *g += 1.0);
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
        _data: &[Sample],
        _batch_size: usize,
        _out: Option<&Path>,
    ) -> Result<(Metric, f64)> {
        Ok((Metric::new("diverging"), 0.0))
    }
}

/// Produces NaN on the first batch.
pub struct NanModel {
    params: Vec<Parameter>,
}

impl NanModel {
    pub fn new() -> Self {
        Self {
            params: vec![Parameter::new("w", vec![0.0])],
        }
    }
}

impl TrainableModel for NanModel {
    type Example = Sample;

    fn forward_loss(&mut self, _batch: &[Sample]) -> Result<f64> {
        Ok(f64::NAN)
    }

    fn backward(&mut self) -> Result<()> {
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
        _data: &[Sample],
        _batch_size: usize,
        _out: Option<&Path>,
    ) -> Result<(Metric, f64)> {
        Ok((Metric::new("nan"), 0.0))
    }
}

/// Records events and cancels `token` once `epoch` has completed.
pub struct CancelAfterEpoch {
    pub inner: RecordingSink,
    pub token: CancellationToken,
    pub epoch: usize,
}

impl CancelAfterEpoch {
    pub fn new(token: CancellationToken, epoch: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RecordingSink::new(),
            token,
            epoch,
        })
    }
}

impl EventSink for CancelAfterEpoch {
    fn emit(&self, event: &TrainingEvent) {
        if let TrainingEvent::EpochCompleted { epoch, .. } = event
            && *epoch == self.epoch
        {
            self.token.cancel();
        }
        self.inner.emit(event);
    }
}

pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
