use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::config::ClassMapping;
use crate::data::image::Preprocess;
use crate::data::loader::resolve_samples;
use crate::data::manifest::LabeledRecord;
use crate::error::TriageError;
use crate::model::TriageNet;

pub type Metrics = BTreeMap<String, f64>;

/// Scores a model on a list of held-out records.
pub trait Evaluator<B: Backend> {
    fn evaluate(&mut self, model: &TriageNet<B>, records: &[LabeledRecord]) -> Result<Metrics>;
}

/// Rows are true classes, columns predicted classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(n_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; n_classes]; n_classes],
        }
    }

    pub fn add(&mut self, actual: usize, predicted: usize) {
        self.counts[actual][predicted] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let correct: u64 = (0..self.counts.len()).map(|c| self.counts[c][c]).sum();
        ratio(correct, self.total())
    }

    /// Recall of class `c`.
    pub fn sensitivity(&self, c: usize) -> f64 {
        ratio(self.counts[c][c], self.counts[c].iter().sum())
    }

    /// Precision of class `c`.
    pub fn ppv(&self, c: usize) -> f64 {
        ratio(self.counts[c][c], self.counts.iter().map(|row| row[c]).sum())
    }

    pub fn rows(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn to_metrics(&self, mapping: &ClassMapping) -> Metrics {
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), self.accuracy());
        for (c, name) in mapping.names().iter().enumerate() {
            metrics.insert(format!("sens_{name}"), self.sensitivity(c));
            metrics.insert(format!("ppv_{name}"), self.ppv(c));
        }
        metrics
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Index of the largest value in every row of a `[rows, cols]` buffer.
pub fn argmax_rows(values: &[f32], cols: usize) -> Vec<usize> {
    values
        .chunks(cols)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

/// Loads each record with the training preprocessing and runs inference in
/// batches.
pub struct ManifestEvaluator<B: Backend> {
    data_dir: PathBuf,
    preprocess: Preprocess,
    mapping: ClassMapping,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> ManifestEvaluator<B> {
    pub fn new(
        data_dir: PathBuf,
        preprocess: Preprocess,
        mapping: ClassMapping,
        batch_size: usize,
        device: B::Device,
    ) -> Self {
        Self {
            data_dir,
            preprocess,
            mapping,
            batch_size: batch_size.max(1),
            device,
        }
    }
}

impl<B: Backend> Evaluator<B> for ManifestEvaluator<B> {
    fn evaluate(&mut self, model: &TriageNet<B>, records: &[LabeledRecord]) -> Result<Metrics> {
        let samples = resolve_samples(records, &self.data_dir, &self.mapping)?;
        let n_classes = self.mapping.n_classes();
        let size = self.preprocess.input_size;
        let mut matrix = ConfusionMatrix::new(n_classes);

        for chunk in samples.chunks(self.batch_size) {
            let mut pixels = Vec::with_capacity(chunk.len() * 3 * size * size);
            for sample in chunk {
                let image = self
                    .preprocess
                    .load(&sample.path)
                    .with_context(|| format!("Failed to load test image: {:?}", sample.path))?;
                pixels.extend(image);
            }
            let images = Tensor::<B, 4>::from_data(
                TensorData::new(pixels, [chunk.len(), 3, size, size]),
                &self.device,
            );
            let prediction = model.forward(images).prediction;
            let cols = prediction.dims()[1];
            if cols != n_classes {
                return Err(TriageError::ClassCountMismatch {
                    graph: cols,
                    requested: n_classes,
                }
                .into());
            }
            let values = prediction
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("Failed to read predictions: {:?}", e))?;
            for (sample, predicted) in chunk.iter().zip(argmax_rows(&values, cols)) {
                matrix.add(sample.label, predicted);
            }
        }

        info!("Confusion matrix (rows: true, cols: predicted): {:?}", matrix.rows());
        let metrics = matrix.to_metrics(&self.mapping);
        for (name, value) in &metrics {
            info!("{}: {:.3}", name, value);
        }
        Ok(metrics)
    }
}
