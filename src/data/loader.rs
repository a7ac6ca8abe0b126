use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::image::Preprocess;
use super::manifest::LabeledRecord;
use crate::config::ClassMapping;
use crate::error::TriageError;
use crate::training::TrainBatch;

/// Source of training batches consumed by the epoch loops.
pub trait BatchSource<B: Backend> {
    /// Get the next batch of the current epoch
    fn next_batch(&mut self) -> Result<Option<TrainBatch<B>>>;

    /// Start a new epoch
    fn reset(&mut self);

    /// Number of batches in one epoch
    fn num_batches(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSample {
    pub path: PathBuf,
    pub label: usize,
}

/// Resolve records to image paths and class indices; unknown labels are fatal.
pub fn resolve_samples(
    records: &[LabeledRecord],
    data_dir: &Path,
    mapping: &ClassMapping,
) -> Result<Vec<LabeledSample>, TriageError> {
    records
        .iter()
        .map(|record| {
            let label = mapping
                .index(&record.label)
                .ok_or_else(|| TriageError::UnknownLabel(record.label.clone()))?;
            let path = record
                .image_path(data_dir)
                .ok_or_else(|| TriageError::MissingFileName(record.label.clone()))?;
            Ok(LabeledSample { path, label })
        })
        .collect()
}

fn load_batch<B: Backend>(
    samples: &[&LabeledSample],
    preprocess: &Preprocess,
    class_weights: &[f32],
    device: &B::Device,
) -> Result<TrainBatch<B>> {
    let mut images = Vec::with_capacity(samples.len() * 3 * preprocess.input_size * preprocess.input_size);
    let mut labels = Vec::with_capacity(samples.len());
    for sample in samples {
        let pixels = preprocess
            .load(&sample.path)
            .with_context(|| format!("Failed to load training image: {:?}", sample.path))?;
        images.extend(pixels);
        labels.push(sample.label);
    }
    Ok(TrainBatch::from_samples(
        images,
        &labels,
        class_weights,
        preprocess.input_size,
        device,
    ))
}

#[derive(Debug, Clone)]
pub struct BalanceOptions {
    pub batch_size: usize,
    pub covid_percent: f32,
    pub class_weights: Vec<f32>,
    pub preprocess: Preprocess,
    pub seed: u64,
}

/// Class-balanced generator: every batch carries a fixed share of COVID-19
/// samples drawn at random, the rest walks through the shuffled other classes.
pub struct BalancedBatchSource<B: Backend> {
    regular: Vec<LabeledSample>,
    minority: Vec<LabeledSample>,
    minority_per_batch: usize,
    options: BalanceOptions,
    rng: ChaCha8Rng,
    cursor: usize,
    emitted: usize,
    device: B::Device,
}

impl<B: Backend> BalancedBatchSource<B> {
    pub fn new(
        files: &[LabeledRecord],
        neg_files: &[LabeledRecord],
        data_dir: &Path,
        mapping: &ClassMapping,
        options: BalanceOptions,
        device: B::Device,
    ) -> Result<Self> {
        let covid = mapping.covid_index();
        let (minority, mut regular): (Vec<_>, Vec<_>) = resolve_samples(files, data_dir, mapping)?
            .into_iter()
            .partition(|sample| sample.label == covid);
        regular.extend(resolve_samples(neg_files, data_dir, mapping)?);

        let minority_per_batch = if minority.is_empty() {
            0
        } else {
            ((options.batch_size as f32 * options.covid_percent).floor() as usize)
                .max(1)
                .min(options.batch_size)
        };

        info!(
            "Balanced source: {} regular, {} covid samples, {} covid per batch of {}",
            regular.len(),
            minority.len(),
            minority_per_batch,
            options.batch_size
        );

        let rng = ChaCha8Rng::seed_from_u64(options.seed);
        Ok(Self {
            regular,
            minority,
            minority_per_batch,
            options,
            rng,
            cursor: 0,
            emitted: 0,
            device,
        })
    }

    pub fn minority_per_batch(&self) -> usize {
        self.minority_per_batch
    }

    /// Pick the samples of the next batch without loading any image.
    fn next_samples(&mut self) -> Option<Vec<&LabeledSample>> {
        if self.emitted >= self.num_batches() {
            return None;
        }
        self.emitted += 1;

        let take = self.options.batch_size - self.minority_per_batch;
        let end = (self.cursor + take).min(self.regular.len());
        let start = self.cursor;
        self.cursor = end;

        let mut picked: Vec<&LabeledSample> = self.regular[start..end].iter().collect();
        let count = self.minority_per_batch.min(self.minority.len());
        picked.extend(self.minority.choose_multiple(&mut self.rng, count));

        if picked.is_empty() {
            None
        } else {
            Some(picked)
        }
    }
}

impl<B: Backend> BatchSource<B> for BalancedBatchSource<B> {
    fn next_batch(&mut self) -> Result<Option<TrainBatch<B>>> {
        let device = self.device.clone();
        let preprocess = self.options.preprocess;
        let class_weights = self.options.class_weights.clone();
        match self.next_samples() {
            Some(samples) => load_batch(&samples, &preprocess, &class_weights, &device).map(Some),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.regular.shuffle(&mut self.rng);
        self.cursor = 0;
        self.emitted = 0;
    }

    fn num_batches(&self) -> usize {
        let pool = if self.regular.is_empty() {
            self.minority.len()
        } else {
            self.regular.len()
        };
        pool.div_ceil(self.options.batch_size)
    }
}

/// Plain iterator over a manifest, reshuffled from `seed + epoch` each epoch.
pub struct ShuffledBatchSource<B: Backend> {
    samples: Vec<LabeledSample>,
    order: Vec<usize>,
    batch_size: usize,
    class_weights: Vec<f32>,
    preprocess: Preprocess,
    seed: u64,
    epoch: u64,
    cursor: usize,
    device: B::Device,
}

impl<B: Backend> ShuffledBatchSource<B> {
    pub fn new(
        samples: Vec<LabeledSample>,
        batch_size: usize,
        class_weights: Vec<f32>,
        preprocess: Preprocess,
        seed: u64,
        device: B::Device,
    ) -> Self {
        let order = (0..samples.len()).collect();
        Self {
            samples,
            order,
            batch_size,
            class_weights,
            preprocess,
            seed,
            epoch: 0,
            cursor: 0,
            device,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<B: Backend> BatchSource<B> for ShuffledBatchSource<B> {
    fn next_batch(&mut self) -> Result<Option<TrainBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picked: Vec<&LabeledSample> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.samples[i])
            .collect();
        self.cursor = end;
        load_batch(&picked, &self.preprocess, &self.class_weights, &self.device).map(Some)
    }

    fn reset(&mut self) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        self.order.shuffle(&mut rng);
        self.epoch += 1;
        self.cursor = 0;
        debug!("Reshuffled {} samples for epoch {}", self.order.len(), self.epoch);
    }

    fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }
}

/// Deterministic in-memory batches; each class gets a constant intensity.
pub struct SyntheticBatchSource<B: Backend> {
    batch_size: usize,
    num_batches: usize,
    input_size: usize,
    class_weights: Vec<f32>,
    current_batch: usize,
    device: B::Device,
}

impl<B: Backend> SyntheticBatchSource<B> {
    pub fn new(
        batch_size: usize,
        num_batches: usize,
        input_size: usize,
        class_weights: Vec<f32>,
        device: B::Device,
    ) -> Self {
        Self {
            batch_size,
            num_batches,
            input_size,
            class_weights,
            current_batch: 0,
            device,
        }
    }
}

impl<B: Backend> BatchSource<B> for SyntheticBatchSource<B> {
    fn next_batch(&mut self) -> Result<Option<TrainBatch<B>>> {
        if self.current_batch >= self.num_batches {
            return Ok(None);
        }
        self.current_batch += 1;

        let n_classes = self.class_weights.len();
        let plane = 3 * self.input_size * self.input_size;
        let labels: Vec<usize> = (0..self.batch_size).map(|i| i % n_classes).collect();
        let images: Vec<f32> = labels
            .iter()
            .flat_map(|&label| {
                let value = (label + 1) as f32 / (n_classes + 1) as f32;
                std::iter::repeat(value).take(plane)
            })
            .collect();

        Ok(Some(TrainBatch::from_samples(
            images,
            &labels,
            &self.class_weights,
            self.input_size,
            &self.device,
        )))
    }

    fn reset(&mut self) {
        self.current_batch = 0;
    }

    fn num_batches(&self) -> usize {
        self.num_batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_images(dir: &Path, prefix: &str, count: usize, label: &str) -> Vec<LabeledRecord> {
        (0..count)
            .map(|i| {
                let name = format!("{prefix}_{i}.png");
                RgbImage::from_pixel(12, 12, Rgb([(i * 10) as u8, 0, 0]))
                    .save(dir.join(&name))
                    .unwrap();
                LabeledRecord::new(name, label)
            })
            .collect()
    }

    fn options(batch_size: usize, covid_percent: f32) -> BalanceOptions {
        BalanceOptions {
            batch_size,
            covid_percent,
            class_weights: vec![1.0, 5.0],
            preprocess: Preprocess::new(8, 0.0),
            seed: 42,
        }
    }

    #[test]
    fn test_balanced_batches_carry_covid_share() {
        let dir = TempDir::new().unwrap();
        let positives = write_images(dir.path(), "pos", 3, "positive");
        let negatives = write_images(dir.path(), "neg", 10, "negative");
        let mapping = ClassMapping::for_classes(2).unwrap();

        let mut source = BalancedBatchSource::<TestBackend>::new(
            &positives,
            &negatives,
            dir.path(),
            &mapping,
            options(4, 0.5),
            Default::default(),
        )
        .unwrap();
        assert_eq!(source.minority_per_batch(), 2);
        assert_eq!(source.num_batches(), 3);

        source.reset();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), [4, 3, 8, 8]);
        let weights = batch.weights.into_data().to_vec::<f32>().unwrap();
        assert_eq!(weights.iter().filter(|w| **w == 5.0).count(), 2);

        let mut batches = 1;
        while source.next_batch().unwrap().is_some() {
            batches += 1;
        }
        assert_eq!(batches, 3);

        source.reset();
        assert!(source.next_batch().unwrap().is_some());
    }

    #[test]
    fn test_at_least_one_covid_sample() {
        let dir = TempDir::new().unwrap();
        let positives = write_images(dir.path(), "pos", 2, "positive");
        let negatives = write_images(dir.path(), "neg", 4, "negative");
        let mapping = ClassMapping::for_classes(2).unwrap();
        let source = BalancedBatchSource::<TestBackend>::new(
            &positives,
            &negatives,
            dir.path(),
            &mapping,
            options(2, 0.1),
            Default::default(),
        )
        .unwrap();
        assert_eq!(source.minority_per_batch(), 1);
    }

    #[test]
    fn test_unknown_label_is_fatal() {
        let records = vec![LabeledRecord::new("a.png", "pneumonia")];
        let mapping = ClassMapping::for_classes(2).unwrap();
        let err = resolve_samples(&records, Path::new("."), &mapping).unwrap_err();
        assert!(matches!(err, TriageError::UnknownLabel(label) if label == "pneumonia"));
    }

    #[test]
    fn test_shuffled_source_covers_every_sample() {
        let dir = TempDir::new().unwrap();
        let records = write_images(dir.path(), "img", 5, "negative");
        let mapping = ClassMapping::for_classes(2).unwrap();
        let samples = resolve_samples(&records, dir.path(), &mapping).unwrap();

        let mut source = ShuffledBatchSource::<TestBackend>::new(
            samples,
            2,
            vec![1.0, 1.0],
            Preprocess::new(8, 0.0),
            42,
            Default::default(),
        );
        assert_eq!(source.num_batches(), 3);

        source.reset();
        let mut total = 0;
        while let Some(batch) = source.next_batch().unwrap() {
            total += batch.len();
        }
        assert_eq!(total, 5);
    }

    #[test]
    fn test_synthetic_source() {
        let mut source =
            SyntheticBatchSource::<TestBackend>::new(4, 2, 8, vec![1.0, 2.0], Default::default());
        assert!(source.next_batch().unwrap().is_some());
        assert!(source.next_batch().unwrap().is_some());
        assert!(source.next_batch().unwrap().is_none());
        source.reset();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.weights.into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
    }
}
