//! Stratified fold partitioning.
//!
//! The majority class is split into contiguous chunks independently of the
//! minority class, which goes through a seeded shuffled k-fold. Each fold's
//! test set is one majority chunk plus one minority test slice.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use super::manifest::LabeledRecord;
use crate::error::{Result, TriageError};

pub const DEFAULT_FOLDS: usize = 5;
pub const DEFAULT_SEED: u64 = 42;

/// Shuffled k-fold index splitter with a fixed seed.
#[derive(Debug, Clone, Copy)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, seed: u64) -> Self {
        Self { n_splits, seed }
    }

    /// Returns `(train, test)` index lists per fold, both sorted ascending.
    pub fn split(&self, n_samples: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        if self.n_splits < 2 || n_samples < self.n_splits {
            return Err(TriageError::TooFewSamples {
                what: "minority",
                available: n_samples,
                folds: self.n_splits,
            });
        }

        let mut permuted: Vec<usize> = (0..n_samples).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        permuted.shuffle(&mut rng);

        let base = n_samples / self.n_splits;
        let extra = n_samples % self.n_splits;

        let mut splits = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = if fold < extra { base + 1 } else { base };
            let stop = start + size;

            let mut test = permuted[start..stop].to_vec();
            test.sort_unstable();
            let mut train: Vec<usize> = permuted[..start]
                .iter()
                .chain(permuted[stop..].iter())
                .copied()
                .collect();
            train.sort_unstable();

            splits.push((train, test));
            start = stop;
        }
        Ok(splits)
    }
}

/// Split `records` into exactly `k` contiguous chunks of `floor(n / k)`.
///
/// Surplus chunks are folded back by merging the last two (last chunk's
/// records first) until `k` remain, so the final chunk absorbs the remainder.
pub fn chunk_majority<T: Clone>(records: &[T], k: usize) -> Result<Vec<Vec<T>>> {
    let step = if k == 0 { 0 } else { records.len() / k };
    if step == 0 {
        return Err(TriageError::TooFewSamples {
            what: "majority",
            available: records.len(),
            folds: k,
        });
    }

    let mut chunks: Vec<Vec<T>> = records.chunks(step).map(<[T]>::to_vec).collect();
    while chunks.len() > k {
        let last = chunks.pop().unwrap_or_default();
        let second_last = chunks.pop().unwrap_or_default();
        let mut merged = last;
        merged.extend(second_last);
        chunks.push(merged);
    }
    Ok(chunks)
}

#[derive(Debug, Clone)]
pub struct FoldSplit {
    pub index: usize,
    pub train_minority: Vec<LabeledRecord>,
    pub test_minority: Vec<LabeledRecord>,
    pub train_majority: Vec<LabeledRecord>,
    pub test_majority: Vec<LabeledRecord>,
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
}

impl FoldSplit {
    /// Held-out records: minority test slice followed by the majority chunk.
    pub fn test_records(&self) -> Vec<LabeledRecord> {
        self.test_minority
            .iter()
            .chain(self.test_majority.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FoldPlan {
    pub majority_chunks: Vec<Vec<LabeledRecord>>,
    pub minority: Vec<LabeledRecord>,
    pub folds: Vec<FoldSplit>,
}

impl FoldPlan {
    pub fn fold(&self, index: usize) -> Option<&FoldSplit> {
        self.folds.get(index)
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FoldPartitioner {
    folds: usize,
    seed: u64,
    majority_label: String,
}

impl FoldPartitioner {
    pub fn new(folds: usize, majority_label: impl Into<String>) -> Self {
        Self {
            folds,
            seed: DEFAULT_SEED,
            majority_label: majority_label.into(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn partition(&self, records: &[LabeledRecord]) -> Result<FoldPlan> {
        // Majority records are taken in reverse manifest order.
        let majority: Vec<LabeledRecord> = records
            .iter()
            .rev()
            .filter(|r| r.label == self.majority_label)
            .cloned()
            .collect();
        let minority: Vec<LabeledRecord> = records
            .iter()
            .filter(|r| r.label != self.majority_label)
            .cloned()
            .collect();

        info!(
            "Partitioning {} {} and {} other records into {} folds",
            majority.len(),
            self.majority_label,
            minority.len(),
            self.folds
        );

        let majority_chunks = chunk_majority(&majority, self.folds)?;
        let splits = KFold::new(self.folds, self.seed).split(minority.len())?;

        let pick = |indices: &[usize]| -> Vec<LabeledRecord> {
            indices.iter().map(|&i| minority[i].clone()).collect()
        };

        let folds = splits
            .into_iter()
            .enumerate()
            .map(|(index, (train_indices, test_indices))| {
                let train_majority: Vec<LabeledRecord> = majority_chunks
                    .iter()
                    .enumerate()
                    .filter(|(chunk, _)| *chunk != index)
                    .flat_map(|(_, records)| records.iter().cloned())
                    .collect();
                let test_majority = majority_chunks[index].clone();

                debug!(
                    "Fold {}: {} majority train, {} majority test, {} minority train, {} minority test",
                    index,
                    train_majority.len(),
                    test_majority.len(),
                    train_indices.len(),
                    test_indices.len()
                );

                FoldSplit {
                    index,
                    train_minority: pick(&train_indices),
                    test_minority: pick(&test_indices),
                    train_majority,
                    test_majority,
                    train_indices,
                    test_indices,
                }
            })
            .collect();

        Ok(FoldPlan {
            majority_chunks,
            minority,
            folds,
        })
    }
}
