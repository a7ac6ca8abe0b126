use clap::Args;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TriageError};

/// Class-name to index mapping for the supported label sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMapping {
    names: Vec<String>,
}

impl ClassMapping {
    /// 2 classes: negative/positive. 3 classes: normal/pneumonia/COVID-19.
    pub fn for_classes(n_classes: usize) -> Result<Self> {
        let names: &[&str] = match n_classes {
            2 => &["negative", "positive"],
            3 => &["normal", "pneumonia", "COVID-19"],
            other => return Err(TriageError::UnsupportedClassCount(other)),
        };
        Ok(Self {
            names: names.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn index(&self, label: &str) -> Option<usize> {
        self.names.iter().position(|name| name == label)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_classes(&self) -> usize {
        self.names.len()
    }

    /// The COVID-19 class is always the last one.
    pub fn covid_index(&self) -> usize {
        self.names.len() - 1
    }

    /// All ones except the COVID-19 entry, which is `covid_weight`.
    pub fn class_weights(&self, covid_weight: f32) -> Vec<f32> {
        let mut weights = vec![1.0; self.n_classes()];
        weights[self.covid_index()] = covid_weight;
        weights
    }
}

/// Names of the graph endpoints the drivers bind to after restore.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct TensorNames {
    /// Name of input tensor to graph
    #[arg(long = "in-tensorname", default_value = "input_1:0")]
    pub input: String,
    /// Name of output tensor from graph
    #[arg(long = "out-tensorname", default_value = "norm_dense_2/Softmax:0")]
    pub prediction: String,
    /// Name of logit tensor for loss
    #[arg(long = "logit-tensorname", default_value = "norm_dense_2/MatMul:0")]
    pub logits: String,
    /// Name of label tensor for loss
    #[arg(long = "label-tensorname", default_value = "norm_dense_1_target:0")]
    pub label: String,
    /// Name of sample weights tensor for loss
    #[arg(long = "weights-tensorname", default_value = "norm_dense_1_sample_weights:0")]
    pub sample_weight: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            input: "input_1:0".into(),
            prediction: "norm_dense_2/Softmax:0".into(),
            logits: "norm_dense_2/MatMul:0".into(),
            label: "norm_dense_1_target:0".into(),
            sample_weight: "norm_dense_1_sample_weights:0".into(),
        }
    }
}

/// Where the pretrained graph and weights live.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct CheckpointSource {
    /// Path to model files
    #[arg(long = "weightspath", default_value = "models/COVIDNet-CXR-2")]
    pub weights_dir: PathBuf,
    /// Name of ckpt meta file
    #[arg(long = "metaname", default_value = "model.meta")]
    pub meta_name: String,
    /// Name of model ckpts
    #[arg(long = "ckptname", default_value = "model")]
    pub ckpt_name: String,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct CrossValConfig {
    /// Number of epochs
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,
    /// Learning rate
    #[arg(long = "lr", default_value_t = 0.0002)]
    pub learning_rate: f64,
    /// Batch size
    #[arg(long = "bs", default_value_t = 8)]
    pub batch_size: usize,
    /// Number of detected classes
    #[arg(long, default_value_t = 2)]
    pub n_classes: usize,
    /// Path to the labeled manifest that gets split into folds
    #[arg(long = "file", default_value = "hospital_data.txt")]
    pub manifest: PathBuf,
    /// Name of folder to store training checkpoints
    #[arg(long, default_value = "COVIDNet")]
    pub name: String,
    /// Path to data folder
    #[arg(long = "datadir", default_value = "hospital_images")]
    pub data_dir: PathBuf,
    /// Class weighting for covid
    #[arg(long, default_value_t = 1.0)]
    pub covid_weight: f32,
    /// Percentage of covid samples in batch
    #[arg(long, default_value_t = 0.3)]
    pub covid_percent: f32,
    /// Size of input (ex: if 480x480, --input-size 480)
    #[arg(long, default_value_t = 480)]
    pub input_size: usize,
    /// Percent top crop from top of image
    #[arg(long, default_value_t = 0.08)]
    pub top_percent: f32,
    /// Number of cross-validation folds
    #[arg(long, default_value_t = 5)]
    pub folds: usize,
    /// Seed for the minority k-fold split and batch sampling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Label of the majority class that is chunked separately
    #[arg(long, default_value = "negative")]
    pub majority_label: String,
    /// Evaluation interval in epochs
    #[arg(long, default_value_t = 1)]
    pub display_step: usize,
    /// Root folder for run outputs
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,
    /// Device index
    #[arg(long = "cuda-n", default_value_t = 0)]
    pub device_index: usize,
    #[command(flatten)]
    pub checkpoint: CheckpointSource,
    #[command(flatten)]
    pub tensors: TensorNames,
}

impl CrossValConfig {
    pub fn validate(&self) -> Result<ClassMapping> {
        let mapping = ClassMapping::for_classes(self.n_classes)?;
        check_common(self.epochs, self.learning_rate, self.batch_size, self.input_size, self.top_percent)?;
        check_positive("display_step", self.display_step)?;
        if self.folds < 2 {
            return invalid(format!("folds must be >= 2, got {}", self.folds));
        }
        if !(0.0..=1.0).contains(&self.covid_percent) {
            return invalid(format!("covid_percent must be within [0,1], got {}", self.covid_percent));
        }
        Ok(mapping)
    }

    pub fn class_weights(&self, mapping: &ClassMapping) -> Vec<f32> {
        mapping.class_weights(self.covid_weight)
    }
}

impl fmt::Display for CrossValConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Number of epochs
    #[arg(long, default_value_t = 200)]
    pub epochs: usize,
    /// Learning rate
    #[arg(long = "lr", default_value_t = 0.0001)]
    pub learning_rate: f64,
    /// Batch size
    #[arg(long = "bs", default_value_t = 16)]
    pub batch_size: usize,
    /// Number of detected classes
    #[arg(long, default_value_t = 2)]
    pub n_classes: usize,
    /// Path to train file
    #[arg(long = "trainfile", default_value = "labels/train_COVIDx8B.txt")]
    pub train_file: PathBuf,
    /// Path to test file
    #[arg(long = "testfile", default_value = "labels/test_COVIDx8B.txt")]
    pub test_file: PathBuf,
    /// Manifest of test images whose semantic heatmaps are logged every epoch
    #[arg(long = "logged-images")]
    pub logged_images: Option<PathBuf>,
    /// Name of folder to store training checkpoints
    #[arg(long, default_value = "COVIDNet")]
    pub name: String,
    /// Path to data folder (holds `train/` and `test/`)
    #[arg(long = "datadir", default_value = "data")]
    pub data_dir: PathBuf,
    /// Initial epochs until training semantic
    #[arg(long, default_value_t = 0)]
    pub in_sem: usize,
    /// Epoch period of the semantic stage
    #[arg(long, default_value_t = 3)]
    pub switcher: usize,
    /// Class weighting for covid
    #[arg(long, default_value_t = 1.0)]
    pub covid_weight: f32,
    /// Size of input (ex: if 480x480, --input-size 480)
    #[arg(long, default_value_t = 480)]
    pub input_size: usize,
    /// Percent top crop from top of image
    #[arg(long, default_value_t = 0.08)]
    pub top_percent: f32,
    /// Type of backbone; `resnet0*` variants have no semantic stage
    #[arg(long, default_value = "resnet1")]
    pub resnet_type: String,
    /// Restore pretrained weights before training
    #[arg(long)]
    pub load_weight: bool,
    /// Batches per accumulated optimizer step
    #[arg(long, default_value_t = 4)]
    pub accumulation_steps: usize,
    /// Loss and image log interval in steps (batches)
    #[arg(long, default_value_t = 100)]
    pub log_interval: usize,
    /// Evaluation interval in epochs
    #[arg(long, default_value_t = 1)]
    pub display_step: usize,
    /// Seed for epoch shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Parameters whose names match this pattern belong to the semantic group
    #[arg(long, default_value = "^sem")]
    pub semantic_pattern: String,
    /// Parameter kept frozen during fine-tuning
    #[arg(long, default_value = "final_output/bias")]
    pub frozen_bias: String,
    /// Name of semantic network output tensor
    #[arg(long = "sem-out-tensorname", default_value = "sem/34/Sigmoid:0")]
    pub sem_out_tensorname: String,
    /// Root folder for run outputs
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,
    /// Device index
    #[arg(long = "cuda-n", default_value_t = 0)]
    pub device_index: usize,
    #[command(flatten)]
    pub checkpoint: CheckpointSource,
    #[command(flatten)]
    pub tensors: TensorNames,
}

impl FinetuneConfig {
    pub fn validate(&self) -> Result<ClassMapping> {
        let mapping = ClassMapping::for_classes(self.n_classes)?;
        check_common(self.epochs, self.learning_rate, self.batch_size, self.input_size, self.top_percent)?;
        check_positive("accumulation_steps", self.accumulation_steps)?;
        check_positive("log_interval", self.log_interval)?;
        check_positive("display_step", self.display_step)?;
        check_positive("switcher", self.switcher)?;
        if let Err(e) = regex::Regex::new(&self.semantic_pattern) {
            return invalid(format!("semantic_pattern is not a valid regex: {e}"));
        }
        Ok(mapping)
    }

    pub fn class_weights(&self, mapping: &ClassMapping) -> Vec<f32> {
        mapping.class_weights(self.covid_weight)
    }

    /// `resnet0*` backbones carry no semantic branch to train.
    pub fn has_semantic_stage(&self) -> bool {
        !self.resnet_type.starts_with("resnet0")
    }
}

impl fmt::Display for FinetuneConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct InitGraphConfig {
    /// Number of detected classes
    #[arg(long, default_value_t = 2)]
    pub n_classes: usize,
    /// Size of input
    #[arg(long, default_value_t = 480)]
    pub input_size: usize,
    /// Build the model without the semantic branch
    #[arg(long)]
    pub no_semantic: bool,
    #[command(flatten)]
    pub checkpoint: CheckpointSource,
    #[command(flatten)]
    pub tensors: TensorNames,
    /// Name given to the semantic output endpoint
    #[arg(long = "sem-out-tensorname", default_value = "sem/34/Sigmoid:0")]
    pub sem_out_tensorname: String,
}

fn check_common(
    epochs: usize,
    learning_rate: f64,
    batch_size: usize,
    input_size: usize,
    top_percent: f32,
) -> Result<()> {
    check_positive("epochs", epochs)?;
    check_positive("batch_size", batch_size)?;
    check_positive("input_size", input_size)?;
    if !(learning_rate > 0.0) {
        return invalid(format!("learning rate must be > 0, got {learning_rate}"));
    }
    if !(0.0..1.0).contains(&top_percent) {
        return invalid(format!("top_percent must be within [0,1), got {top_percent}"));
    }
    Ok(())
}

fn check_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return invalid(format!("{name} must be > 0"));
    }
    Ok(())
}

fn invalid<T>(message: String) -> Result<T> {
    Err(TriageError::InvalidConfig(message))
}
