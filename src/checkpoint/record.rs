use anyhow::{bail, Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::InitGraphConfig;
use crate::model::{GraphManifest, TriageNet, TriageNetConfig};

const INDEX_FILE: &str = "checkpoint.json";
const RUN_CONFIG_FILE: &str = "run_config.json";

/// One saved set of weights, optionally accompanied by the graph manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub step: Option<usize>,
    pub model_file: String,
    pub meta_file: Option<String>,
    pub timestamp: i64,
}

/// Every checkpoint written in a run directory, newest last.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub latest: Option<String>,
    pub checkpoints: Vec<CheckpointData>,
}

impl CheckpointIndex {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint index: {:?}", path))?;
        serde_json::from_str(&json).with_context(|| "Failed to parse checkpoint index")
    }

    fn push(&mut self, data: CheckpointData) {
        self.latest = Some(data.model_file.clone());
        self.checkpoints.push(data);
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(INDEX_FILE);
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize checkpoint index")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint index: {:?}", path))
    }
}

/// Writes `<name>` and `<name>-<step>` weight files into a run directory.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    run_dir: PathBuf,
    ckpt_name: String,
}

impl Checkpointer {
    pub fn new(run_dir: impl Into<PathBuf>, ckpt_name: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ckpt_name: ckpt_name.into(),
        }
    }

    /// Weights plus the graph manifest, under the bare checkpoint name.
    pub fn save_with_graph<B: Backend>(
        &self,
        model: &TriageNet<B>,
        manifest: &GraphManifest,
        meta_name: &str,
    ) -> Result<PathBuf> {
        manifest.save(&self.run_dir, meta_name)?;
        self.write(model, None, Some(meta_name.to_string()))
    }

    /// Weights only, under `<name>-<step>`.
    pub fn save_step<B: Backend>(&self, model: &TriageNet<B>, step: usize) -> Result<PathBuf> {
        self.write(model, Some(step), None)
    }

    fn write<B: Backend>(
        &self,
        model: &TriageNet<B>,
        step: Option<usize>,
        meta_file: Option<String>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.run_dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", self.run_dir))?;

        let model_file = match step {
            Some(step) => format!("{}-{}", self.ckpt_name, step),
            None => self.ckpt_name.clone(),
        };
        let model_path = self.run_dir.join(&model_file);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(model.clone().into_record(), model_path.clone())
            .with_context(|| format!("Failed to save model weights to: {:?}", model_path))?;

        let mut index = CheckpointIndex::load(&self.run_dir)?;
        index.push(CheckpointData {
            step,
            model_file,
            meta_file,
            timestamp: chrono::Utc::now().timestamp(),
        });
        index.save(&self.run_dir)?;

        info!("Saving checkpoint at: {:?}", model_path);
        Ok(model_path)
    }
}

/// Load weights saved under `ckpt_name` into `model`; a missing file is fatal.
pub fn restore_weights<B: Backend>(
    model: TriageNet<B>,
    dir: &Path,
    ckpt_name: &str,
    device: &B::Device,
) -> Result<TriageNet<B>> {
    let model_path = dir.join(ckpt_name);
    let file = model_path.with_extension("mpk");
    if !file.exists() {
        bail!("Checkpoint weights not found: {:?}", file);
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(model_path.clone(), device)
        .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;

    info!("Restored weights from {:?}", file);
    Ok(model.load_record(record))
}

/// Step-numbered weight files `<ckpt_name>-<step>.mpk` in `dir`, by step.
pub fn list_checkpoints(dir: &Path, ckpt_name: &str) -> Result<Vec<(PathBuf, usize)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let pattern = Regex::new(&format!(r"^{}-(\d+)\.mpk$", regex::escape(ckpt_name)))
        .with_context(|| "Failed to build checkpoint file pattern")?;

    let mut checkpoints: Vec<(PathBuf, usize)> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let step = pattern.captures(&name)?.get(1)?.as_str().parse().ok()?;
            Some((entry.path().to_path_buf(), step))
        })
        .collect();

    checkpoints.sort_by_key(|(_, step)| *step);
    Ok(checkpoints)
}

/// Report checkpoints left by an earlier run in `dir`; they are never loaded.
pub fn warn_existing_checkpoints(dir: &Path, ckpt_name: &str) -> Result<()> {
    let existing = list_checkpoints(dir, ckpt_name)?;
    if let Some((path, step)) = existing.last() {
        warn!(
            "{} checkpoints already in {:?} (latest step {} at {:?}); training starts from epoch 0",
            existing.len(),
            dir,
            step,
            path
        );
    }
    Ok(())
}

pub fn save_run_config<T: Serialize>(dir: &Path, config: &T) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create run directory: {:?}", dir))?;
    let path = dir.join(RUN_CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)
        .with_context(|| "Failed to serialize run configuration")?;
    fs::write(&path, json)
        .with_context(|| format!("Failed to write run configuration: {:?}", path))?;
    Ok(path)
}

/// Write a fresh graph manifest and randomly initialised weights.
pub fn init_graph<B: Backend>(config: &InitGraphConfig, device: &B::Device) -> Result<PathBuf> {
    let model_config = TriageNetConfig {
        n_classes: config.n_classes,
        input_size: config.input_size,
        semantic: !config.no_semantic,
        ..Default::default()
    };
    let model = TriageNet::<B>::new(&model_config, device)?;
    let manifest = GraphManifest::new(
        model_config,
        &config.tensors,
        Some(config.sem_out_tensorname.as_str()),
    );

    let checkpointer = Checkpointer::new(&config.checkpoint.weights_dir, &config.checkpoint.ckpt_name);
    let path = checkpointer.save_with_graph(&model, &manifest, &config.checkpoint.meta_name)?;
    info!(
        "Initial graph written to {:?} ({} endpoints)",
        config.checkpoint.weights_dir,
        manifest.endpoints.len()
    );
    Ok(path)
}
