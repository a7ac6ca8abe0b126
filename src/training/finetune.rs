use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::accumulator::GradientAccumulator;
use super::batch::TrainBatch;
use super::cross_val::EpochReport;
use super::eval::{Evaluator, ManifestEvaluator, Metrics};
use super::loss::weighted_cross_entropy;
use super::phase::{Phase, PhaseTracker};
use super::stage::{StageSchedule, TrainingStage};
use super::variables::VariableGroups;
use crate::checkpoint::{restore_weights, save_run_config, warn_existing_checkpoints, Checkpointer};
use crate::config::{ClassMapping, FinetuneConfig};
use crate::data::image::Preprocess;
use crate::data::loader::{resolve_samples, BatchSource, ShuffledBatchSource};
use crate::data::manifest::{read_manifest, LabeledRecord};
use crate::model::{GraphBindings, GraphManifest, ParamSlot, TriageNet};
use crate::utils::{epoch_bar, SummaryWriter};

const TRAIN_IMAGE_OUTPUTS: usize = 5;

/// Adam optimizer fed from a gradient accumulator over one parameter group.
struct GroupOptimizer<B: AutodiffBackend> {
    optimizer: OptimizerAdaptor<Adam, TriageNet<B>, B>,
    accumulator: GradientAccumulator<B::InnerBackend>,
    steps: usize,
}

impl<B: AutodiffBackend> GroupOptimizer<B> {
    fn new(slots: Vec<ParamSlot>, accumulation_steps: usize, device: &B::Device) -> Self {
        Self {
            optimizer: AdamConfig::new().init::<B, TriageNet<B>>(),
            accumulator: GradientAccumulator::new(slots, accumulation_steps, device),
            steps: 0,
        }
    }
}

/// Staged fine-tuning with gradient accumulation.
///
/// Parameters are split into a backbone and a semantic group, each with its
/// own optimizer. On every `accumulation_steps`-th batch of an epoch the
/// active group's accumulated gradients are applied before the batch's own
/// gradients are added.
pub struct FinetuneTrainer<B: AutodiffBackend> {
    model: TriageNet<B>,
    backbone: GroupOptimizer<B>,
    semantic: Option<GroupOptimizer<B>>,
    schedule: StageSchedule,
    learning_rate: f64,
}

impl<B: AutodiffBackend> FinetuneTrainer<B> {
    pub fn new(
        model: TriageNet<B>,
        groups: VariableGroups,
        schedule: StageSchedule,
        learning_rate: f64,
        accumulation_steps: usize,
        device: &B::Device,
    ) -> Self {
        let semantic = if groups.semantic.is_empty() {
            None
        } else {
            Some(GroupOptimizer::new(groups.semantic, accumulation_steps, device))
        };
        Self {
            model,
            backbone: GroupOptimizer::new(groups.backbone, accumulation_steps, device),
            semantic,
            schedule,
            learning_rate,
        }
    }

    pub fn stage(&self, epoch: usize) -> TrainingStage {
        self.schedule.select(epoch)
    }

    pub fn train_batch(&mut self, batch_index: usize, stage: TrainingStage, batch: &TrainBatch<B>) -> f32 {
        let lr = self.learning_rate;
        let Self {
            model,
            backbone,
            semantic,
            ..
        } = self;
        let group = match (stage, semantic.as_mut()) {
            (TrainingStage::Semantic, Some(group)) => group,
            _ => backbone,
        };

        if group.accumulator.should_apply(batch_index) {
            let current = model.clone();
            let optimizer = &mut group.optimizer;
            *model = group
                .accumulator
                .apply(|grads| optimizer.step(lr, current, grads));
            group.steps += 1;
        }

        let output = model.forward(batch.images.clone());
        let loss = weighted_cross_entropy(
            output.logits,
            batch.labels.clone(),
            Some(batch.weights.clone()),
        );
        let value = loss.clone().into_scalar().elem::<f32>();

        let grads = GradientsParams::from_grads(loss.backward(), &*model);
        group.accumulator.accumulate(&grads);
        value
    }

    pub fn loss_on(&self, batch: &TrainBatch<B>) -> f32 {
        let model = self.model.valid();
        let output = model.forward(batch.images.clone().inner());
        weighted_cross_entropy(
            output.logits,
            batch.labels.clone().inner(),
            Some(batch.weights.clone().inner()),
        )
        .into_scalar()
        .elem::<f32>()
    }

    pub fn model(&self) -> &TriageNet<B> {
        &self.model
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn backbone_steps(&self) -> usize {
        self.backbone.steps
    }

    pub fn semantic_steps(&self) -> usize {
        self.semantic.as_ref().map_or(0, |group| group.steps)
    }
}

/// Test images whose semantic heatmaps are logged once per epoch.
pub struct LoggedImages<B: Backend> {
    positive: Option<Tensor<B, 4>>,
    negative: Option<Tensor<B, 4>>,
}

impl<B: Backend> LoggedImages<B> {
    pub fn none() -> Self {
        Self {
            positive: None,
            negative: None,
        }
    }

    /// COVID-labelled records go to the positive stack, the rest to the
    /// negative one.
    pub fn load(
        records: &[LabeledRecord],
        data_dir: &Path,
        mapping: &ClassMapping,
        preprocess: &Preprocess,
        device: &B::Device,
    ) -> Result<Self> {
        let samples = resolve_samples(records, data_dir, mapping)?;
        let covid = mapping.covid_index();
        let (positive, negative): (Vec<_>, Vec<_>) =
            samples.into_iter().partition(|sample| sample.label == covid);

        let stack = |paths: Vec<PathBuf>| -> Result<Option<Tensor<B, 4>>> {
            if paths.is_empty() {
                return Ok(None);
            }
            let size = preprocess.input_size;
            let mut pixels = Vec::with_capacity(paths.len() * 3 * size * size);
            for path in &paths {
                let image = preprocess
                    .load(path)
                    .with_context(|| format!("Failed to load logged image: {:?}", path))?;
                pixels.extend(image);
            }
            Ok(Some(Tensor::from_data(
                TensorData::new(pixels, [paths.len(), 3, size, size]),
                device,
            )))
        };

        Ok(Self {
            positive: stack(positive.into_iter().map(|s| s.path).collect())?,
            negative: stack(negative.into_iter().map(|s| s.path).collect())?,
        })
    }

    pub fn write(&self, model: &TriageNet<B>, summary: &mut SummaryWriter, step: usize) -> Result<()> {
        for (tag, images) in [
            ("test/semantic/positive", &self.positive),
            ("test/semantic/negative", &self.negative),
        ] {
            let Some(images) = images else {
                continue;
            };
            if let Some(mask) = model.semantic_mask(images.clone()) {
                let count = images.dims()[0];
                summary.add_heatmaps(tag, images.clone(), mask, step, count)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FinetuneReport {
    pub run_dir: PathBuf,
    pub baseline: Metrics,
    pub history: Vec<EpochReport>,
    pub backbone_steps: usize,
    pub semantic_steps: usize,
}

pub struct FinetuneContext<'a, B: Backend> {
    pub checkpointer: &'a Checkpointer,
    pub manifest: &'a GraphManifest,
    pub meta_name: &'a str,
    pub test_records: &'a [LabeledRecord],
    pub logged: &'a LoggedImages<B>,
    pub epochs: usize,
    pub display_step: usize,
    pub log_interval: usize,
}

pub fn train_stages<B, S, E>(
    trainer: &mut FinetuneTrainer<B>,
    source: &mut S,
    evaluator: &mut E,
    summary: &mut SummaryWriter,
    ctx: &FinetuneContext<'_, B::InnerBackend>,
) -> Result<(Metrics, Vec<EpochReport>)>
where
    B: AutodiffBackend,
    S: BatchSource<B>,
    E: Evaluator<B::InnerBackend>,
{
    let mut tracker = PhaseTracker::new();

    ctx.checkpointer
        .save_with_graph(trainer.model(), ctx.manifest, ctx.meta_name)?;
    info!("Saved baseline checkpoint");

    tracker.advance(Phase::BaselineEval)?;
    info!("Baseline eval:");
    ctx.logged.write(&trainer.model().valid(), summary, 0)?;
    let baseline = evaluator.evaluate(&trainer.model().valid(), ctx.test_records)?;
    summary.add_scalars("val/", &baseline, 0)?;

    info!("Training started");
    let total_batch = source.num_batches();
    let mut history = Vec::new();

    for epoch in 0..ctx.epochs {
        tracker.advance(Phase::TrainingEpoch)?;
        let stage = trainer.stage(epoch);
        debug!("Epoch {} trains the {:?} group", epoch, stage);

        ctx.logged.write(&trainer.model().valid(), summary, epoch)?;

        source.reset();
        let pb = epoch_bar(epoch, ctx.epochs, total_batch);
        let mut last_batch = None;
        for i in 0..total_batch {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let total_steps = epoch * total_batch + i;
            let loss = trainer.train_batch(i, stage, &batch);

            if total_steps % ctx.log_interval == 0 {
                summary.add_scalar("train/loss", loss as f64, total_steps)?;
                let images = batch.images.clone().inner();
                if let Some(mask) = trainer.model().valid().semantic_mask(images.clone()) {
                    summary.add_heatmaps("train/semantic", images, mask, total_steps, TRAIN_IMAGE_OUTPUTS)?;
                }
            }
            pb.inc(1);
            last_batch = Some(batch);
        }
        pb.finish_and_clear();

        if epoch % ctx.display_step == 0 {
            tracker.advance(Phase::PeriodicEval)?;
            let loss = last_batch.as_ref().map(|batch| trainer.loss_on(batch));
            if let (Some(loss), Some(batch)) = (loss, last_batch.as_ref()) {
                info!("Epoch: {:04} Minibatch loss={:.9}", epoch + 1, loss);
                info!("lr: {}, batch_size: {}", trainer.learning_rate(), batch.len());
            }
            let metrics = evaluator.evaluate(&trainer.model().valid(), ctx.test_records)?;
            summary.add_scalars("val/", &metrics, (epoch + 1) * total_batch)?;

            tracker.advance(Phase::Checkpointing)?;
            ctx.checkpointer.save_step(trainer.model(), epoch + 1)?;
            info!("Saving checkpoint at epoch {}", epoch + 1);

            history.push(EpochReport {
                epoch,
                loss,
                metrics,
            });
        }
    }

    tracker.advance(Phase::Done)?;
    Ok((baseline, history))
}

/// Fine-tune a pretrained model on a train manifest, evaluating on a test
/// manifest after every `display_step` epochs.
pub fn run_finetune<B: AutodiffBackend>(
    config: &FinetuneConfig,
    device: &B::Device,
) -> Result<FinetuneReport> {
    let mapping = config.validate()?;
    let class_weights = config.class_weights(&mapping);
    let semantic_pattern = Regex::new(&config.semantic_pattern)
        .with_context(|| format!("Invalid semantic pattern: {}", config.semantic_pattern))?;

    let manifest = GraphManifest::load(&config.checkpoint.weights_dir, &config.checkpoint.meta_name)?;
    let semantic_output = manifest
        .model
        .semantic
        .then_some(config.sem_out_tensorname.as_str());
    let bindings = GraphBindings::bind(&manifest, &config.tensors, semantic_output)?;
    info!(
        "Feeding {} and {}, training on {}",
        bindings.input.name, bindings.label.name, bindings.logits.name
    );
    manifest.ensure_classes(mapping.n_classes())?;

    let train_records = read_manifest(&config.train_file)?;
    let test_records = read_manifest(&config.test_file)?;
    let preprocess = Preprocess::new(config.input_size, config.top_percent);
    let test_dir = config.data_dir.join("test");

    let timestamp = chrono::Local::now().format("%Y-%m-%d#%H-%M-%S%.6f");
    let run_dir = config.output_dir.join(format!(
        "{}{}-lr{}",
        timestamp, config.name, config.learning_rate
    ));
    save_run_config(&run_dir, config)?;
    warn_existing_checkpoints(&run_dir, "model")?;
    info!("Output: {:?}", run_dir);

    let logged = match &config.logged_images {
        Some(path) => LoggedImages::load(
            &read_manifest(path)?,
            &test_dir,
            &mapping,
            &preprocess,
            device,
        )?,
        None => LoggedImages::none(),
    };

    let model = TriageNet::<B>::new(&manifest.model, device)?;
    let model = if config.load_weight {
        restore_weights(
            model,
            &config.checkpoint.weights_dir,
            &config.checkpoint.ckpt_name,
            device,
        )?
    } else {
        info!("Starting from initialised weights");
        model
    };

    let mut groups = VariableGroups::partition(model.parameter_slots(), &semantic_pattern);
    groups.freeze(&config.frozen_bias);
    let schedule = StageSchedule::new(
        config.in_sem,
        config.switcher,
        config.has_semantic_stage() && model.has_semantic(),
    );
    let mut trainer = FinetuneTrainer::new(
        model,
        groups,
        schedule,
        config.learning_rate,
        config.accumulation_steps,
        device,
    );

    let samples = resolve_samples(&train_records, &config.data_dir.join("train"), &mapping)?;
    let mut source = ShuffledBatchSource::<B>::new(
        samples,
        config.batch_size,
        class_weights,
        preprocess,
        config.seed,
        device.clone(),
    );
    let mut evaluator = ManifestEvaluator::<B::InnerBackend>::new(
        test_dir,
        preprocess,
        mapping,
        config.batch_size,
        device.clone(),
    );
    let mut summary = SummaryWriter::new(&run_dir)?;
    let checkpointer = Checkpointer::new(&run_dir, "model");

    let ctx = FinetuneContext {
        checkpointer: &checkpointer,
        manifest: &manifest,
        meta_name: &config.checkpoint.meta_name,
        test_records: &test_records,
        logged: &logged,
        epochs: config.epochs,
        display_step: config.display_step,
        log_interval: config.log_interval,
    };
    let (baseline, history) =
        train_stages(&mut trainer, &mut source, &mut evaluator, &mut summary, &ctx)?;

    info!("Optimization Finished!");
    Ok(FinetuneReport {
        run_dir,
        baseline,
        history,
        backbone_steps: trainer.backbone_steps(),
        semantic_steps: trainer.semantic_steps(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::init_graph;
    use crate::config::tests::{finetune_config, init_graph_config};
    use crate::config::TensorNames;
    use crate::data::loader::SyntheticBatchSource;
    use crate::error::TriageError;
    use crate::model::TriageNetConfig;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    struct FixedEvaluator;

    impl<B: Backend> Evaluator<B> for FixedEvaluator {
        fn evaluate(&mut self, _model: &TriageNet<B>, _records: &[LabeledRecord]) -> Result<Metrics> {
            let mut metrics = Metrics::new();
            metrics.insert("accuracy".into(), 0.5);
            Ok(metrics)
        }
    }

    fn model_config() -> TriageNetConfig {
        TriageNetConfig {
            input_size: 8,
            base_filters: 2,
            semantic_filters: 2,
            semantic: true,
            ..Default::default()
        }
    }

    fn trainer(device: &<TestBackend as Backend>::Device) -> FinetuneTrainer<TestBackend> {
        let model = TriageNet::<TestBackend>::new(&model_config(), device).unwrap();
        let mut groups =
            VariableGroups::partition(model.parameter_slots(), &Regex::new("^sem").unwrap());
        groups.freeze("final_output/bias");
        FinetuneTrainer::new(model, groups, StageSchedule::new(0, 3, true), 0.01, 4, device)
    }

    fn bias_values(trainer: &FinetuneTrainer<TestBackend>) -> Vec<f32> {
        trainer
            .model()
            .output_bias()
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn test_semantic_optimizer_never_steps() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let mut trainer = trainer(&device);
        let mut source = SyntheticBatchSource::<TestBackend>::new(2, 6, 8, vec![1.0, 1.0], device);
        let mut summary = SummaryWriter::new(dir.path()).unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "model");
        let manifest = GraphManifest::new(model_config(), &TensorNames::default(), Some("sem/34/Sigmoid:0"));
        let logged = LoggedImages::none();

        let ctx = FinetuneContext {
            checkpointer: &checkpointer,
            manifest: &manifest,
            meta_name: "model.meta",
            test_records: &[],
            logged: &logged,
            epochs: 4,
            display_step: 1,
            log_interval: 5,
        };
        let (_, history) =
            train_stages(&mut trainer, &mut source, &mut FixedEvaluator, &mut summary, &ctx).unwrap();

        assert_eq!(history.len(), 4);
        assert_eq!(trainer.semantic_steps(), 0);
        // Batches 0 and 4 of every epoch apply the buffer.
        assert_eq!(trainer.backbone_steps(), 8);
        assert!(dir.path().join("model-4.mpk").exists());

        let log = fs::read_to_string(dir.path().join("events/scalars.jsonl")).unwrap();
        let train_steps: Vec<&str> = log.lines().filter(|l| l.contains("train/loss")).collect();
        assert_eq!(train_steps.len(), 5);
        assert!(log.contains("\"tag\":\"val/accuracy\",\"value\":0.5,\"step\":6"));
        assert!(dir
            .path()
            .join("events/images/train_semantic_0_0.png")
            .exists());
    }

    #[test]
    fn test_frozen_bias_is_not_updated() {
        let device = Default::default();
        let mut trainer = trainer(&device);
        let before = bias_values(&trainer);
        let mut source = SyntheticBatchSource::<TestBackend>::new(2, 9, 8, vec![1.0, 1.0], device);

        for i in 0..9 {
            let batch = source.next_batch().unwrap().unwrap();
            trainer.train_batch(i, TrainingStage::Backbone, &batch);
        }
        assert_eq!(bias_values(&trainer), before);
        assert_eq!(trainer.backbone_steps(), 3);
    }

    #[test]
    fn test_first_apply_leaves_weights_unchanged() {
        let device = Default::default();
        let mut trainer = trainer(&device);
        let mut source = SyntheticBatchSource::<TestBackend>::new(2, 1, 8, vec![1.0, 1.0], device);
        let batch = source.next_batch().unwrap().unwrap();

        let before = trainer.loss_on(&batch);
        trainer.train_batch(0, TrainingStage::Backbone, &batch);
        assert!((trainer.loss_on(&batch) - before).abs() < 1e-6);
        assert_eq!(trainer.backbone_steps(), 1);
    }

    #[test]
    fn test_semantic_stage_uses_semantic_group() {
        let device = Default::default();
        let mut trainer = trainer(&device);
        let mut source = SyntheticBatchSource::<TestBackend>::new(2, 1, 8, vec![1.0, 1.0], device);
        let batch = source.next_batch().unwrap().unwrap();
        trainer.train_batch(0, TrainingStage::Semantic, &batch);
        assert_eq!(trainer.semantic_steps(), 1);
        assert_eq!(trainer.backbone_steps(), 0);
    }

    /// Writes `<dir>/<name>` images and returns the manifest text.
    fn write_split(dir: &Path, samples: &[(&str, &str)]) -> String {
        fs::create_dir_all(dir).unwrap();
        let mut lines = String::new();
        for (name, label) in samples {
            let intensity = if *label == "positive" { 220 } else { 30 };
            RgbImage::from_pixel(12, 12, Rgb([intensity; 3]))
                .save(dir.join(name))
                .unwrap();
            lines.push_str(&format!("P {name} {label}\n"));
        }
        lines
    }

    #[test]
    fn test_finetune_run_logs_validation() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let train = write_split(
            &data_dir.join("train"),
            &[
                ("tr_0.png", "negative"),
                ("tr_1.png", "positive"),
                ("tr_2.png", "negative"),
                ("tr_3.png", "negative"),
                ("tr_4.png", "positive"),
                ("tr_5.png", "negative"),
            ],
        );
        let test = write_split(
            &data_dir.join("test"),
            &[("te_0.png", "negative"), ("te_1.png", "positive")],
        );
        let train_file = dir.path().join("train.txt");
        let test_file = dir.path().join("test.txt");
        fs::write(&train_file, train).unwrap();
        fs::write(&test_file, test).unwrap();

        let init = init_graph_config(&dir.path().join("weights"), 2);
        init_graph::<NdArray<f32>>(&init, &Default::default()).unwrap();

        let mut config = finetune_config();
        config.train_file = train_file;
        config.test_file = test_file.clone();
        config.logged_images = Some(test_file);
        config.data_dir = data_dir;
        config.output_dir = dir.path().join("output");
        config.checkpoint = init.checkpoint.clone();

        let report = run_finetune::<TestBackend>(&config, &Default::default()).unwrap();

        assert!(report.run_dir.starts_with(&config.output_dir));
        let run_name = report.run_dir.file_name().unwrap().to_str().unwrap();
        assert!(run_name.ends_with("test-lr0.0001"), "{run_name}");
        assert_eq!(report.semantic_steps, 0);
        // Three batches of two: only batch 0 applies.
        assert_eq!(report.backbone_steps, 1);
        assert_eq!(report.history.len(), 1);
        assert!(report.baseline.contains_key("sens_positive"));

        for file in ["model.mpk", "model.meta", "model-1.mpk", "run_config.json"] {
            assert!(report.run_dir.join(file).exists(), "missing {file}");
        }
        let log = fs::read_to_string(report.run_dir.join("events/scalars.jsonl")).unwrap();
        let val_steps: Vec<&str> = log
            .lines()
            .filter(|line| line.contains("\"tag\":\"val/accuracy\""))
            .collect();
        assert_eq!(val_steps.len(), 2);
        assert!(val_steps[0].contains("\"step\":0"));
        assert!(val_steps[1].contains("\"step\":3"));
        assert_eq!(log.lines().filter(|line| line.contains("train/loss")).count(), 3);
        assert!(report
            .run_dir
            .join("events/images/test_semantic_positive_0_0.png")
            .exists());
    }

    #[test]
    fn test_graph_with_other_class_count_is_rejected() {
        let dir = TempDir::new().unwrap();
        let init = init_graph_config(&dir.path().join("weights"), 3);
        init_graph::<NdArray<f32>>(&init, &Default::default()).unwrap();

        let mut config = finetune_config();
        config.output_dir = dir.path().join("output");
        config.checkpoint = init.checkpoint.clone();

        let err = run_finetune::<TestBackend>(&config, &Default::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TriageError>(),
            Some(TriageError::ClassCountMismatch { graph: 3, requested: 2 })
        ));
        assert!(!config.output_dir.exists());
    }
}
