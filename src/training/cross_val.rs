use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::path::PathBuf;
use tracing::info;

use super::batch::TrainBatch;
use super::eval::{Evaluator, ManifestEvaluator, Metrics};
use super::loss::weighted_cross_entropy;
use super::phase::{Phase, PhaseTracker};
use crate::checkpoint::{restore_weights, save_run_config, warn_existing_checkpoints, Checkpointer};
use crate::config::CrossValConfig;
use crate::data::folds::FoldPartitioner;
use crate::data::image::Preprocess;
use crate::data::loader::{BalanceOptions, BalancedBatchSource, BatchSource};
use crate::data::manifest::{read_manifest, LabeledRecord};
use crate::model::{GraphBindings, GraphManifest, TriageNet};
use crate::utils::epoch_bar;

/// Single Adam optimizer over every parameter, one step per batch.
pub struct CrossValTrainer<B: AutodiffBackend> {
    model: TriageNet<B>,
    optimizer: OptimizerAdaptor<Adam, TriageNet<B>, B>,
    learning_rate: f64,
    steps: usize,
}

impl<B: AutodiffBackend> CrossValTrainer<B> {
    pub fn new(model: TriageNet<B>, learning_rate: f64) -> Self {
        let optimizer = AdamConfig::new().init::<B, TriageNet<B>>();
        Self {
            model,
            optimizer,
            learning_rate,
            steps: 0,
        }
    }

    /// Forward, weighted loss, backward and one optimizer update.
    pub fn train_step(&mut self, batch: &TrainBatch<B>) -> f32 {
        let output = self.model.forward(batch.images.clone());
        let loss = weighted_cross_entropy(
            output.logits,
            batch.labels.clone(),
            Some(batch.weights.clone()),
        );
        let value = loss.clone().into_scalar().elem::<f32>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);
        self.steps += 1;
        value
    }

    /// Loss of the current weights on `batch`, without tracking gradients.
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

    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: Option<f32>,
    pub metrics: Metrics,
}

#[derive(Debug, Clone)]
pub struct FoldReport {
    pub fold: usize,
    pub run_dir: PathBuf,
    pub baseline: Metrics,
    pub history: Vec<EpochReport>,
}

/// Everything a fold's epoch loop needs besides the trainer and its data.
pub struct FoldContext<'a> {
    pub checkpointer: &'a Checkpointer,
    pub manifest: &'a GraphManifest,
    pub meta_name: &'a str,
    pub test_records: &'a [LabeledRecord],
    pub epochs: usize,
    pub display_step: usize,
}

/// Baseline checkpoint and eval, then `epochs` passes over `source` with a
/// periodic eval and weights-only checkpoint every `display_step` epochs.
pub fn train_fold<B, S, E>(
    trainer: &mut CrossValTrainer<B>,
    source: &mut S,
    evaluator: &mut E,
    ctx: &FoldContext<'_>,
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
    let baseline = evaluator.evaluate(&trainer.model().valid(), ctx.test_records)?;

    info!("Training started");
    let total_batch = source.num_batches();
    let mut history = Vec::new();

    for epoch in 0..ctx.epochs {
        tracker.advance(Phase::TrainingEpoch)?;
        source.reset();

        let pb = epoch_bar(epoch, ctx.epochs, total_batch);
        let mut last_batch = None;
        for _ in 0..total_batch {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            trainer.train_step(&batch);
            pb.inc(1);
            last_batch = Some(batch);
        }
        pb.finish_and_clear();

        if epoch % ctx.display_step == 0 {
            tracker.advance(Phase::PeriodicEval)?;
            let loss = last_batch.as_ref().map(|batch| trainer.loss_on(batch));
            if let Some(loss) = loss {
                info!("Epoch: {:04} Minibatch loss={:.9}", epoch + 1, loss);
            }
            let metrics = evaluator.evaluate(&trainer.model().valid(), ctx.test_records)?;

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

/// Stratified k-fold fine-tuning of a pretrained model on one manifest.
pub fn run_cross_validation<B: AutodiffBackend>(
    config: &CrossValConfig,
    device: &B::Device,
) -> Result<Vec<FoldReport>> {
    let mapping = config.validate()?;
    let class_weights = config.class_weights(&mapping);
    info!("Class weights: {:?}", class_weights);

    let records = read_manifest(&config.manifest)?;
    let plan = FoldPartitioner::new(config.folds, config.majority_label.as_str())
        .with_seed(config.seed)
        .partition(&records)?;

    let manifest = GraphManifest::load(&config.checkpoint.weights_dir, &config.checkpoint.meta_name)?;
    let bindings = GraphBindings::bind(&manifest, &config.tensors, None)?;
    info!(
        "Feeding {} and {}, training on {}",
        bindings.input.name, bindings.label.name, bindings.logits.name
    );
    manifest.ensure_classes(mapping.n_classes())?;

    let preprocess = Preprocess::new(config.input_size, config.top_percent);
    let mut reports = Vec::with_capacity(plan.len());

    for fold in &plan.folds {
        info!("Training fold number: {}", fold.index);
        info!(
            "Positive train files: {}, test files: {}",
            fold.train_minority.len(),
            fold.test_minority.len()
        );

        let run_dir = config
            .output_dir
            .join(format!("{}-file_num{}", config.name, fold.index));
        save_run_config(&run_dir, config)?;
        warn_existing_checkpoints(&run_dir, "model")?;
        info!("Output: {:?}", run_dir);

        let mut source = BalancedBatchSource::<B>::new(
            &fold.train_minority,
            &fold.train_majority,
            &config.data_dir,
            &mapping,
            BalanceOptions {
                batch_size: config.batch_size,
                covid_percent: config.covid_percent,
                class_weights: class_weights.clone(),
                preprocess,
                seed: config.seed,
            },
            device.clone(),
        )
        .with_context(|| format!("Failed to build batch source for fold {}", fold.index))?;

        let mut evaluator = ManifestEvaluator::<B::InnerBackend>::new(
            config.data_dir.clone(),
            preprocess,
            mapping.clone(),
            config.batch_size,
            device.clone(),
        );

        let model = TriageNet::<B>::new(&manifest.model, device)?;
        let model = restore_weights(
            model,
            &config.checkpoint.weights_dir,
            &config.checkpoint.ckpt_name,
            device,
        )?;
        let mut trainer = CrossValTrainer::new(model, config.learning_rate);

        let checkpointer = Checkpointer::new(&run_dir, "model");
        let test_records = fold.test_records();
        let ctx = FoldContext {
            checkpointer: &checkpointer,
            manifest: &manifest,
            meta_name: &config.checkpoint.meta_name,
            test_records: &test_records,
            epochs: config.epochs,
            display_step: config.display_step,
        };
        let (baseline, history) = train_fold(&mut trainer, &mut source, &mut evaluator, &ctx)?;

        reports.push(FoldReport {
            fold: fold.index,
            run_dir,
            baseline,
            history,
        });
    }

    info!("Optimization Finished!");
    Ok(reports)
}
