use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cxr_triage::backend::{self, InnerBackend, TrainBackend};
use cxr_triage::checkpoint::init_graph;
use cxr_triage::{run_cross_validation, run_finetune, CrossValConfig, FinetuneConfig, InitGraphConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Chest X-ray triage training CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stratified k-fold fine-tuning of a pretrained model
    CrossVal(CrossValConfig),
    /// Staged fine-tuning with gradient accumulation
    Finetune(FinetuneConfig),
    /// Write a fresh graph manifest and initial weights
    InitGraph(InitGraphConfig),
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CrossVal(config) => {
            info!("Configuration: {}", config);
            let device = backend::device(config.device_index);
            info!("Backend: {}", backend::backend_name());
            let reports = run_cross_validation::<TrainBackend>(&config, &device)?;
            for report in &reports {
                let last = report.history.last().map(|epoch| &epoch.metrics);
                info!(
                    "Fold {} ({:?}): baseline {:?}, final {:?}",
                    report.fold, report.run_dir, report.baseline, last
                );
            }
            Ok(())
        }
        Commands::Finetune(config) => {
            info!("Configuration: {}", config);
            let device = backend::device(config.device_index);
            info!("Backend: {}", backend::backend_name());
            let report = run_finetune::<TrainBackend>(&config, &device)?;
            info!(
                "Finished {:?}: {} backbone updates, {} semantic updates",
                report.run_dir, report.backbone_steps, report.semantic_steps
            );
            Ok(())
        }
        Commands::InitGraph(config) => {
            let path = init_graph::<InnerBackend>(&config, &backend::device(0))?;
            info!("Initial weights saved to {:?}", path);
            Ok(())
        }
    }
}
