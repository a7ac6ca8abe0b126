pub mod accumulator;
pub mod batch;
pub mod cross_val;
pub mod eval;
pub mod finetune;
pub mod loss;
pub mod phase;
pub mod stage;
pub mod variables;

pub use accumulator::GradientAccumulator;
pub use batch::TrainBatch;
pub use cross_val::{run_cross_validation, CrossValTrainer, EpochReport, FoldReport};
pub use eval::{ConfusionMatrix, Evaluator, ManifestEvaluator, Metrics};
pub use finetune::{run_finetune, FinetuneReport, FinetuneTrainer};
pub use loss::weighted_cross_entropy;
pub use phase::{Phase, PhaseTracker};
pub use stage::{StageSchedule, TrainingStage};
pub use variables::{exclude_variable, VariableGroups};
