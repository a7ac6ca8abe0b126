pub mod folds;
pub mod image;
pub mod loader;
pub mod manifest;

pub use folds::{FoldPartitioner, FoldPlan, FoldSplit, KFold};
pub use self::image::Preprocess;
pub use loader::{BalancedBatchSource, BatchSource, ShuffledBatchSource, SyntheticBatchSource};
pub use manifest::{read_manifest, LabeledRecord};
