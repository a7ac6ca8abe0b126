// Library exports for the training binary and integration code

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used types
pub use config::{ClassMapping, CrossValConfig, FinetuneConfig, InitGraphConfig};
pub use error::{Result, TriageError};
pub use model::{TriageNet, TriageNetConfig};
pub use training::{run_cross_validation, run_finetune, TrainBatch};
