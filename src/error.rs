use std::path::PathBuf;
use thiserror::Error;

use crate::model::EndpointRole;
use crate::training::Phase;

pub type Result<T> = std::result::Result<T, TriageError>;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error(
        "only 2 class COVID-19 positive/negative detection or 3 class \
         normal/pneumonia/COVID-19 detection is supported, got {0} classes"
    )]
    UnsupportedClassCount(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tensor `{name}` does not exist in the restored graph (available: {available:?})")]
    MissingTensor { name: String, available: Vec<String> },

    #[error("tensor `{name}` is a {found:?} endpoint, expected {expected:?}")]
    EndpointRole {
        name: String,
        expected: EndpointRole,
        found: EndpointRole,
    },

    #[error("cannot split {available} {what} records into {folds} folds")]
    TooFewSamples {
        what: &'static str,
        available: usize,
        folds: usize,
    },

    #[error("illegal phase transition {from:?} -> {to:?}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("label `{0}` is not part of the class mapping")]
    UnknownLabel(String),

    #[error("record has no file name: {0:?}")]
    MissingFileName(String),

    #[error("failed to load image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("graph has {graph} outputs but {requested} classes were requested")]
    ClassCountMismatch { graph: usize, requested: usize },
}
