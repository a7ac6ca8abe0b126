//! Graph manifest ("metagraph") persistence and endpoint binding.
//!
//! The manifest records the architecture of a persisted model together with
//! the names under which its endpoints are exported. Drivers bind the names
//! they were configured with once, right after restore, and fail with the
//! list of available names when one is missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::triage_net::TriageNetConfig;
use crate::config::TensorNames;
use crate::error::TriageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    ImageInput,
    Label,
    SampleWeight,
    Logits,
    Prediction,
    SemanticOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub model: TriageNetConfig,
    pub endpoints: BTreeMap<String, EndpointRole>,
}

impl GraphManifest {
    pub fn new(model: TriageNetConfig, names: &TensorNames, semantic_output: Option<&str>) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(names.input.clone(), EndpointRole::ImageInput);
        endpoints.insert(names.label.clone(), EndpointRole::Label);
        endpoints.insert(names.sample_weight.clone(), EndpointRole::SampleWeight);
        endpoints.insert(names.logits.clone(), EndpointRole::Logits);
        endpoints.insert(names.prediction.clone(), EndpointRole::Prediction);
        if model.semantic {
            if let Some(name) = semantic_output {
                endpoints.insert(name.to_string(), EndpointRole::SemanticOutput);
            }
        }
        Self { model, endpoints }
    }

    pub fn load(dir: &Path, meta_name: &str) -> Result<Self> {
        let path = dir.join(meta_name);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read graph manifest: {:?}", path))?;
        let manifest: GraphManifest = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse graph manifest: {:?}", path))?;
        manifest.model.validate()?;
        info!(
            "Restored graph from {:?} ({} endpoints, {} classes)",
            path,
            manifest.endpoints.len(),
            manifest.model.n_classes
        );
        Ok(manifest)
    }

    pub fn save(&self, dir: &Path, meta_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        let path = dir.join(meta_name);
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize graph manifest")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write graph manifest: {:?}", path))?;
        debug!("Graph manifest written to {:?}", path);
        Ok(path)
    }

    /// The restored output layer must match the configured class mapping.
    pub fn ensure_classes(&self, requested: usize) -> Result<(), TriageError> {
        if self.model.n_classes != requested {
            return Err(TriageError::ClassCountMismatch {
                graph: self.model.n_classes,
                requested,
            });
        }
        Ok(())
    }

    pub fn role(&self, name: &str) -> Option<EndpointRole> {
        self.endpoints.get(name).copied()
    }
}

/// A resolved endpoint of the restored graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub role: EndpointRole,
}

/// Typed handles for every endpoint a driver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphBindings {
    pub input: Endpoint,
    pub label: Endpoint,
    pub sample_weight: Endpoint,
    pub logits: Endpoint,
    pub prediction: Endpoint,
    pub semantic_output: Option<Endpoint>,
}

impl GraphBindings {
    pub fn bind(
        manifest: &GraphManifest,
        names: &TensorNames,
        semantic_output: Option<&str>,
    ) -> Result<Self, TriageError> {
        let resolve = |name: &str, expected: EndpointRole| -> Result<Endpoint, TriageError> {
            match manifest.role(name) {
                Some(found) if found == expected => Ok(Endpoint {
                    name: name.to_string(),
                    role: found,
                }),
                Some(found) => Err(TriageError::EndpointRole {
                    name: name.to_string(),
                    expected,
                    found,
                }),
                None => Err(TriageError::MissingTensor {
                    name: name.to_string(),
                    available: manifest.endpoints.keys().cloned().collect(),
                }),
            }
        };

        let bindings = Self {
            input: resolve(&names.input, EndpointRole::ImageInput)?,
            label: resolve(&names.label, EndpointRole::Label)?,
            sample_weight: resolve(&names.sample_weight, EndpointRole::SampleWeight)?,
            logits: resolve(&names.logits, EndpointRole::Logits)?,
            prediction: resolve(&names.prediction, EndpointRole::Prediction)?,
            semantic_output: semantic_output
                .map(|name| resolve(name, EndpointRole::SemanticOutput))
                .transpose()?,
        };
        debug!("Bound graph endpoints: {:?}", bindings);
        Ok(bindings)
    }
}
