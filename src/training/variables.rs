use regex::Regex;
use tracing::info;

use crate::model::ParamSlot;

/// Remove the variable called `name` from `slots`; absent names are a no-op.
pub fn exclude_variable(slots: &mut Vec<ParamSlot>, name: &str) -> Option<ParamSlot> {
    let index = slots.iter().position(|slot| slot.name == name)?;
    Some(slots.remove(index))
}

/// Two disjoint parameter groups: the backbone and the semantic sub-network.
#[derive(Debug, Clone, Default)]
pub struct VariableGroups {
    pub backbone: Vec<ParamSlot>,
    pub semantic: Vec<ParamSlot>,
}

impl VariableGroups {
    /// Names matching `semantic_pattern` go to the semantic group, the rest
    /// to the backbone.
    pub fn partition(slots: Vec<ParamSlot>, semantic_pattern: &Regex) -> Self {
        let (semantic, backbone): (Vec<_>, Vec<_>) = slots
            .into_iter()
            .partition(|slot| semantic_pattern.is_match(&slot.name));
        info!(
            "Train vars backbone: {}, semantic: {}",
            backbone.len(),
            semantic.len()
        );
        Self { backbone, semantic }
    }

    /// Keep `name` out of every gradient update.
    pub fn freeze(&mut self, name: &str) -> Option<ParamSlot> {
        let removed = exclude_variable(&mut self.backbone, name)
            .or_else(|| exclude_variable(&mut self.semantic, name));
        match &removed {
            Some(_) => info!("Frozen variable: {}", name),
            None => info!("Variable {} not found, nothing frozen", name),
        }
        removed
    }
}
