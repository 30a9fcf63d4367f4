//! Task definition mutation
//!
//! Builds the registration payload of a new revision from the current one
//! plus caller overrides. Nothing here talks to the orchestrator.

use deckhand_common::{
    ContainerDefinition, KeyValuePair, SecretRef, TaskDefinition, TaskDefinitionSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Overrides for one container, addressed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container_name: String,

    /// `Some(0)` removes the container CPU reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    /// Applied as a soft reservation; the hard limit is always removed.
    /// `Some(0)` removes both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Merged into the existing environment by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<BTreeMap<String, String>>,

    /// Merged into the existing secrets by name (`name` -> `value_from`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<BTreeMap<String, String>>,
}

/// A requested task definition change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionUpdate {
    pub cluster: String,
    pub service: String,

    #[serde(default)]
    pub container_updates: Vec<ContainerUpdate>,

    /// Task-level CPU; an empty string removes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Task-level memory; an empty string removes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Registration payload for the revision that follows `current` with `update` applied
pub fn apply_update(current: &TaskDefinition, update: &TaskDefinitionUpdate) -> TaskDefinitionSpec {
    let mut spec = TaskDefinitionSpec::from_definition(current);

    if let Some(cpu) = &update.cpu {
        spec.cpu = non_empty(cpu);
    }
    if let Some(memory) = &update.memory {
        spec.memory = non_empty(memory);
    }

    for container_update in &update.container_updates {
        match spec
            .container_definitions
            .iter_mut()
            .find(|c| c.name == container_update.container_name)
        {
            Some(container) => apply_container_update(container, container_update),
            None => warn!(
                "Container {} not found in {}, ignoring its overrides",
                container_update.container_name, current.family
            ),
        }
    }

    spec
}

fn apply_container_update(container: &mut ContainerDefinition, update: &ContainerUpdate) {
    if let Some(cpu) = update.cpu {
        container.cpu = (cpu > 0).then_some(cpu);
    }

    if let Some(memory) = update.memory {
        container.memory_reservation = (memory > 0).then_some(memory);
        container.memory = None;
    }

    if let Some(image) = &update.image {
        container.image = image.clone();
    }

    if let Some(variables) = update.environment_variables.as_ref().filter(|v| !v.is_empty()) {
        let pairs = container
            .environment
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()));
        container.environment = merge_by_name(pairs, variables)
            .into_iter()
            .map(|(name, value)| KeyValuePair { name, value })
            .collect();
    }

    if let Some(secrets) = update.secrets.as_ref().filter(|s| !s.is_empty()) {
        let pairs = container
            .secrets
            .iter()
            .map(|s| (s.name.clone(), s.value_from.clone()));
        container.secrets = merge_by_name(pairs, secrets)
            .into_iter()
            .map(|(name, value_from)| SecretRef { name, value_from })
            .collect();
    }
}

/// Existing entries keep their position; overrides replace by name, new names append
fn merge_by_name(
    existing: impl Iterator<Item = (String, String)>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for (name, value) in existing {
        let value = overrides.get(&name).cloned().unwrap_or(value);
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => merged.push((name, value)),
        }
    }

    for (name, value) in overrides {
        if !merged.iter().any(|(n, _)| n == name) {
            merged.push((name.clone(), value.clone()));
        }
    }
    merged
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
