/// The model registry maps client-facing model ids to the backend unit serving them.
///
/// It is built once from the config file and never mutated afterwards; changing the set of
/// models requires a restart.
use crate::errors::SwitchError;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// A single model id and the unit that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct ModelEntry {
    /// The id clients put in the `model` field.
    pub model_id: String,
    /// The supervisor unit name, e.g. `qwen3-coder.service`.
    pub unit_name: String,
    /// Where the unit listens once it is running.
    pub base_url: Url,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("model '{0}' is configured more than once")]
    DuplicateModel(String),

    #[error("unit '{unit}' is configured with two different urls: {first} and {second}")]
    ConflictingUnitUrl {
        unit: String,
        first: Url,
        second: Url,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// Build a registry, rejecting duplicate ids and units reachable at two addresses.
    pub fn new(entries: impl IntoIterator<Item = ModelEntry>) -> Result<Self, RegistryError> {
        let mut by_model: HashMap<String, ModelEntry> = HashMap::new();
        let mut unit_urls: HashMap<String, Url> = HashMap::new();

        for mut entry in entries {
            as_directory(&mut entry.base_url);
            if let Some(known) = unit_urls.get(&entry.unit_name)
                && known != &entry.base_url
            {
                return Err(RegistryError::ConflictingUnitUrl {
                    unit: entry.unit_name.clone(),
                    first: known.clone(),
                    second: entry.base_url.clone(),
                });
            }
            unit_urls.insert(entry.unit_name.clone(), entry.base_url.clone());

            if by_model.contains_key(&entry.model_id) {
                return Err(RegistryError::DuplicateModel(entry.model_id));
            }
            by_model.insert(entry.model_id.clone(), entry);
        }

        Ok(Self { entries: by_model })
    }

    pub fn resolve(&self, model_id: &str) -> Result<&ModelEntry, SwitchError> {
        self.entries
            .get(model_id)
            .ok_or_else(|| SwitchError::UnknownModel(model_id.to_string()))
    }

    /// All model ids, sorted.
    pub fn list_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Distinct unit names, sorted. Several model ids may share a unit.
    pub fn unit_names(&self) -> Vec<String> {
        let mut units: Vec<String> = self.entries.values().map(|e| e.unit_name.clone()).collect();
        units.sort();
        units.dedup();
        units
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Backend paths are joined onto the base url, so a path prefix must end in `/` to survive
/// `Url::join`.
fn as_directory(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}
