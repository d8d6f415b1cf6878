/// Data for the /v1/models endpoint.
/// This endpoint mimics the openai API's models endpoint. Each 'model' is a registry entry; listing
/// never starts or probes a backend.
use serde::{Deserialize, Serialize};

use crate::registry::ModelRegistry;

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub id: String,
    /// The object type, which is always "model".
    pub object: String,
    /// The organization that owns the model.
    pub owned_by: String,
}

impl Model {
    pub(crate) fn from_id(id: &str) -> Self {
        Model {
            id: id.to_owned(),
            object: "model".into(),
            owned_by: "system".into(),
        }
    }
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        let data = registry
            .list_models()
            .iter()
            .map(|id| Model::from_id(id))
            .collect::<Vec<_>>();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}
