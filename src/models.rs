use serde::Serialize;
use serde_json::{Value, json};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Personas offered by the AnuNeko backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendModel {
    #[serde(rename = "Orange Cat")]
    OrangeCat,
    #[serde(rename = "Exotic Shorthair")]
    ExoticShorthair,
}

impl BackendModel {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendModel::OrangeCat => "Orange Cat",
            BackendModel::ExoticShorthair => "Exotic Shorthair",
        }
    }
}

impl Default for BackendModel {
    fn default() -> Self {
        BackendModel::OrangeCat
    }
}

impl std::fmt::Display for BackendModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct CatalogEntry {
    id: &'static str,
    owned_by: &'static str,
    backend: BackendModel,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "gpt-3.5-turbo",
        owned_by: "anuneko-orange-cat",
        backend: BackendModel::OrangeCat,
    },
    CatalogEntry {
        id: "gpt-4",
        owned_by: "anuneko-exotic-shorthair",
        backend: BackendModel::ExoticShorthair,
    },
];

/// Maps a caller-facing model name to a backend persona. Unknown names fall back to the default.
pub fn map_model(model: &str) -> BackendModel {
    CATALOG
        .iter()
        .find(|entry| entry.id == model)
        .map(|entry| entry.backend)
        .unwrap_or_default()
}

pub fn model_list(created: i64) -> Value {
    let data: Vec<Value> = CATALOG
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "object": "model",
                "created": created,
                "owned_by": entry.owned_by
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}
