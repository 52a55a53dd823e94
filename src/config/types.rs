//! Raw model types matching the JSON model document.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationConfig {
    /// Target type name (entity type).
    pub target: String,
    #[serde(default)]
    pub collection: bool,
    /// Foreign-key property names linking the two types.
    #[serde(default)]
    pub foreign_keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    /// `Edm.*` primitive name, `Edm.Stream`, or a declared complex/entity type name.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub collection: bool,
    #[serde(default)]
    pub computed: bool,
    /// Content type for `Edm.Stream` properties.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Name of a converter registered in the `ConverterTable`.
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub navigation: Option<NavigationConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeConfig {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub open: bool,
    /// Set for media entities: content type of the entity's binary payload.
    #[serde(default)]
    pub media_content_type: Option<String>,
    #[serde(default)]
    pub media: bool,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntitySetConfig {
    pub name: String,
    pub entity_type: String,
}

/// Whole model document for in-memory loading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub namespace: String,
    #[serde(default)]
    pub entity_types: Vec<TypeConfig>,
    #[serde(default)]
    pub complex_types: Vec<TypeConfig>,
    #[serde(default)]
    pub entity_sets: Vec<EntitySetConfig>,
}
