//! Load the model document from disk or memory and resolve it into a `TypeRegistry`.

use crate::config::resolved::{Converter, NavigationInfo, PropertyInfo, TypeInfo, TypeKind, TypeRegistry};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Named converters referenced by `PropertyConfig::converter`.
#[derive(Clone, Default)]
pub struct ConverterTable {
    by_name: HashMap<String, Converter>,
}

impl ConverterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.by_name.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<Converter> {
        self.by_name.get(name).cloned()
    }
}

/// Build the type registry from a model document (validates first).
pub fn resolve(config: &ModelConfig, converters: &ConverterTable) -> Result<TypeRegistry, ConfigError> {
    validate(config)?;

    let declared: HashMap<&str, (&TypeConfig, TypeKind)> = config
        .entity_types
        .iter()
        .map(|t| (t.name.as_str(), (t, TypeKind::Entity)))
        .chain(config.complex_types.iter().map(|t| (t.name.as_str(), (t, TypeKind::Complex))))
        .collect();

    let mut types = HashMap::new();
    for (name, (t, kind)) in &declared {
        // Walk to the root so base keys and properties come first.
        let mut chain = vec![*t];
        let mut current = t.base_type.as_deref();
        while let Some(base) = current {
            let bt = declared[base].0;
            chain.push(bt);
            current = bt.base_type.as_deref();
        }
        chain.reverse();

        let mut keys = Vec::new();
        let mut properties = Vec::new();
        for level in &chain {
            keys.extend(level.keys.iter().cloned());
            for p in &level.properties {
                properties.push(resolve_property(level, p, converters)?);
            }
        }

        let info = TypeInfo {
            name: t.name.clone(),
            namespace: t.namespace.clone().unwrap_or_else(|| config.namespace.clone()),
            kind: kind.clone(),
            base_type: t.base_type.clone(),
            open: t.open,
            media: t.media || t.media_content_type.is_some(),
            media_content_type: t.media_content_type.clone(),
            keys,
            properties,
        };
        types.insert(name.to_string(), info);
    }

    Ok(TypeRegistry {
        namespace: config.namespace.clone(),
        types,
        entity_sets: config
            .entity_sets
            .iter()
            .map(|s| (s.name.clone(), s.entity_type.clone()))
            .collect(),
    })
}

fn resolve_property(
    owner: &TypeConfig,
    p: &PropertyConfig,
    converters: &ConverterTable,
) -> Result<PropertyInfo, ConfigError> {
    let converter = match &p.converter {
        Some(name) => Some(converters.get(name).ok_or_else(|| ConfigError::UnknownConverter {
            type_name: owner.name.clone(),
            property: p.name.clone(),
            converter: name.clone(),
        })?),
        None => None,
    };
    let navigation = p.navigation.as_ref().map(|n| NavigationInfo {
        target: n.target.clone(),
        collection: n.collection,
        foreign_keys: n.foreign_keys.clone(),
    });
    let type_name = navigation
        .as_ref()
        .map(|n| n.target.clone())
        .unwrap_or_else(|| p.type_.clone());
    Ok(PropertyInfo {
        name: p.name.clone(),
        type_name,
        collection: p.collection,
        computed: p.computed,
        content_type: p.content_type.clone(),
        converter,
        navigation,
    })
}

/// Read and resolve a JSON model document.
pub async fn load_from_path(path: impl AsRef<Path>, converters: &ConverterTable) -> Result<TypeRegistry, ConfigError> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "loading model");
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    let config: ModelConfig = serde_json::from_str(&raw).map_err(|e| ConfigError::Load(e.to_string()))?;
    resolve(&config, converters)
}
