//! Model validation: referential integrity of types, keys and entity sets.

use crate::config::{ModelConfig, TypeConfig};
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

pub fn validate(config: &ModelConfig) -> Result<(), ConfigError> {
    let all_types: Vec<&TypeConfig> = config
        .entity_types
        .iter()
        .chain(config.complex_types.iter())
        .collect();
    let by_name: HashMap<&str, &TypeConfig> = all_types.iter().map(|t| (t.name.as_str(), *t)).collect();
    let entity_names: HashSet<&str> = config.entity_types.iter().map(|t| t.name.as_str()).collect();

    for t in &all_types {
        if let Some(base) = &t.base_type {
            if !by_name.contains_key(base.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "base type",
                    id: base.clone(),
                });
            }
        }
        check_base_chain(t, &by_name)?;

        for p in &t.properties {
            if let Some(nav) = &p.navigation {
                if !entity_names.contains(nav.target.as_str()) {
                    return Err(ConfigError::MissingReference {
                        kind: "navigation target",
                        id: nav.target.clone(),
                    });
                }
            } else if !p.type_.starts_with("Edm.") && !by_name.contains_key(p.type_.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "property type",
                    id: p.type_.clone(),
                });
            }
        }
    }

    for t in &config.entity_types {
        let declared = declared_properties(t, &by_name);
        for key in &t.keys {
            if !declared.contains(key.as_str()) {
                return Err(ConfigError::InvalidKey {
                    type_name: t.name.clone(),
                    property: key.clone(),
                });
            }
        }
    }

    let mut set_names = HashSet::new();
    for set in &config.entity_sets {
        if !entity_names.contains(set.entity_type.as_str()) {
            return Err(ConfigError::MissingReference {
                kind: "entity type",
                id: set.entity_type.clone(),
            });
        }
        if !set_names.insert(set.name.as_str()) {
            return Err(ConfigError::DuplicateEntitySet(set.name.clone()));
        }
    }

    Ok(())
}

fn check_base_chain<'a>(t: &'a TypeConfig, by_name: &HashMap<&str, &'a TypeConfig>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    let mut current = Some(t);
    while let Some(c) = current {
        if !seen.insert(c.name.as_str()) {
            return Err(ConfigError::BaseTypeCycle(t.name.clone()));
        }
        current = c.base_type.as_deref().and_then(|b| by_name.get(b).copied());
    }
    Ok(())
}

fn declared_properties<'a>(t: &'a TypeConfig, by_name: &HashMap<&str, &'a TypeConfig>) -> HashSet<&'a str> {
    let mut out = HashSet::new();
    let mut current = Some(t);
    while let Some(c) = current {
        out.extend(c.properties.iter().map(|p| p.name.as_str()));
        current = c.base_type.as_deref().and_then(|b| by_name.get(b).copied());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntitySetConfig, PropertyConfig};

    fn prop(name: &str, ty: &str) -> PropertyConfig {
        PropertyConfig {
            name: name.into(),
            type_: ty.into(),
            collection: false,
            computed: false,
            content_type: None,
            converter: None,
            navigation: None,
        }
    }

    fn entity(name: &str, base: Option<&str>, keys: &[&str]) -> TypeConfig {
        TypeConfig {
            name: name.into(),
            namespace: None,
            base_type: base.map(String::from),
            open: false,
            media_content_type: None,
            media: false,
            keys: keys.iter().map(|k| k.to_string()).collect(),
            properties: vec![prop("Id", "Edm.Int32")],
        }
    }

    #[test]
    fn rejects_key_that_is_not_a_property() {
        let config = ModelConfig {
            namespace: "Test".into(),
            entity_types: vec![entity("Product", None, &["Code"])],
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(ConfigError::InvalidKey { .. })));
    }

    #[test]
    fn rejects_base_type_cycle() {
        let config = ModelConfig {
            namespace: "Test".into(),
            entity_types: vec![entity("A", Some("B"), &[]), entity("B", Some("A"), &[])],
            ..Default::default()
        };
        assert!(matches!(validate(&config), Err(ConfigError::BaseTypeCycle(_))));
    }

    #[test]
    fn rejects_duplicate_entity_set() {
        let set = EntitySetConfig {
            name: "Products".into(),
            entity_type: "Product".into(),
        };
        let config = ModelConfig {
            namespace: "Test".into(),
            entity_types: vec![entity("Product", None, &["Id"])],
            entity_sets: vec![set.clone(), set],
            ..Default::default()
        };
        assert_eq!(
            validate(&config),
            Err(ConfigError::DuplicateEntitySet("Products".into()))
        );
    }
}
