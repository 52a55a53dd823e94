//! Resolved type model: config validated and flattened for runtime use.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Property value converter applied while shaping response bodies.
pub type Converter = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Primitive type name of binary stream properties.
pub const STREAM_TYPE: &str = "Edm.Stream";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Entity,
    Complex,
}

/// Relationship to another entity type.
#[derive(Clone, Debug)]
pub struct NavigationInfo {
    pub target: String,
    pub collection: bool,
    pub foreign_keys: Vec<String>,
}

#[derive(Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub type_name: String,
    pub collection: bool,
    pub computed: bool,
    pub content_type: Option<String>,
    pub converter: Option<Converter>,
    pub navigation: Option<NavigationInfo>,
}

impl PropertyInfo {
    pub fn is_stream(&self) -> bool {
        self.type_name == STREAM_TYPE
    }

    pub fn is_primitive(&self) -> bool {
        self.type_name.starts_with("Edm.")
    }
}

impl fmt::Debug for PropertyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyInfo")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("collection", &self.collection)
            .field("computed", &self.computed)
            .field("content_type", &self.content_type)
            .field("converter", &self.converter.is_some())
            .field("navigation", &self.navigation)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct TypeInfo {
    pub name: String,
    pub namespace: String,
    pub kind: TypeKind,
    pub base_type: Option<String>,
    pub open: bool,
    pub media: bool,
    pub media_content_type: Option<String>,
    /// Keys across the base-type chain, base keys first.
    pub keys: Vec<String>,
    /// Properties across the base-type chain, base properties first.
    pub properties: Vec<PropertyInfo>,
}

impl TypeInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn is_entity(&self) -> bool {
        self.kind == TypeKind::Entity
    }
}

#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    pub namespace: String,
    pub types: HashMap<String, TypeInfo>,
    /// Entity set name -> entity type name, in declaration order.
    pub entity_sets: Vec<(String, String)>,
}

impl TypeRegistry {
    /// Look a type up by bare name, qualified name, or `#`-prefixed type tag.
    pub fn get(&self, name: &str) -> Option<&TypeInfo> {
        let name = name.trim_start_matches('#');
        if let Some(t) = self.types.get(name) {
            return Some(t);
        }
        let (ns, bare) = name.rsplit_once('.')?;
        self.types.get(bare).filter(|t| t.namespace == ns)
    }

    /// Entity type of the named entity set.
    pub fn entity_set_type(&self, set: &str) -> Option<&str> {
        self.entity_sets
            .iter()
            .find(|(name, _)| name == set)
            .map(|(_, t)| t.as_str())
    }

    /// First entity set whose element type is `type_name`.
    pub fn key_properties(&self, name: &str) -> &[String] {
        self.get(name).map(|t| t.keys.as_slice()).unwrap_or(&[])
    }

    pub fn property(&self, type_name: &str, property: &str) -> Option<&PropertyInfo> {
        self.get(type_name).and_then(|t| t.property(property))
    }

    /// Declared type name of a property, if the property exists.
    pub fn property_type(&self, type_name: &str, property: &str) -> Option<&str> {
        self.property(type_name, property).map(|p| p.type_name.as_str())
    }

    pub fn foreign_keys(&self, type_name: &str, property: &str) -> &[String] {
        self.property(type_name, property)
            .and_then(|p| p.navigation.as_ref())
            .map(|n| n.foreign_keys.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_collection(&self, type_name: &str, property: &str) -> bool {
        self.property(type_name, property)
            .map(|p| p.collection || p.navigation.as_ref().map(|n| n.collection).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Target type of a navigation or structured property.
    pub fn related_type(&self, type_name: &str, property: &str) -> Option<&str> {
        let prop = self.property(type_name, property)?;
        if let Some(nav) = &prop.navigation {
            return Some(nav.target.as_str());
        }
        if prop.is_primitive() {
            None
        } else {
            Some(prop.type_name.as_str())
        }
    }

    /// Qualified name used in `@odata.type`.
    pub fn qualified_name(&self, name: &str) -> String {
        self.get(name)
            .map(TypeInfo::qualified_name)
            .unwrap_or_else(|| format!("{}.{}", self.namespace, name))
    }
}
