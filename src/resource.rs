//! Parsed resource-path descriptor handed to the pipeline by the URL parser.

use crate::error::ODataError;
use axum::extract::Query;
use axum::http::Uri;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Kind of a resource-path segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    EntitySet,
    EntityCollectionNavigation,
    EntityNavigation,
    PrimitiveProperty,
    PrimitiveCollectionProperty,
    ComplexProperty,
    ComplexCollectionProperty,
    FunctionImport,
    ActionImport,
    BoundFunction,
    BoundAction,
    /// `$count`
    Count,
    /// `$value`
    Value,
    /// `$ref`
    Ref,
}

/// One name/value pair of a key predicate. `raw` is the literal as written in the URL.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    pub name: String,
    pub value: Value,
    pub raw: String,
}

impl KeyValue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let raw = match &value {
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            other => other.to_string(),
        };
        KeyValue {
            name: name.into(),
            value,
            raw,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Part {
    pub kind: PartKind,
    pub name: String,
    /// Empty when the segment carries no key predicate.
    pub key: Vec<KeyValue>,
    /// Raw call parameters of function/action segments.
    pub params: Map<String, Value>,
}

impl Part {
    pub fn new(kind: PartKind, name: impl Into<String>) -> Self {
        Part {
            kind,
            name: name.into(),
            key: Vec::new(),
            params: Map::new(),
        }
    }

    pub fn entity_set(name: impl Into<String>) -> Self {
        Part::new(PartKind::EntitySet, name)
    }

    pub fn with_key(mut self, name: impl Into<String>, value: Value) -> Self {
        self.key.push(KeyValue::new(name, value));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Key values as a parameter map.
    pub fn key_params(&self) -> Map<String, Value> {
        self.key.iter().map(|k| (k.name.clone(), k.value.clone())).collect()
    }
}

/// Expansion request for a navigation property, with its own options and nested expansions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Include {
    pub navigation_property: String,
    pub query: QueryOptions,
    pub includes: Includes,
}

impl Include {
    pub fn new(navigation_property: impl Into<String>) -> Self {
        Include {
            navigation_property: navigation_property.into(),
            ..Default::default()
        }
    }
}

pub type Includes = HashMap<String, Include>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePath {
    pub parts: Vec<Part>,
    pub includes: Includes,
    pub query: QueryOptions,
    /// `$id` option, used by `$ref` requests.
    pub id: Option<String>,
}

impl ResourcePath {
    pub fn new(parts: Vec<Part>) -> Self {
        ResourcePath {
            parts,
            ..Default::default()
        }
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.includes.insert(include.navigation_property.clone(), include);
        self
    }

    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.parts.len()
    }
}

/// Filter option as handed over by the URL parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterExpression(pub String);

impl FilterExpression {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Query options in request order (`$filter`, `$select`, `$top`, ...).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    options: Vec<(String, String)>,
}

impl QueryOptions {
    pub fn new(options: Vec<(String, String)>) -> Self {
        QueryOptions { options }
    }

    /// Parse a raw (possibly percent-encoded) query string.
    pub fn parse(raw: &str) -> Result<Self, ODataError> {
        let raw = raw.trim_start_matches('?');
        if raw.is_empty() {
            return Ok(QueryOptions::default());
        }
        let uri: Uri = format!("/?{}", raw.replace(' ', "%20"))
            .parse()
            .map_err(|_| ODataError::BadRequest(format!("invalid query string: {}", raw)))?;
        let Query(options) = Query::<Vec<(String, String)>>::try_from_uri(&uri)
            .map_err(|e| ODataError::BadRequest(e.to_string()))?;
        Ok(QueryOptions { options })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: String) {
        match self.options.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.options.push((name.to_string(), value)),
        }
    }

    pub fn filter(&self) -> Option<FilterExpression> {
        self.get("$filter").map(|f| FilterExpression(f.to_string()))
    }

    pub fn select(&self) -> Option<&str> {
        self.get("$select")
    }

    /// Add `extra` to the filter, as `(existing) and (extra)` when one is already set.
    pub fn with_filter(&self, extra: &str) -> Self {
        let mut out = self.clone();
        let combined = match self.get("$filter") {
            Some(existing) => format!("({}) and ({})", existing, extra),
            None => extra.to_string(),
        };
        out.set("$filter", combined);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_query_string(&self) -> String {
        self.options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Turns a raw URL into a resource path. Provided by the embedding application.
pub trait ResourcePathParser: Send + Sync {
    fn parse(&self, url: &str) -> Result<ResourcePath, ODataError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_encoded_query_string() {
        let q = QueryOptions::parse("$filter=Name%20eq%20'x'&$select=Id,Name").unwrap();
        assert_eq!(q.get("$filter"), Some("Name eq 'x'"));
        assert_eq!(q.select(), Some("Id,Name"));
        let q = QueryOptions::parse("?$filter=Price gt 5").unwrap();
        assert_eq!(q.filter(), Some(FilterExpression("Price gt 5".into())));
    }

    #[test]
    fn with_filter_combines_existing_filter() {
        let q = QueryOptions::new(vec![("$filter".into(), "Price gt 5".into())]);
        assert_eq!(
            q.with_filter("CategoryId eq 1").get("$filter"),
            Some("(Price gt 5) and (CategoryId eq 1)")
        );
        assert_eq!(
            QueryOptions::default().with_filter("CategoryId eq 1").to_query_string(),
            "$filter=CategoryId eq 1"
        );
    }

    #[test]
    fn key_raw_literal_is_quoted_for_strings() {
        assert_eq!(KeyValue::new("Code", json!("a'b")).raw, "'a''b'");
        assert_eq!(KeyValue::new("Id", json!(7)).raw, "7");
    }
}
