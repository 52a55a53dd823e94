//! Result envelope: status, content type, declared element type and body of one pipeline step.

use crate::error::ODataError;
use crate::processor::streaming::MediaStream;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Key an operation may set on a returned object to report the unpaged total.
pub const INLINE_COUNT: &str = "inlinecount";
pub const ODATA_CONTEXT: &str = "@odata.context";
pub const ODATA_COUNT: &str = "@odata.count";

pub const JSON: &str = "application/json";
pub const TEXT: &str = "text/plain";

/// Request verbs the pipeline accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn is_write(self) -> bool {
        !matches!(self, Verb::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = ODataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" => Ok(Verb::Get),
            "post" => Ok(Verb::Post),
            "put" => Ok(Verb::Put),
            "patch" => Ok(Verb::Patch),
            "delete" => Ok(Verb::Delete),
            other => Err(ODataError::MethodNotAllowed(other.to_string())),
        }
    }
}

/// A value returned by an operation, before it is wrapped.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Value(Value),
    /// A page of entities with an attached inline count.
    Collection { items: Vec<Value>, inline_count: Option<u64> },
}

impl Payload {
    pub fn counted(items: Vec<Value>, inline_count: u64) -> Self {
        Payload::Collection {
            items,
            inline_count: Some(inline_count),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Payload::Value(v) => v,
            Payload::Collection { items, .. } => Value::Array(items),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Value(v)
    }
}

impl From<Vec<Value>> for Payload {
    fn from(items: Vec<Value>) -> Self {
        Payload::Collection {
            items,
            inline_count: None,
        }
    }
}

/// Input accepted by the envelope factories: nothing, a value, or a future of a value.
pub enum EnvelopeInput {
    Ready(Option<Payload>),
    Pending(BoxFuture<'static, Result<Payload, ODataError>>),
}

impl EnvelopeInput {
    async fn settle(self) -> Result<Option<Payload>, ODataError> {
        match self {
            EnvelopeInput::Ready(p) => Ok(p),
            EnvelopeInput::Pending(f) => f.await.map(Some),
        }
    }
}

impl From<Payload> for EnvelopeInput {
    fn from(p: Payload) -> Self {
        EnvelopeInput::Ready(Some(p))
    }
}

impl From<Value> for EnvelopeInput {
    fn from(v: Value) -> Self {
        EnvelopeInput::Ready(Some(Payload::Value(v)))
    }
}

impl From<Option<Payload>> for EnvelopeInput {
    fn from(p: Option<Payload>) -> Self {
        EnvelopeInput::Ready(p)
    }
}

impl From<BoxFuture<'static, Result<Payload, ODataError>>> for EnvelopeInput {
    fn from(f: BoxFuture<'static, Result<Payload, ODataError>>) -> Self {
        EnvelopeInput::Pending(f)
    }
}

pub struct ODataResult {
    pub status_code: u16,
    pub content_type: Option<String>,
    /// Declared type used for metadata lookups; `None` is the untyped placeholder.
    pub element_type: Option<String>,
    pub body: Option<Value>,
    /// Foreign keys inherited by a following write through a navigation.
    pub foreign_keys: Map<String, Value>,
    /// Binary payload of a media entity.
    pub media: Option<MediaStream>,
    /// Payloads of stream properties, by property name.
    pub streams: HashMap<String, MediaStream>,
}

impl fmt::Debug for ODataResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ODataResult")
            .field("status_code", &self.status_code)
            .field("content_type", &self.content_type)
            .field("element_type", &self.element_type)
            .field("body", &self.body)
            .field("foreign_keys", &self.foreign_keys)
            .field("media", &self.media.is_some())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ODataResult {
    /// A JSON `null` body counts as no body.
    pub fn new(status_code: u16, content_type: Option<&str>, body: Option<Value>) -> Self {
        let body = body.filter(|b| !b.is_null());
        let content_type = body.as_ref().map(|_| content_type.unwrap_or(JSON).to_string());
        ODataResult {
            status_code,
            content_type,
            element_type: None,
            body,
            foreign_keys: Map::new(),
            media: None,
            streams: HashMap::new(),
        }
    }

    /// 200; arrays are wrapped as `{value: [...]}` and inline counts hoisted to `@odata.count`.
    pub async fn ok(input: impl Into<EnvelopeInput>) -> Result<ODataResult, ODataError> {
        Self::ok_with(input, None).await
    }

    pub async fn ok_with(input: impl Into<EnvelopeInput>, content_type: Option<&str>) -> Result<ODataResult, ODataError> {
        let payload = input.into().settle().await?;
        Ok(ODataResult::new(200, content_type, payload.map(wrap_ok)))
    }

    /// 201 with the created value as body.
    pub async fn created(input: impl Into<EnvelopeInput>) -> Result<ODataResult, ODataError> {
        let payload = input.into().settle().await?;
        Ok(ODataResult::new(201, None, payload.map(Payload::into_value)))
    }

    /// 204; the value is awaited but discarded.
    pub async fn no_content(input: impl Into<EnvelopeInput>) -> Result<ODataResult, ODataError> {
        input.into().settle().await?;
        Ok(ODataResult::new(204, None, None))
    }

    /// Factory for the verb: get → ok, post → created, put/patch/delete → no content.
    pub async fn for_verb(verb: Verb, input: impl Into<EnvelopeInput>) -> Result<ODataResult, ODataError> {
        Self::for_verb_with(verb, input, None).await
    }

    pub async fn for_verb_with(
        verb: Verb,
        input: impl Into<EnvelopeInput>,
        content_type: Option<&str>,
    ) -> Result<ODataResult, ODataError> {
        match verb {
            Verb::Get => Self::ok_with(input, content_type).await,
            Verb::Post => {
                let mut r = Self::created(input).await?;
                if r.body.is_some() {
                    r.content_type = Some(content_type.unwrap_or(JSON).to_string());
                }
                Ok(r)
            }
            Verb::Put | Verb::Patch | Verb::Delete => Self::no_content(input).await,
        }
    }
}

fn wrap_ok(payload: Payload) -> Value {
    match payload {
        Payload::Collection { items, inline_count } => {
            let mut body = Map::new();
            body.insert("value".into(), Value::Array(items));
            if let Some(n) = inline_count {
                body.insert(ODATA_COUNT.into(), Value::from(n));
            }
            Value::Object(body)
        }
        Payload::Value(Value::Array(items)) => {
            let mut body = Map::new();
            body.insert("value".into(), Value::Array(items));
            Value::Object(body)
        }
        Payload::Value(Value::Object(mut obj)) => {
            if obj.get(INLINE_COUNT).map(Value::is_number).unwrap_or(false) {
                if let Some(n) = obj.remove(INLINE_COUNT) {
                    obj.insert(ODATA_COUNT.into(), n);
                }
            }
            Value::Object(obj)
        }
        Payload::Value(other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn ok_wraps_arrays_and_hoists_count() {
        let r = ODataResult::ok(Payload::counted(vec![json!({"Id": 1})], 10)).await.unwrap();
        assert_eq!(r.status_code, 200);
        assert_eq!(r.body, Some(json!({"value": [{"Id": 1}], "@odata.count": 10})));

        let r = ODataResult::ok(json!([1, 2])).await.unwrap();
        assert_eq!(r.body, Some(json!({"value": [1, 2]})));
    }

    #[tokio::test]
    async fn ok_hoists_count_on_plain_object() {
        let r = ODataResult::ok(json!({"Id": 1, "inlinecount": 4})).await.unwrap();
        assert_eq!(r.body, Some(json!({"Id": 1, "@odata.count": 4})));
    }

    #[tokio::test]
    async fn factories_accept_futures() {
        let pending: BoxFuture<'static, Result<Payload, ODataError>> =
            async { Ok(Payload::Value(json!({"Id": 3}))) }.boxed();
        let r = ODataResult::created(pending).await.unwrap();
        assert_eq!(r.status_code, 201);
        assert_eq!(r.body, Some(json!({"Id": 3})));

        let r = ODataResult::for_verb(Verb::Patch, json!({"Id": 3})).await.unwrap();
        assert_eq!(r.status_code, 204);
        assert!(r.body.is_none());
    }

    #[test]
    fn null_body_is_absent_and_verbs_parse() {
        assert!(ODataResult::new(200, None, Some(Value::Null)).body.is_none());
        assert_eq!("PATCH".parse::<Verb>().unwrap(), Verb::Patch);
        assert!(matches!("head".parse::<Verb>(), Err(ODataError::MethodNotAllowed(_))));
    }
}
