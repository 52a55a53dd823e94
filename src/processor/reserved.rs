//! Reserved path terms: `$count`, `$value` and `$ref`. Each is a registered operation so
//! applications can replace the defaults.

use crate::error::ODataError;
use crate::processor::annotate::Annotator;
use crate::processor::binder::{apply_keys, bind, percent_decode, BindInput, SinkSource};
use crate::processor::runner::{self, Settled};
use crate::processor::streaming::StreamingTransform;
use crate::processor::{RequestContext, RequestScope};
use crate::resource::{Includes, KeyValue, Part, ResourcePath};
use crate::result::{ODataResult, Payload, Verb, JSON, TEXT};
use crate::service::{ControllerEntry, ODataService};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a reserved operation sees of the running request.
pub struct ReservedContext<'a> {
    pub(crate) scope: &'a RequestScope,
    /// Index of the reserved part in the resource path.
    pub index: usize,
    pub prior: Option<ODataResult>,
    /// Request body.
    pub body: Option<&'a Value>,
    pub transform: &'a Arc<StreamingTransform>,
    /// Controller of the last read.
    pub current: Option<Arc<ControllerEntry>>,
    pub previous: Option<Arc<ControllerEntry>>,
    pub odata_context: &'a str,
}

impl<'a> ReservedContext<'a> {
    pub fn verb(&self) -> Verb {
        self.scope.verb
    }

    pub fn path(&self) -> &'a ResourcePath {
        &self.scope.path
    }

    pub fn part(&self) -> &'a Part {
        &self.scope.path.parts[self.index]
    }

    pub fn service(&self) -> &'a ODataService {
        &self.scope.service
    }

    pub fn request_context(&self) -> &'a RequestContext {
        &self.scope.context
    }
}

#[async_trait]
pub trait ReservedOperation: Send + Sync {
    /// Path term served, e.g. `$count`.
    fn term(&self) -> &'static str;

    async fn resolve(&self, ctx: ReservedContext<'_>) -> Result<ODataResult, ODataError>;
}

/// Reserved operations by term; starts with the three defaults.
#[derive(Clone)]
pub struct ReservedRegistry {
    by_term: HashMap<&'static str, Arc<dyn ReservedOperation>>,
}

impl Default for ReservedRegistry {
    fn default() -> Self {
        let mut registry = ReservedRegistry {
            by_term: HashMap::new(),
        };
        registry.register(Arc::new(CountOperation));
        registry.register(Arc::new(ValueOperation));
        registry.register(Arc::new(RefOperation));
        registry
    }
}

impl fmt::Debug for ReservedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.by_term.keys()).finish()
    }
}

impl ReservedRegistry {
    pub fn register(&mut self, op: Arc<dyn ReservedOperation>) {
        self.by_term.insert(op.term(), op);
    }

    pub fn get(&self, term: &str) -> Option<Arc<dyn ReservedOperation>> {
        self.by_term.get(term).cloned()
    }
}

/// `$count`: length of the prior `value` array, else the number of entities the sequence pushed.
pub struct CountOperation;

#[async_trait]
impl ReservedOperation for CountOperation {
    fn term(&self) -> &'static str {
        "$count"
    }

    async fn resolve(&self, ctx: ReservedContext<'_>) -> Result<ODataResult, ODataError> {
        let ReservedContext { prior, transform, .. } = ctx;
        let counted = prior
            .and_then(|p| p.body)
            .and_then(|b| match b {
                Value::Object(mut obj) => obj.remove("value"),
                _ => None,
            })
            .and_then(|v| v.as_array().map(Vec::len))
            .unwrap_or(0);
        let count = if counted == 0 {
            transform.result_count().await
        } else {
            counted
        };
        ODataResult::for_verb_with(Verb::Get, Value::from(count), Some(TEXT)).await
    }
}

/// `$value`: the media stream of a media entity, else the raw value without annotations.
pub struct ValueOperation;

#[async_trait]
impl ReservedOperation for ValueOperation {
    fn term(&self) -> &'static str {
        "$value"
    }

    async fn resolve(&self, ctx: ReservedContext<'_>) -> Result<ODataResult, ODataError> {
        let types = &ctx.service().types;
        let ReservedContext { prior, transform, .. } = ctx;
        let mut prior = prior.ok_or(ODataError::ResourceNotFound)?;

        if let Some(media) = prior.media.take() {
            let declared = prior
                .element_type
                .as_deref()
                .and_then(|t| types.get(t))
                .and_then(|t| t.media_content_type.clone());
            let content_type = media.content_type.clone().or(declared);
            if let Some(ct) = &content_type {
                transform.set_content_type(ct);
            }
            transform.pipe(media).await?;
            let mut result = ODataResult::new(200, None, None);
            result.content_type = content_type;
            return Ok(result);
        }

        let raw = match prior.body.take().ok_or(ODataError::ResourceNotFound)? {
            Value::Object(mut obj) => {
                obj.retain(|k, _| !k.contains("@odata."));
                if obj.len() == 1 && obj.contains_key("value") {
                    obj.remove("value").unwrap_or(Value::Null)
                } else {
                    Value::Object(obj)
                }
            }
            other => other,
        };
        let content_type = if raw.is_object() || raw.is_array() { JSON } else { TEXT };
        Ok(ODataResult::new(200, Some(content_type), Some(raw)))
    }
}

/// `$ref`: `<verb>/<navigation>/$ref` on the controller of the entity owning the navigation.
pub struct RefOperation;

impl RefOperation {
    /// Keys of the linked entity: from the `$id` option or body `@odata.id`, else the navigation key.
    fn link_keys(ctx: &ReservedContext<'_>, navigation: &Part) -> Result<Vec<KeyValue>, ODataError> {
        let id = ctx.path().id.clone().or_else(|| {
            ctx.body
                .and_then(|b| b.get("@odata.id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        match (id, &ctx.service().parser) {
            (Some(id), Some(parser)) => {
                let linked = parser.parse(&percent_decode(&id))?;
                Ok(linked.parts.last().map(|p| p.key.clone()).unwrap_or_default())
            }
            _ => Ok(navigation.key.clone()),
        }
    }
}

#[async_trait]
impl ReservedOperation for RefOperation {
    fn term(&self) -> &'static str {
        "$ref"
    }

    async fn resolve(&self, ctx: ReservedContext<'_>) -> Result<ODataResult, ODataError> {
        let path = ctx.path();
        let verb = ctx.verb();
        let navigation = ctx
            .index
            .checked_sub(1)
            .and_then(|i| path.parts.get(i))
            .ok_or(ODataError::ResourceNotFound)?;
        let route_keys: &[KeyValue] = match ctx.index.checked_sub(2) {
            Some(i) => &path.parts[i].key,
            None => &[],
        };
        let ctrl = ctx.current.clone().ok_or(ODataError::ResourceNotFound)?;
        let segment = format!("{}/$ref", navigation.name);
        let key_names: Vec<String> = route_keys.iter().map(|k| k.name.clone()).collect();
        let op = ctrl
            .find(verb, Some(&segment), &key_names)
            .ok_or(ODataError::ResourceNotFound)?
            .clone();

        let mut params: Map<String, Value> = route_keys.iter().map(|k| (k.name.clone(), k.value.clone())).collect();
        apply_keys(&op.keys, route_keys, &mut params);
        let mut linked = Map::new();
        apply_keys(&op.links, &Self::link_keys(&ctx, navigation)?, &mut linked);
        params.extend(linked);

        let scope = ctx.scope;
        let prior_body = ctx.prior.as_ref().and_then(|p| p.body.clone());
        let id = ctx.path().id.clone();
        let args = bind(
            &op,
            params,
            BindInput {
                query: scope.query_source(),
                context: &scope.context,
                sink: SinkSource::Transform(ctx.transform),
                result: prior_body.as_ref(),
                id: id.as_deref(),
            },
        )?;
        let odata_context = ctx.odata_context;

        tracing::debug!(controller = %ctrl.name, operation = %op.name, verb = %verb, "invoking reference operation");
        let instance = ctrl.instantiate();
        let payload = match runner::settle(instance.invoke(&op.name, args)?).await? {
            Settled::Value(p) => p,
            Settled::Sequence(handle) => {
                handle.finished().await?;
                Payload::Value(Value::Null)
            }
            Settled::Media(_) | Settled::Stream(_) => {
                return Err(ODataError::operation(500, "reference operation returned binary content"))
            }
        };
        if verb != Verb::Get {
            return ODataResult::no_content(payload).await;
        }
        let mut result = ODataResult::ok(payload).await?;
        Annotator::new(scope, odata_context, None)
            .append_context(&mut result, None, &Includes::new())
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ReservedOperation for Echo {
        fn term(&self) -> &'static str {
            "$count"
        }

        async fn resolve(&self, _: ReservedContext<'_>) -> Result<ODataResult, ODataError> {
            ODataResult::ok(Value::from("custom")).await
        }
    }

    #[test]
    fn defaults_are_registered_and_replaceable() {
        let mut registry = ReservedRegistry::default();
        for term in ["$count", "$value", "$ref"] {
            assert_eq!(registry.get(term).map(|op| op.term()), Some(term));
        }
        assert!(registry.get("$batch").is_none());

        registry.register(Arc::new(Echo));
        assert!(registry.get("$count").is_some());
        assert_eq!(format!("{:?}", registry).matches('$').count(), 3);
    }
}
