//! Locates and invokes the controller operation for entity set, navigation and expansion reads.

use crate::config::TypeRegistry;
use crate::edm;
use crate::error::ODataError;
use crate::processor::annotate::Annotator;
use crate::processor::binder::{apply_keys, bind, BindInput, QuerySource, SinkSource};
use crate::processor::runner::{self, Settled};
use crate::processor::streaming::{StreamAccumulator, StreamingTransform};
use crate::processor::{Processor, RequestScope};
use crate::resource::{Include, Includes, KeyValue, Part, QueryOptions};
use crate::result::{ODataResult, Payload, Verb};
use crate::service::{Controller, ControllerEntry, OperationArgs, OperationDescriptor};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Intermediate segments of a write are reads.
pub(crate) fn effective_verb(verb: Verb, terminal: bool) -> Verb {
    if verb.is_write() && !terminal {
        Verb::Get
    } else {
        verb
    }
}

/// `<fk> eq <literal>` for each foreign key, joined with ` and `; `None` when there are no keys.
pub(crate) fn foreign_key_filter(
    types: &TypeRegistry,
    child_type: &str,
    foreign_keys: &[String],
    parent_key: Option<&Value>,
) -> Result<Option<String>, ODataError> {
    if foreign_keys.is_empty() {
        return Ok(None);
    }
    let clauses = foreign_keys
        .iter()
        .map(|fk| edm::escape(parent_key, types.property_type(child_type, fk)).map(|lit| format!("{} eq {}", fk, lit)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(clauses.join(" and ")))
}

pub(crate) struct Invocation {
    pub controller: Arc<ControllerEntry>,
    pub op: OperationDescriptor,
    pub args: OperationArgs,
}

/// Settings shared by pipeline reads and expansion reads.
pub(crate) struct ReadContext<'a> {
    pub scope: &'a RequestScope,
    pub odata_context: &'a str,
    pub verb: Verb,
    pub terminal: bool,
    pub element_type: String,
    pub includes: &'a Includes,
    /// Set for expansions; live sequences are collected here.
    pub accumulator: Option<&'a StreamAccumulator>,
    pub transform: Option<&'a StreamingTransform>,
    pub body: Option<&'a Value>,
    pub inherited: Inherited<'a>,
    pub keyless: bool,
    pub current: Option<&'a Arc<ControllerEntry>>,
}

/// What a read takes over from the previous step's result.
#[derive(Clone, Copy, Default)]
pub(crate) struct Inherited<'a> {
    pub body: Option<&'a Value>,
    pub foreign_keys: Option<&'a Map<String, Value>>,
}

impl<'a> Inherited<'a> {
    pub fn of(result: Option<&'a ODataResult>) -> Self {
        match result {
            Some(r) => Inherited {
                body: r.body.as_ref(),
                foreign_keys: Some(&r.foreign_keys),
            },
            None => Inherited::default(),
        }
    }
}

/// Invoke, settle, wrap for the verb and annotate.
pub(crate) async fn invoke_read(
    read: ReadContext<'_>,
    inv: Invocation,
) -> Result<(ODataResult, Arc<dyn Controller>), ODataError> {
    let Invocation { controller, op, mut args } = inv;
    if matches!(read.verb, Verb::Post | Verb::Put | Verb::Patch) {
        bind_body(&read, &op, &mut args);
    }
    tracing::debug!(
        controller = %controller.name,
        operation = %op.name,
        verb = %read.verb,
        "invoking operation"
    );
    let instance = controller.instantiate();
    let settled = runner::settle(instance.invoke(&op.name, args)?).await?;
    let mut result = match settled {
        Settled::Sequence(handle) => {
            handle.finished().await?;
            match read.accumulator {
                Some(acc) => ODataResult::ok(Payload::from(acc.values())).await?,
                None => return Ok((ODataResult::for_verb(read.verb, None::<Payload>).await?, instance)),
            }
        }
        Settled::Value(p) => ODataResult::for_verb(read.verb, p).await?,
        Settled::Media(m) => {
            let mut r = ODataResult::for_verb(read.verb, m.value).await?;
            r.media = m.content;
            r.streams = m.properties;
            r
        }
        Settled::Stream(s) => {
            let mut r = ODataResult::for_verb(read.verb, None::<Payload>).await?;
            r.media = Some(s);
            r
        }
    };

    if read.terminal && !read.verb.is_write() && result.body.is_none() && result.media.is_none() {
        let started = match read.transform {
            Some(t) => t.started().await,
            None => false,
        };
        if !started {
            return Err(ODataError::ResourceNotFound);
        }
    }

    Annotator::new(read.scope, read.odata_context, read.current)
        .append_context(&mut result, Some(&read.element_type), read.includes)
        .await?;
    Ok((result, instance))
}

/// Request body (plus inherited foreign keys) to the body parameter; keyless writes also get key values.
fn bind_body(read: &ReadContext<'_>, op: &OperationDescriptor, args: &mut OperationArgs) {
    let mut body = read.body.cloned().unwrap_or(Value::Null);
    if let (Value::Object(obj), Some(fks)) = (&mut body, read.inherited.foreign_keys) {
        for (k, v) in fks {
            obj.insert(k.clone(), v.clone());
        }
    }
    if read.keyless {
        let prior_body = read.inherited.body;
        for key in read.scope.service.types.key_properties(&read.element_type) {
            let found = body
                .get(key)
                .filter(|v| !v.is_null())
                .or_else(|| prior_body.and_then(|b| b.get(key)));
            if let Some(v) = found {
                args.params.insert(key.clone(), v.clone());
            }
        }
    }
    if let Some(param) = &op.roles.body {
        args.params.insert(param.clone(), body);
    }
}

/// Expansion not materialized on the source entity.
pub(crate) struct IncludeRead<'r> {
    pub include: &'r Include,
    /// Controller of the parent entity type.
    pub parent: Option<&'r Arc<ControllerEntry>>,
    pub source: &'r Value,
    pub element_type: &'r str,
    pub nav_type: &'r str,
    pub collection: bool,
}

/// Dedicated `get/<navigation>` of the parent controller, else a foreign-key read on the target controller.
pub(crate) async fn read_include(
    scope: &RequestScope,
    odata_context: &str,
    read: IncludeRead<'_>,
) -> Result<ODataResult, ODataError> {
    let types = &scope.service.types;
    let controllers = &scope.service.controllers;
    let nav = read.include.navigation_property.as_str();
    let accumulator = StreamAccumulator::new();
    let nav_ctrl = controllers.for_type(read.nav_type);

    if let Some(parent) = read.parent {
        if let Some(op) = parent.find(Verb::Get, Some(nav), &[]) {
            let args = bind(
                op,
                Map::new(),
                BindInput {
                    query: QuerySource::Parsed(read.include.query.clone()),
                    context: &scope.context,
                    sink: SinkSource::Accumulator(&accumulator),
                    result: Some(read.source),
                    id: None,
                },
            )?;
            let inv = Invocation {
                controller: parent.clone(),
                op: op.clone(),
                args,
            };
            let ctx = include_context(scope, odata_context, &read, &accumulator, nav_ctrl.as_ref());
            return invoke_read(ctx, inv).await.map(|(r, _)| r);
        }
    }

    let ctrl = nav_ctrl.clone().ok_or(ODataError::ResourceNotFound)?;
    let foreign_keys = types.foreign_keys(read.element_type, nav);
    let (keys, filter) = if read.collection {
        let parent_key = types
            .key_properties(read.element_type)
            .first()
            .ok_or_else(|| ODataError::Literal(format!("{} has no key", read.element_type)))?;
        let filter = foreign_key_filter(types, read.nav_type, foreign_keys, read.source.get(parent_key))?;
        (Vec::new(), filter)
    } else {
        let keys = foreign_keys
            .iter()
            .map(|fk| {
                read.source
                    .get(fk)
                    .map(|v| KeyValue::new(fk.clone(), v.clone()))
                    .ok_or_else(|| ODataError::Literal(format!("missing foreign key {}", fk)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        (keys, None)
    };

    let key_names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
    let op = ctrl
        .find(Verb::Get, None, &key_names)
        .ok_or(ODataError::ResourceNotFound)?
        .clone();
    let query = match &filter {
        Some(f) => read.include.query.with_filter(f),
        None => read.include.query.clone(),
    };
    let mut params: Map<String, Value> = keys.iter().map(|k| (k.name.clone(), k.value.clone())).collect();
    apply_keys(&op.keys, &keys, &mut params);
    let args = bind(
        &op,
        params,
        BindInput {
            query: QuerySource::Parsed(query),
            context: &scope.context,
            sink: SinkSource::Accumulator(&accumulator),
            result: None,
            id: None,
        },
    )?;
    let inv = Invocation {
        controller: ctrl.clone(),
        op,
        args,
    };
    let ctx = include_context(scope, odata_context, &read, &accumulator, Some(&ctrl));
    invoke_read(ctx, inv).await.map(|(r, _)| r)
}

fn include_context<'a>(
    scope: &'a RequestScope,
    odata_context: &'a str,
    read: &IncludeRead<'a>,
    accumulator: &'a StreamAccumulator,
    current: Option<&'a Arc<ControllerEntry>>,
) -> ReadContext<'a> {
    ReadContext {
        scope,
        odata_context,
        verb: Verb::Get,
        terminal: false,
        element_type: read.nav_type.to_string(),
        includes: &read.include.includes,
        accumulator: Some(accumulator),
        transform: None,
        body: None,
        inherited: Inherited::default(),
        keyless: false,
        current,
    }
}

impl Processor {
    pub(super) async fn entity_set(&mut self, index: usize, prior: Option<ODataResult>) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let part = &scope.path.parts[index];
        let ctrl = scope
            .service
            .controllers
            .for_entity_set(&part.name)
            .ok_or(ODataError::ResourceNotFound)?;
        let inherited = Inherited::of(prior.as_ref());
        self.read(ctrl, index, part, inherited, None, None).await
    }

    pub(super) async fn navigate(
        &mut self,
        index: usize,
        prior: Option<ODataResult>,
        collection: bool,
    ) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let types = &scope.service.types;
        let controllers = &scope.service.controllers;
        let part = &scope.path.parts[index];
        let mut prior = prior.ok_or(ODataError::ResourceNotFound)?;
        let parent_type = prior.element_type.clone().ok_or(ODataError::ResourceNotFound)?;
        let element_type = types
            .related_type(&parent_type, &part.name)
            .ok_or(ODataError::ResourceNotFound)?
            .to_string();
        let terminal = scope.path.is_last(index);
        let verb = effective_verb(scope.verb, terminal);
        let key_names: Vec<String> = part.key.iter().map(|k| k.name.clone()).collect();
        let current = self.state.ctrl.clone().ok_or(ODataError::ResourceNotFound)?;
        let target_ctrl = controllers.for_type(&element_type);

        if let Some(op) = current.find(verb, Some(&part.name), &key_names).cloned() {
            let mut params = part.key_params();
            apply_keys(&op.keys, &part.key, &mut params);
            if collection {
                for k in &part.key {
                    params.insert(k.name.clone(), k.value.clone());
                }
            }
            let id = self.link_id();
            let args = bind(
                &op,
                params,
                BindInput {
                    query: scope.query_source(),
                    context: &scope.context,
                    sink: SinkSource::Transform(&self.transform),
                    result: prior.body.as_ref(),
                    id: id.as_deref(),
                },
            )?;
            self.state.prev_ctrl = Some(current.clone());
            if verb == Verb::Post {
                self.state.context.push_str("/$entity");
            }
            self.enable_streaming(index, Some(&element_type)).await;
            let body = self.body.clone();
            let inherited = Inherited::of(Some(&prior));
            let (result, instance) = invoke_read(
                ReadContext {
                    scope: &scope,
                    odata_context: &self.state.context,
                    verb,
                    terminal,
                    element_type: element_type.clone(),
                    includes: &scope.path.includes,
                    accumulator: None,
                    transform: Some(&*self.transform),
                    body: body.as_ref(),
                    inherited,
                    keyless: !part.has_key(),
                    current: target_ctrl.as_ref(),
                },
                Invocation {
                    controller: current.clone(),
                    op,
                    args,
                },
            )
            .await?;
            self.state.instance = Some(instance);
            self.state.ctrl = target_ctrl.or(Some(current));
            return Ok(result);
        }

        let ctrl = target_ctrl.ok_or(ODataError::ResourceNotFound)?;
        let foreign_keys = types.foreign_keys(&parent_type, &part.name);
        let parent_body = prior.body.clone().unwrap_or(Value::Null);
        if collection {
            let parent_key = types
                .key_properties(&parent_type)
                .first()
                .ok_or(ODataError::ResourceNotFound)?;
            let key_value = parent_body.get(parent_key).cloned();
            let filter = foreign_key_filter(types, &element_type, foreign_keys, key_value.as_ref())?;
            for fk in foreign_keys {
                prior
                    .foreign_keys
                    .insert(fk.clone(), key_value.clone().unwrap_or(Value::Null));
            }
            let inherited = Inherited::of(Some(&prior));
            self.read(ctrl, index, part, inherited, filter, Some(element_type)).await
        } else {
            let mut nav_part = part.clone();
            nav_part.key = foreign_keys
                .iter()
                .map(|fk| KeyValue::new(fk.clone(), parent_body.get(fk).cloned().unwrap_or(Value::Null)))
                .collect();
            for k in &nav_part.key {
                prior.foreign_keys.insert(k.name.clone(), k.value.clone());
            }
            let inherited = Inherited::of(Some(&prior));
            self.read(ctrl, index, &nav_part, inherited, None, Some(element_type)).await
        }
    }

    /// Read through `ctrl` with the part's key; `filter` restricts a navigation to the parent's rows.
    async fn read(
        &mut self,
        ctrl: Arc<ControllerEntry>,
        index: usize,
        part: &Part,
        inherited: Inherited<'_>,
        filter: Option<String>,
        element_type: Option<String>,
    ) -> Result<ODataResult, ODataError> {
        self.state.prev_ctrl = Some(self.state.ctrl.clone().unwrap_or_else(|| ctrl.clone()));
        self.state.ctrl = Some(ctrl.clone());
        let scope = self.scope.clone();
        let terminal = scope.path.is_last(index);
        let verb = effective_verb(scope.verb, terminal);
        let key_names: Vec<String> = part.key.iter().map(|k| k.name.clone()).collect();
        let op = ctrl
            .find(verb, None, &key_names)
            .ok_or(ODataError::ResourceNotFound)?
            .clone();

        let query = match (&filter, terminal) {
            (Some(f), true) => QuerySource::Parsed(scope.query_options()?.with_filter(f)),
            (Some(f), false) => QuerySource::Parsed(QueryOptions::new(vec![("$filter".into(), f.clone())])),
            (None, _) => scope.query_source(),
        };
        let mut params = part.key_params();
        apply_keys(&op.keys, &part.key, &mut params);
        let id = self.link_id();
        let args = bind(
            &op,
            params,
            BindInput {
                query,
                context: &scope.context,
                sink: SinkSource::Transform(&self.transform),
                result: None,
                id: id.as_deref(),
            },
        )?;

        let element_type = element_type.unwrap_or_else(|| ctrl.element_type.clone());
        if verb == Verb::Post {
            self.state.context.push_str("/$entity");
        }
        self.enable_streaming(index, Some(&element_type)).await;
        let body = self.body.clone();
        let (result, instance) = invoke_read(
            ReadContext {
                scope: &scope,
                odata_context: &self.state.context,
                verb,
                terminal,
                element_type,
                includes: &scope.path.includes,
                accumulator: None,
                transform: Some(&*self.transform),
                body: body.as_ref(),
                inherited,
                keyless: !part.has_key(),
                current: self.state.ctrl.as_ref(),
            },
            Invocation {
                controller: ctrl,
                op,
                args,
            },
        )
        .await?;
        self.state.instance = Some(instance);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::fixture_service;
    use serde_json::json;

    #[test]
    fn write_verbs_read_intermediate_segments() {
        assert_eq!(effective_verb(Verb::Post, false), Verb::Get);
        assert_eq!(effective_verb(Verb::Post, true), Verb::Post);
        assert_eq!(effective_verb(Verb::Get, false), Verb::Get);
    }

    #[test]
    fn foreign_key_filter_escapes_parent_key() {
        let service = fixture_service();
        let fks = vec!["CategoryId".to_string()];
        let filter = foreign_key_filter(&service.types, "Product", &fks, Some(&json!(1))).unwrap();
        assert_eq!(filter.as_deref(), Some("CategoryId eq 1"));

        let fks = vec!["Code".to_string()];
        let filter = foreign_key_filter(&service.types, "Product", &fks, Some(&json!("a'b"))).unwrap();
        assert_eq!(filter.as_deref(), Some("Code eq 'a''b'"));

        assert!(foreign_key_filter(&service.types, "Product", &fks, None).is_err());
        assert_eq!(foreign_key_filter(&service.types, "Product", &[], None).unwrap(), None);
    }
}
