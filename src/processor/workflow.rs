//! Steps of a request, one per resource-path part, and the executors for properties and calls.

use crate::error::ODataError;
use crate::processor::annotate::Annotator;
use crate::processor::binder::{bind, BindInput, SinkSource};
use crate::processor::reserved::ReservedContext;
use crate::processor::runner::{self, Settled};
use crate::processor::Processor;
use crate::resource::{PartKind, ResourcePath};
use crate::result::{ODataResult, ODATA_CONTEXT};
use crate::service::{Binding, Controller, ControllerEntry, OperationArgs, OperationDescriptor, Route};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One unit of work; the index points at the resource-path part it serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    EntitySet(usize),
    CollectionNavigation(usize),
    EntityNavigation(usize),
    Property(usize),
    Import(usize),
    /// Bound operations and the reserved `$count`, `$value`, `$ref`.
    Bound(usize),
}

impl Step {
    pub fn index(self) -> usize {
        match self {
            Step::EntitySet(i)
            | Step::CollectionNavigation(i)
            | Step::EntityNavigation(i)
            | Step::Property(i)
            | Step::Import(i)
            | Step::Bound(i) => i,
        }
    }

    fn for_part(index: usize, kind: PartKind) -> Step {
        match kind {
            PartKind::EntitySet => Step::EntitySet(index),
            PartKind::EntityCollectionNavigation => Step::CollectionNavigation(index),
            PartKind::EntityNavigation => Step::EntityNavigation(index),
            PartKind::PrimitiveProperty
            | PartKind::PrimitiveCollectionProperty
            | PartKind::ComplexProperty
            | PartKind::ComplexCollectionProperty => Step::Property(index),
            PartKind::FunctionImport | PartKind::ActionImport => Step::Import(index),
            PartKind::BoundFunction | PartKind::BoundAction | PartKind::Count | PartKind::Value | PartKind::Ref => {
                Step::Bound(index)
            }
        }
    }
}

/// One step per part, in path order. A part followed by `$ref` is consumed by the reference step.
pub(crate) fn build(path: &ResourcePath) -> Vec<Step> {
    path.parts
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            path.parts
                .get(i + 1)
                .map(|next| next.kind != PartKind::Ref)
                .unwrap_or(true)
        })
        .map(|(i, part)| Step::for_part(i, part.kind))
        .collect()
}

/// Binding implied by the part an operation is called on.
fn binding_of(path: &ResourcePath, index: usize) -> Option<Binding> {
    let previous = path.parts.get(index.checked_sub(1)?)?;
    match previous.kind {
        PartKind::EntityNavigation => Some(Binding::Entity),
        PartKind::EntitySet | PartKind::EntityCollectionNavigation if previous.has_key() => Some(Binding::Entity),
        PartKind::EntitySet | PartKind::EntityCollectionNavigation => Some(Binding::Collection),
        _ => None,
    }
}

impl Processor {
    pub(super) async fn run_step(&mut self, step: Step, prior: Option<ODataResult>) -> Result<ODataResult, ODataError> {
        match step {
            Step::EntitySet(i) => self.entity_set(i, prior).await,
            Step::CollectionNavigation(i) => self.navigate(i, prior, true).await,
            Step::EntityNavigation(i) => self.navigate(i, prior, false).await,
            Step::Property(i) => self.property(i, prior).await,
            Step::Import(i) => self.import(i).await,
            Step::Bound(i) => self.bound(i, prior).await,
        }
    }

    /// Property value as `{"@odata.context", "value"}`; stream properties are piped to the output.
    async fn property(&mut self, index: usize, prior: Option<ODataResult>) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let types = &scope.service.types;
        let part = &scope.path.parts[index];
        let mut prior = prior.ok_or(ODataError::ResourceNotFound)?;
        let parent_type = prior.element_type.clone();
        let prop = parent_type.as_deref().and_then(|t| types.property(t, &part.name));
        self.enable_streaming(index, parent_type.as_deref()).await;

        if prop.map(|p| p.is_stream()).unwrap_or(false) {
            let stream = prior.streams.remove(&part.name).ok_or(ODataError::ResourceNotFound)?;
            let content_type = prop
                .and_then(|p| p.content_type.clone())
                .or_else(|| stream.content_type.clone());
            if let Some(ct) = &content_type {
                self.transform.set_content_type(ct);
            }
            self.transform.pipe(stream).await?;
            let mut result = ODataResult::new(200, None, None);
            result.content_type = content_type;
            return Ok(result);
        }

        let value = prior
            .body
            .as_ref()
            .and_then(|b| b.get(&part.name))
            .cloned()
            .unwrap_or(Value::Null);
        let structured = matches!(value, Value::Object(_) | Value::Array(_));
        let element_type = match prop {
            Some(p) if structured && types.get(&p.type_name).is_some() => Some(p.type_name.clone()),
            _ => parent_type,
        };
        let mut body = Map::new();
        body.insert(ODATA_CONTEXT.into(), Value::String(self.state.context.clone()));
        body.insert("value".into(), value);
        let mut result = ODataResult::new(200, None, Some(Value::Object(body)));
        result.element_type = element_type;
        result.foreign_keys = prior.foreign_keys;
        Ok(result)
    }

    /// Function or action import on the service root controller.
    async fn import(&mut self, index: usize) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let part = &scope.path.parts[index];
        let name = part.name.rsplit('.').next().unwrap_or(&part.name);
        let root = scope.service.controllers.root().ok_or(ODataError::ResourceNotFound)?;
        let op = root.find_import(name).ok_or(ODataError::ResourceNotFound)?.clone();
        self.state.prev_ctrl = self.state.ctrl.replace(root.clone());
        let args = self.call_args(index, &op, None)?;
        self.finish_call(root, None, op, args, index).await
    }

    /// Reserved terms go to the reserved registry; anything else is a bound operation.
    async fn bound(&mut self, index: usize, prior: Option<ODataResult>) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let part = &scope.path.parts[index];
        if let Some(term) = reserved_term(part.kind) {
            let op = scope.service.reserved.get(term).ok_or(ODataError::ResourceNotFound)?;
            tracing::debug!(term, "resolving reserved operation");
            let ctx = ReservedContext {
                scope: &scope,
                index,
                prior,
                body: self.body.as_ref(),
                transform: &self.transform,
                current: self.state.ctrl.clone(),
                previous: self.state.prev_ctrl.clone(),
                odata_context: &self.state.context,
            };
            return op.resolve(ctx).await;
        }

        let prior = prior.ok_or(ODataError::ResourceNotFound)?;
        let name = part.name.rsplit('.').next().unwrap_or(&part.name);
        let binding = binding_of(&scope.path, index);
        let controllers = &scope.service.controllers;
        let ctrl = prior
            .element_type
            .as_deref()
            .and_then(|t| controllers.for_type(t))
            .or_else(|| self.state.ctrl.clone())
            .ok_or(ODataError::ResourceNotFound)?;
        let op = ctrl.find_bound(name, binding).ok_or(ODataError::ResourceNotFound)?.clone();
        // The entity was read by the same controller: reuse its instance.
        let instance = match (&self.state.ctrl, &self.state.instance) {
            (Some(current), Some(instance)) if current.same_as(&ctrl) => Some(instance.clone()),
            _ => None,
        };
        let args = self.call_args(index, &op, prior.body.as_ref())?;
        self.state.prev_ctrl = self.state.ctrl.replace(ctrl.clone());
        self.finish_call(ctrl, instance, op, args, index).await
    }

    /// Call parameters plus the request body for actions.
    fn call_args(&self, index: usize, op: &OperationDescriptor, result: Option<&Value>) -> Result<OperationArgs, ODataError> {
        let scope = &self.scope;
        let mut params = scope.path.parts[index].params.clone();
        if op.is_action() {
            if let Some(Value::Object(body)) = &self.body {
                for (k, v) in body {
                    params.insert(k.clone(), v.clone());
                }
            }
        }
        let id = self.link_id();
        bind(
            op,
            params,
            BindInput {
                query: scope.query_source(),
                context: &scope.context,
                sink: SinkSource::Transform(&self.transform),
                result,
                id: id.as_deref(),
            },
        )
    }

    /// Invoke a call, settle its output and annotate it against the declared return type.
    async fn finish_call(
        &mut self,
        ctrl: Arc<ControllerEntry>,
        instance: Option<Arc<dyn Controller>>,
        op: OperationDescriptor,
        args: OperationArgs,
        index: usize,
    ) -> Result<ODataResult, ODataError> {
        let scope = self.scope.clone();
        let types = &scope.service.types;
        let declared = op
            .returns
            .as_ref()
            .map(|r| r.type_name.clone())
            .filter(|t| types.get(t).is_some());
        self.enable_streaming(index, declared.as_deref()).await;

        tracing::debug!(
            controller = %ctrl.name,
            operation = %op.name,
            segment = %scope.path.parts[index].name,
            "invoking operation"
        );
        let instance = instance.unwrap_or_else(|| ctrl.instantiate());
        let settled = runner::settle(instance.invoke(&op.name, args)?).await?;
        self.state.instance = Some(instance);
        if let Some(target) = declared.as_deref().and_then(|t| scope.service.controllers.for_type(t)) {
            self.state.ctrl = Some(target);
        }

        let import_action = op.is_action() && matches!(op.route, Route::Import { .. });
        let mut result = match settled {
            Settled::Stream(stream) => {
                if let Some(ct) = &stream.content_type {
                    self.transform.set_content_type(ct);
                }
                self.transform.pipe(stream).await?;
                return Ok(ODataResult::new(200, None, None));
            }
            Settled::Sequence(handle) => {
                handle.finished().await?;
                return Ok(ODataResult::new(200, None, None));
            }
            Settled::Value(payload) if import_action => return ODataResult::no_content(payload).await,
            Settled::Value(payload) => {
                let mut result = ODataResult::ok(payload).await?;
                if op.is_action() && result.body.is_none() {
                    result.status_code = 204;
                }
                result
            }
            Settled::Media(media) => {
                let mut result = ODataResult::ok(media.value).await?;
                result.media = media.content;
                result.streams = media.properties;
                result
            }
        };
        Annotator::new(&scope, &self.state.context, self.state.ctrl.as_ref())
            .append_context(&mut result, declared.as_deref(), &scope.path.includes)
            .await?;
        Ok(result)
    }
}

fn reserved_term(kind: PartKind) -> Option<&'static str> {
    match kind {
        PartKind::Count => Some("$count"),
        PartKind::Value => Some("$value"),
        PartKind::Ref => Some("$ref"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Part;
    use serde_json::json;

    #[test]
    fn one_step_per_part_in_order() {
        let path = ResourcePath::new(vec![
            Part::entity_set("Categories").with_key("Id", json!(1)),
            Part::new(PartKind::EntityCollectionNavigation, "Products"),
            Part::new(PartKind::PrimitiveProperty, "Name"),
            Part::new(PartKind::Value, "$value"),
        ]);
        assert_eq!(
            build(&path),
            vec![Step::EntitySet(0), Step::CollectionNavigation(1), Step::Property(2), Step::Bound(3)]
        );
    }

    #[test]
    fn ref_consumes_the_preceding_part() {
        let path = ResourcePath::new(vec![
            Part::entity_set("Categories").with_key("Id", json!(1)),
            Part::new(PartKind::EntityCollectionNavigation, "Products"),
            Part::new(PartKind::Ref, "$ref"),
        ]);
        assert_eq!(build(&path), vec![Step::EntitySet(0), Step::Bound(2)]);
    }

    #[test]
    fn calls_map_to_import_and_bound_steps() {
        let path = ResourcePath::new(vec![Part::new(PartKind::FunctionImport, "Top")]);
        assert_eq!(build(&path), vec![Step::Import(0)]);

        let path = ResourcePath::new(vec![
            Part::entity_set("Products"),
            Part::new(PartKind::BoundAction, "Demo.Restock"),
            Part::new(PartKind::Count, "$count"),
        ]);
        assert_eq!(build(&path), vec![Step::EntitySet(0), Step::Bound(1), Step::Bound(2)]);
        assert_eq!(binding_of(&path, 1), Some(Binding::Collection));
        assert_eq!(binding_of(&path, 2), None);
    }
}
