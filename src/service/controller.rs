//! Controllers: providers of entity sets and the operations the pipeline invokes on them.

use crate::error::ODataError;
use crate::processor::streaming::{EntitySink, MediaStream, SequenceHandle};
use crate::processor::RequestContext;
use crate::resource::{FilterExpression, QueryOptions};
use crate::result::{Payload, Verb};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Arguments handed to an operation. Role slots are filled only when the operation declares them.
#[derive(Default)]
pub struct OperationArgs {
    pub params: Map<String, Value>,
    pub query: Option<QueryOptions>,
    pub filter: Option<FilterExpression>,
    pub context: Option<RequestContext>,
    pub stream: Option<EntitySink>,
    /// Prior result body (or the bound entity).
    pub result: Option<Value>,
    pub id: Option<String>,
}

impl OperationArgs {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Sink of the stream role; errors when the operation did not declare it.
    pub fn sink(&self) -> Result<EntitySink, ODataError> {
        self.stream
            .clone()
            .ok_or_else(|| ODataError::operation(500, "operation has no stream parameter"))
    }
}

/// Binary payload of a media entity plus payloads of its stream properties.
pub struct MediaEntity {
    pub value: Value,
    pub content: Option<MediaStream>,
    pub properties: HashMap<String, MediaStream>,
}

impl MediaEntity {
    pub fn new(value: Value, content: MediaStream) -> Self {
        MediaEntity {
            value,
            content: Some(content),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, stream: MediaStream) -> Self {
        self.properties.insert(name.into(), stream);
        self
    }
}

/// Resumption input for a cooperative operation.
#[derive(Debug)]
pub enum Resume {
    Start,
    /// Resolved value of the last awaited future.
    Value(Value),
    /// The awaited sequence ended.
    Continue,
}

/// What a cooperative operation asks the driver to do next.
pub enum Instruction {
    Await(BoxFuture<'static, Result<Value, ODataError>>),
    AwaitSequence(SequenceHandle),
    Complete(OperationOutput),
}

/// A multi-step operation driven by the pipeline until it completes.
pub trait CooperativeOperation: Send {
    fn resume(&mut self, input: Resume) -> Result<Instruction, ODataError>;
}

/// Every shape an operation may return.
pub enum OperationOutput {
    Value(Payload),
    Future(BoxFuture<'static, Result<OperationOutput, ODataError>>),
    /// Entities are pushed through the stream role; settles when the sequence ends.
    Sequence(SequenceHandle),
    Media(MediaEntity),
    Stream(MediaStream),
    Cooperative(Box<dyn CooperativeOperation>),
}

impl OperationOutput {
    pub fn value(v: impl Into<Payload>) -> Self {
        OperationOutput::Value(v.into())
    }

    pub fn none() -> Self {
        OperationOutput::Value(Payload::Value(Value::Null))
    }

    pub fn future<F>(f: F) -> Self
    where
        F: Future<Output = Result<Value, ODataError>> + Send + 'static,
    {
        OperationOutput::Future(async move { f.await.map(OperationOutput::value) }.boxed())
    }

    pub fn cooperative(op: impl CooperativeOperation + 'static) -> Self {
        OperationOutput::Cooperative(Box::new(op))
    }
}

impl fmt::Debug for OperationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            OperationOutput::Value(p) => return f.debug_tuple("Value").field(p).finish(),
            OperationOutput::Future(_) => "Future",
            OperationOutput::Sequence(_) => "Sequence",
            OperationOutput::Media(_) => "Media",
            OperationOutput::Stream(_) => "Stream",
            OperationOutput::Cooperative(_) => "Cooperative",
        };
        f.write_str(shape)
    }
}

pub trait Controller: Send + Sync {
    fn invoke(&self, operation: &str, args: OperationArgs) -> Result<OperationOutput, ODataError>;
}

pub type ControllerFactory = Arc<dyn Fn() -> Box<dyn Controller> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Function,
    Action,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Entity,
    Collection,
}

/// How an operation is addressed by the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// CRUD access; `segment` is a navigation property (`Products`) or a link (`Products/$ref`).
    Verb { verb: Verb, segment: Option<String> },
    Bound { kind: OperationKind, binding: Binding },
    Import { kind: OperationKind },
}

/// Renames a URL key (or link key) to an operation parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyBinding {
    pub from: String,
    pub to: String,
}

/// Roles an operation declares for its parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterRoles {
    pub query: bool,
    pub filter: bool,
    pub context: bool,
    pub stream: bool,
    pub result: bool,
    pub id: bool,
    /// Parameter name receiving the request body.
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnType {
    pub type_name: String,
    pub collection: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OperationDescriptor {
    pub name: String,
    pub route: Route,
    pub keys: Vec<KeyBinding>,
    pub links: Vec<KeyBinding>,
    pub roles: ParameterRoles,
    pub returns: Option<ReturnType>,
}

impl OperationDescriptor {
    fn with_route(name: impl Into<String>, route: Route) -> Self {
        OperationDescriptor {
            name: name.into(),
            route,
            keys: Vec::new(),
            links: Vec::new(),
            roles: ParameterRoles::default(),
            returns: None,
        }
    }

    pub fn verb(verb: Verb, name: impl Into<String>) -> Self {
        Self::with_route(name, Route::Verb { verb, segment: None })
    }

    pub fn get(name: impl Into<String>) -> Self {
        Self::verb(Verb::Get, name)
    }

    pub fn post(name: impl Into<String>) -> Self {
        Self::verb(Verb::Post, name)
    }

    pub fn put(name: impl Into<String>) -> Self {
        Self::verb(Verb::Put, name)
    }

    pub fn patch(name: impl Into<String>) -> Self {
        Self::verb(Verb::Patch, name)
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self::verb(Verb::Delete, name)
    }

    pub fn function(name: impl Into<String>, binding: Binding) -> Self {
        Self::with_route(name, Route::Bound { kind: OperationKind::Function, binding })
    }

    pub fn action(name: impl Into<String>, binding: Binding) -> Self {
        Self::with_route(name, Route::Bound { kind: OperationKind::Action, binding })
    }

    pub fn function_import(name: impl Into<String>) -> Self {
        Self::with_route(name, Route::Import { kind: OperationKind::Function })
    }

    pub fn action_import(name: impl Into<String>) -> Self {
        Self::with_route(name, Route::Import { kind: OperationKind::Action })
    }

    /// Address the operation through a navigation property or link segment.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        if let Route::Verb { segment: s, .. } = &mut self.route {
            *s = Some(segment.into());
        }
        self
    }

    pub fn key(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.key_as(name.clone(), name)
    }

    pub fn key_as(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.keys.push(KeyBinding { from: from.into(), to: to.into() });
        self
    }

    pub fn link_as(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.links.push(KeyBinding { from: from.into(), to: to.into() });
        self
    }

    pub fn query(mut self) -> Self {
        self.roles.query = true;
        self
    }

    pub fn filter(mut self) -> Self {
        self.roles.filter = true;
        self
    }

    pub fn context(mut self) -> Self {
        self.roles.context = true;
        self
    }

    pub fn stream(mut self) -> Self {
        self.roles.stream = true;
        self
    }

    pub fn result(mut self) -> Self {
        self.roles.result = true;
        self
    }

    pub fn id(mut self) -> Self {
        self.roles.id = true;
        self
    }

    pub fn body(mut self, param: impl Into<String>) -> Self {
        self.roles.body = Some(param.into());
        self
    }

    pub fn returns(mut self, type_name: impl Into<String>) -> Self {
        self.returns = Some(ReturnType { type_name: type_name.into(), collection: false });
        self
    }

    pub fn returns_collection(mut self, type_name: impl Into<String>) -> Self {
        self.returns = Some(ReturnType { type_name: type_name.into(), collection: true });
        self
    }

    pub fn is_action(&self) -> bool {
        matches!(
            self.route,
            Route::Bound { kind: OperationKind::Action, .. } | Route::Import { kind: OperationKind::Action }
        )
    }

    /// A keyed request needs as many key bindings; multi-part keys must also match by name.
    fn accepts_keys(&self, keys: &[String]) -> bool {
        if self.keys.len() != keys.len() {
            return false;
        }
        keys.len() <= 1 || keys.iter().all(|k| self.keys.iter().any(|b| &b.from == k))
    }
}

/// Registered provider of one element type.
#[derive(Clone)]
pub struct ControllerEntry {
    pub name: String,
    pub element_type: String,
    pub operations: Vec<OperationDescriptor>,
    factory: ControllerFactory,
}

impl fmt::Debug for ControllerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerEntry")
            .field("name", &self.name)
            .field("element_type", &self.element_type)
            .field("operations", &self.operations.len())
            .finish()
    }
}

impl ControllerEntry {
    pub fn new<F, C>(name: impl Into<String>, element_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Controller + 'static,
    {
        ControllerEntry {
            name: name.into(),
            element_type: element_type.into(),
            operations: Vec::new(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Controller>),
        }
    }

    pub fn operation(mut self, op: OperationDescriptor) -> Self {
        self.operations.push(op);
        self
    }

    /// New instance for one invocation.
    pub fn instantiate(&self) -> Arc<dyn Controller> {
        Arc::from((self.factory)())
    }

    /// CRUD operation for the verb, optional segment and key shape.
    pub fn find(&self, verb: Verb, segment: Option<&str>, keys: &[String]) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|op| match &op.route {
            Route::Verb { verb: v, segment: s } => *v == verb && s.as_deref() == segment && op.accepts_keys(keys),
            _ => false,
        })
    }

    pub fn find_bound(&self, name: &str, binding: Option<Binding>) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|op| match &op.route {
            Route::Bound { binding: b, .. } => op.name == name && binding.map(|want| want == *b).unwrap_or(true),
            _ => false,
        })
    }

    pub fn find_import(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations
            .iter()
            .find(|op| op.name == name && matches!(op.route, Route::Import { .. }))
    }

    pub fn same_as(&self, other: &ControllerEntry) -> bool {
        self.name == other.name
    }
}
