//! Request pipeline: turns a parsed resource path into ordered steps and runs them
//! against the registered controllers.

mod annotate;
mod binder;
mod context;
pub mod reserved;
mod resolver;
mod runner;
pub mod streaming;
mod workflow;

pub use reserved::{
    CountOperation, RefOperation, ReservedContext, ReservedOperation, ReservedRegistry, ValueOperation,
};
pub use streaming::{
    collect_text, Chunk, EntitySink, MediaStream, ODataStream, SequenceHandle, StreamAccumulator, StreamingTransform,
};
pub use workflow::Step;

use crate::config::ProcessorOptions;
use crate::error::ODataError;
use crate::resource::{PartKind, QueryOptions, ResourcePath};
use crate::result::{ODataResult, Verb};
use crate::service::{Controller, ControllerEntry, ODataService};
use binder::QuerySource;
use serde_json::Value;
use std::sync::Arc;
use streaming::StreamTarget;

/// Where the request came from; used to build absolute links.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestContext {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub base: Option<String>,
}

impl RequestContext {
    /// `protocol://host` followed by the service base path.
    pub fn root(&self, options: &ProcessorOptions) -> String {
        format!(
            "{}://{}{}",
            self.protocol.as_deref().unwrap_or(&options.protocol),
            self.host.as_deref().unwrap_or("localhost"),
            self.base.as_deref().unwrap_or(&options.base_path)
        )
    }
}

#[derive(Clone, Debug)]
pub struct ODataRequest {
    pub method: String,
    /// Request URL; the query string after `?` is kept for lazy option parsing.
    pub url: String,
    pub context: RequestContext,
}

impl ODataRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        ODataRequest {
            method: method.into(),
            url: url.into(),
            context: RequestContext::default(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// Per-request facts shared by every step.
pub(crate) struct RequestScope {
    pub service: Arc<ODataService>,
    pub context: RequestContext,
    pub path: ResourcePath,
    pub verb: Verb,
    pub root: String,
    pub raw_query: String,
}

impl RequestScope {
    /// Options parsed by the URL parser, else the raw query string.
    pub fn query_source(&self) -> QuerySource<'_> {
        if self.path.query.is_empty() {
            QuerySource::Raw(&self.raw_query)
        } else {
            QuerySource::Parsed(self.path.query.clone())
        }
    }

    pub fn query_options(&self) -> Result<QueryOptions, ODataError> {
        if self.path.query.is_empty() {
            QueryOptions::parse(&self.raw_query)
        } else {
            Ok(self.path.query.clone())
        }
    }
}

/// Controller bookkeeping carried from step to step.
#[derive(Default)]
struct PipelineState {
    ctrl: Option<Arc<ControllerEntry>>,
    prev_ctrl: Option<Arc<ControllerEntry>>,
    /// Instance that served the last read; bound operations run on it.
    instance: Option<Arc<dyn Controller>>,
    /// `@odata.context` of the response.
    context: String,
}

pub struct Processor {
    scope: Arc<RequestScope>,
    workflow: Vec<Step>,
    state: PipelineState,
    transform: Arc<StreamingTransform>,
    output: Option<ODataStream>,
    body: Option<Value>,
}

impl Processor {
    /// Rejects unsupported verbs first, then empty paths.
    pub fn new(service: Arc<ODataService>, request: ODataRequest, path: ResourcePath) -> Result<Self, ODataError> {
        let verb: Verb = request.method.parse()?;
        if path.parts.is_empty() {
            return Err(ODataError::ResourceNotFound);
        }
        let workflow = workflow::build(&path);
        if workflow.is_empty() {
            return Err(ODataError::ResourceNotFound);
        }

        let raw_query = request
            .url
            .split_once('?')
            .map(|(_, q)| q.to_string())
            .unwrap_or_default();
        let root = request.context.root(&service.options);
        let select = match path.query.select() {
            Some(s) => Some(s.to_string()),
            None => QueryOptions::parse(&raw_query)
                .ok()
                .and_then(|q| q.select().map(str::to_string)),
        };
        let odata_context = context::build_context(&service, &path, &root, select.as_deref());
        let buffer = service.options.stream_buffer;

        let scope = Arc::new(RequestScope {
            service,
            context: request.context,
            path,
            verb,
            root,
            raw_query,
        });
        let (transform, output) = StreamingTransform::new(scope.clone(), buffer);
        Ok(Processor {
            scope,
            workflow,
            state: PipelineState {
                context: odata_context,
                ..Default::default()
            },
            transform,
            output: Some(output),
            body: None,
        })
    }

    /// Output of the streaming transform. Take it before `execute` and drain it concurrently.
    pub fn take_stream(&mut self) -> Option<ODataStream> {
        self.output.take()
    }

    pub fn workflow(&self) -> &[Step] {
        &self.workflow
    }

    /// `@odata.context` the response will carry.
    pub fn context(&self) -> &str {
        &self.state.context
    }

    /// Run every step in order; the first error aborts the rest. The output stream closes when this returns.
    pub async fn execute(mut self, body: Option<Value>) -> Result<ODataResult, ODataError> {
        self.body = body.filter(|b| !b.is_null());
        let steps = self.workflow.clone();
        let mut result = None;
        for step in steps {
            tracing::debug!(
                step = ?step,
                segment = %self.scope.path.parts[step.index()].name,
                verb = %self.scope.verb,
                "running step"
            );
            result = Some(self.run_step(step, result).await?);
        }
        result.ok_or(ODataError::ResourceNotFound)
    }

    /// `$id` option, else the body's `@odata.id`.
    fn link_id(&self) -> Option<String> {
        self.scope.path.id.clone().or_else(|| {
            self.body
                .as_ref()
                .and_then(|b| b.get("@odata.id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }

    /// Streaming is on for the terminal part and for the part right before `$value`.
    async fn enable_streaming(&self, index: usize, element_type: Option<&str>) {
        let path = &self.scope.path;
        let enabled = path.is_last(index)
            || path
                .parts
                .get(index + 1)
                .map(|p| p.kind == PartKind::Value)
                .unwrap_or(false);
        let controller = element_type
            .and_then(|t| self.scope.service.controllers.for_type(t))
            .or_else(|| self.state.ctrl.clone());
        let target = StreamTarget {
            controller,
            element_type: element_type.map(str::to_string),
        };
        self.transform.configure(enabled, &self.state.context, target).await;
    }
}
