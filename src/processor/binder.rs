//! Fills operation arguments from the roles an operation declares.

use crate::error::ODataError;
use crate::processor::streaming::{EntitySink, StreamAccumulator, StreamingTransform};
use crate::processor::RequestContext;
use crate::resource::{KeyValue, QueryOptions};
use crate::service::{KeyBinding, OperationArgs, OperationDescriptor};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Query options as available to the binder.
#[derive(Clone, Debug)]
pub(crate) enum QuerySource<'a> {
    Parsed(QueryOptions),
    /// Raw query string; parsed only if an operation asks for it.
    Raw(&'a str),
}

impl QuerySource<'_> {
    fn resolve(&self) -> Result<QueryOptions, ODataError> {
        match self {
            QuerySource::Parsed(q) => Ok(q.clone()),
            QuerySource::Raw(raw) => QueryOptions::parse(raw),
        }
    }
}

/// Where the stream role writes to.
#[derive(Clone, Copy)]
pub(crate) enum SinkSource<'a> {
    Transform(&'a Arc<StreamingTransform>),
    Accumulator(&'a StreamAccumulator),
}

impl SinkSource<'_> {
    fn sink(&self) -> EntitySink {
        match self {
            SinkSource::Transform(t) => EntitySink::for_transform(t),
            SinkSource::Accumulator(acc) => acc.sink(),
        }
    }
}

pub(crate) struct BindInput<'a> {
    pub query: QuerySource<'a>,
    pub context: &'a RequestContext,
    pub sink: SinkSource<'a>,
    pub result: Option<&'a Value>,
    pub id: Option<&'a str>,
}

/// Build the argument set. Parameters pass through as given; only the identifier is percent-decoded.
pub(crate) fn bind(op: &OperationDescriptor, params: Map<String, Value>, input: BindInput<'_>) -> Result<OperationArgs, ODataError> {
    let roles = &op.roles;
    let mut args = OperationArgs {
        params,
        ..Default::default()
    };
    if roles.query || roles.filter {
        let query = input.query.resolve()?;
        if roles.filter {
            args.filter = query.filter();
        }
        if roles.query {
            args.query = Some(query);
        }
    }
    if roles.context {
        args.context = Some(input.context.clone());
    }
    if roles.stream {
        args.stream = Some(input.sink.sink());
    }
    if roles.result {
        args.result = input.result.cloned();
    }
    if roles.id {
        args.id = input.id.map(percent_decode);
    }
    Ok(args)
}

/// Rename key values to operation parameters. A single key maps to the single binding whatever its name.
pub(crate) fn apply_keys(bindings: &[KeyBinding], keys: &[KeyValue], params: &mut Map<String, Value>) {
    if bindings.len() == 1 && keys.len() == 1 {
        params.remove(&keys[0].name);
        params.insert(bindings[0].to.clone(), keys[0].value.clone());
        return;
    }
    for key in keys {
        if let Some(binding) = bindings.iter().find(|b| b.from == key.name) {
            if binding.to != key.name {
                params.remove(&key.name);
            }
            params.insert(binding.to.clone(), key.value.clone());
        }
    }
}

/// Decode `%XX` escapes; input with malformed escapes is returned unchanged.
pub(crate) fn percent_decode(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3).and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => return s.to_string(),
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input<'a>(ctx: &'a RequestContext, acc: &'a StreamAccumulator, result: Option<&'a Value>) -> BindInput<'a> {
        BindInput {
            query: QuerySource::Raw("$filter=Price%20gt%205&$top=2"),
            context: ctx,
            sink: SinkSource::Accumulator(acc),
            result,
            id: Some("Products%281%29"),
        }
    }

    #[test]
    fn only_declared_roles_are_bound() {
        let ctx = RequestContext::default();
        let acc = StreamAccumulator::new();
        let prior = json!({"Id": 1});
        let op = OperationDescriptor::get("list");
        let args = bind(&op, Map::new(), input(&ctx, &acc, Some(&prior))).unwrap();
        assert!(args.query.is_none() && args.filter.is_none() && args.context.is_none());
        assert!(args.stream.is_none() && args.result.is_none() && args.id.is_none());

        let op = OperationDescriptor::get("list").query().filter().context().stream().result().id();
        let args = bind(&op, Map::new(), input(&ctx, &acc, Some(&prior))).unwrap();
        assert_eq!(args.query.unwrap().get("$top"), Some("2"));
        assert_eq!(args.filter.unwrap().as_str(), "Price gt 5");
        assert!(args.context.is_some() && args.stream.is_some());
        assert_eq!(args.result, Some(prior));
        assert_eq!(args.id.as_deref(), Some("Products(1)"));
    }

    #[test]
    fn key_values_reach_the_operation_verbatim() {
        let ctx = RequestContext::default();
        let acc = StreamAccumulator::new();
        let mut params = Map::new();
        params.insert("Code".into(), json!("50%25off"));
        params.insert("n".into(), json!(3));
        let op = OperationDescriptor::get("find").key("Code").id();
        let args = bind(&op, params, input(&ctx, &acc, None)).unwrap();
        assert_eq!(args.param("Code"), Some(&json!("50%25off")));
        assert_eq!(args.param("n"), Some(&json!(3)));
        assert_eq!(args.id.as_deref(), Some("Products(1)"));
    }

    #[test]
    fn percent_decoding_leaves_malformed_input_alone() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn single_key_maps_regardless_of_name() {
        let op = OperationDescriptor::get("find").key_as("key", "id");
        let keys = vec![KeyValue::new("Id", json!(7))];
        let mut params = Map::new();
        params.insert("Id".into(), json!(7));
        apply_keys(&op.keys, &keys, &mut params);
        assert_eq!(params, json!({"id": 7}).as_object().cloned().unwrap());

        let op = OperationDescriptor::get("find").key_as("OrderId", "order").key("Line");
        let keys = vec![KeyValue::new("OrderId", json!(1)), KeyValue::new("Line", json!(2))];
        let mut params = Map::new();
        apply_keys(&op.keys, &keys, &mut params);
        assert_eq!(params, json!({"order": 1, "Line": 2}).as_object().cloned().unwrap());
    }
}
