//! Shapes response bodies from type metadata: context, links, nested conversion, expansions.

use crate::config::{PropertyInfo, TypeInfo, TypeRegistry};
use crate::edm;
use crate::error::ODataError;
use crate::processor::{resolver, RequestScope};
use crate::resource::{Include, Includes};
use crate::result::{ODataResult, Verb, ODATA_CONTEXT, ODATA_COUNT};
use crate::service::ControllerEntry;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::sync::Arc;

const ODATA_TYPE: &str = "@odata.type";

pub(crate) struct Annotator<'a> {
    scope: &'a RequestScope,
    context: &'a str,
    /// Controller of the step being annotated.
    current: Option<&'a Arc<ControllerEntry>>,
}

impl<'a> Annotator<'a> {
    pub fn new(scope: &'a RequestScope, context: &'a str, current: Option<&'a Arc<ControllerEntry>>) -> Self {
        Annotator { scope, context, current }
    }

    fn types(&self) -> &'a TypeRegistry {
        &self.scope.service.types
    }

    fn contextual_type(&self) -> Option<&'a str> {
        self.current.map(|c| c.element_type.as_str())
    }

    /// Decorate `result.body` for output. Bodies that already carry `@odata.context` are left alone.
    pub async fn append_context(
        &self,
        result: &mut ODataResult,
        declared: Option<&str>,
        includes: &Includes,
    ) -> Result<(), ODataError> {
        let types = self.types();
        let element_type = match result.element_type.as_deref() {
            Some(t) if types.get(t).is_some() => Some(t.to_string()),
            _ => declared.map(str::to_string),
        };
        result.element_type = element_type.clone();
        let Some(body) = result.body.take() else {
            return Ok(());
        };
        if result_has_context(&body) {
            result.body = Some(body);
            return Ok(());
        }

        let element_type = element_type.as_deref();
        let ctrl = self.controller_for(element_type);
        let mut out = Map::new();
        out.insert(ODATA_CONTEXT.into(), Value::String(self.context.to_string()));

        match &body {
            Value::Object(obj) => {
                if let Some(n) = obj.get(ODATA_COUNT).filter(|n| n.is_number()) {
                    out.insert(ODATA_COUNT.into(), n.clone());
                }
                match obj.get("value") {
                    Some(Value::Array(items)) => {
                        let value = self.convert_items(items, ctrl.as_ref(), element_type, includes).await?;
                        out.insert("value".into(), Value::Array(value));
                    }
                    _ => {
                        if let (Some(ctrl), Some(t)) = (&ctrl, element_type) {
                            self.append_links(ctrl, t, &mut out, &body);
                        }
                        out = self
                            .convert_entity(out, &body, element_type, self.contextual_type(), includes)
                            .await?;
                    }
                }
            }
            Value::Array(items) => {
                let value = self.convert_items(items, ctrl.as_ref(), element_type, includes).await?;
                out.insert("value".into(), Value::Array(value));
            }
            other => {
                out.insert("value".into(), other.clone());
            }
        }
        result.body = Some(Value::Object(out));
        Ok(())
    }

    /// Links and conversion for one streamed entity.
    pub async fn annotate_entity(
        &self,
        source: &Value,
        element_type: Option<&str>,
        includes: &Includes,
    ) -> Result<Map<String, Value>, ODataError> {
        let element_type = element_type.or(self.contextual_type());
        let mut target = Map::new();
        if let (Some(ctrl), Some(t)) = (self.controller_for(element_type), element_type) {
            self.append_links(&ctrl, t, &mut target, source);
        }
        self.convert_entity(target, source, element_type, self.contextual_type(), includes)
            .await
    }

    fn controller_for(&self, element_type: Option<&str>) -> Option<Arc<ControllerEntry>> {
        let element_type = element_type?;
        match self.current {
            Some(c) if c.element_type == element_type => Some(c.clone()),
            _ => self.scope.service.controllers.for_type(element_type),
        }
    }

    /// Elements are converted concurrently; output keeps input positions.
    async fn convert_items(
        &self,
        items: &[Value],
        ctrl: Option<&Arc<ControllerEntry>>,
        element_type: Option<&str>,
        includes: &Includes,
    ) -> Result<Vec<Value>, ODataError> {
        let converted = join_all(items.iter().map(|entity| async move {
            if !entity.is_object() {
                return Ok(entity.clone());
            }
            let mut item = Map::new();
            if let (Some(ctrl), Some(t)) = (ctrl, element_type) {
                self.append_links(ctrl, t, &mut item, entity);
            }
            self.convert_entity(item, entity, element_type, self.contextual_type(), includes)
                .await
                .map(Value::Object)
        }))
        .await;
        converted.into_iter().collect()
    }

    fn entity_set_of(&self, ctrl: &ControllerEntry) -> Option<&'a str> {
        let controllers = &self.scope.service.controllers;
        if let Some(first) = self.scope.path.parts.first() {
            if let Some(c) = controllers.for_entity_set(&first.name) {
                if c.same_as(ctrl) {
                    return Some(first.name.as_str());
                }
            }
        }
        controllers.entity_set_of(ctrl)
    }

    /// `@odata.id`, media links and `@odata.editLink`. Entities whose key cannot be written get none.
    pub fn append_links(
        &self,
        ctrl: &ControllerEntry,
        element_type: &str,
        target: &mut Map<String, Value>,
        source: &Value,
    ) {
        let Some(set) = self.entity_set_of(ctrl) else {
            return;
        };
        let Value::Object(src) = source else {
            return;
        };
        let types = self.types();
        let Some(ty) = tagged_type(types, src).or_else(|| types.get(element_type)) else {
            return;
        };
        if ty.keys.is_empty() {
            return;
        }
        let literal = |k: &String| edm::escape(src.get(k), ty.property(k).map(|p| p.type_name.as_str()));
        let id = if ty.keys.len() == 1 {
            literal(&ty.keys[0])
        } else {
            ty.keys
                .iter()
                .map(|k| literal(k).map(|v| format!("{}={}", k, v)))
                .collect::<Result<Vec<_>, _>>()
                .map(|parts| parts.join(","))
        };
        let Ok(id) = id else {
            return;
        };

        let link = format!("{}/{}({})", self.scope.root, set, id);
        target.insert("@odata.id".into(), Value::String(link.clone()));
        if ty.media {
            target.insert("@odata.mediaReadLink".into(), Value::String(format!("{}/$value", link)));
            if let Some(ct) = &ty.media_content_type {
                target.insert("@odata.mediaContentType".into(), Value::String(ct.clone()));
            }
        }
        if ctrl.find(Verb::Put, None, &ty.keys).is_some() || ctrl.find(Verb::Patch, None, &ty.keys).is_some() {
            target.insert("@odata.editLink".into(), Value::String(link));
        }
    }

    /// Convert `source` into `target` per its type. Untyped values are shallow-merged.
    pub fn convert_entity<'b>(
        &'b self,
        mut target: Map<String, Value>,
        source: &'b Value,
        element_type: Option<&'b str>,
        contextual: Option<&'b str>,
        includes: &'b Includes,
    ) -> BoxFuture<'b, Result<Map<String, Value>, ODataError>> {
        async move {
            let Value::Object(src) = source else {
                return Err(ODataError::Json("entity is not an object".into()));
            };
            let types = self.types();
            let declared = element_type.and_then(|t| types.get(t));
            let Some(declared) = declared.filter(|_| !self.scope.service.options.disable_entity_conversion) else {
                for (k, v) in src {
                    target.insert(k.clone(), v.clone());
                }
                return Ok(target);
            };

            let ty = tagged_type(types, src).unwrap_or(declared);
            let differs = contextual
                .map(|c| types.get(c).map(|ct| ct.name != ty.name).unwrap_or(true))
                .unwrap_or(false);
            if ty.is_entity() && differs {
                target.insert(ODATA_TYPE.into(), Value::String(ty.qualified_name()));
            }

            let mut props: Vec<(&str, Option<&PropertyInfo>)> =
                ty.properties.iter().map(|p| (p.name.as_str(), Some(p))).collect();
            if ty.open {
                props.extend(
                    src.keys()
                        .filter(|k| !k.starts_with("@odata.") && ty.property(k).is_none())
                        .map(|k| (k.as_str(), None)),
                );
            }

            let id = target.get("@odata.id").and_then(Value::as_str).map(str::to_string);
            let outputs = join_all(
                props
                    .iter()
                    .map(|(name, prop)| self.convert_property(ty, name, *prop, src, includes, id.as_deref())),
            )
            .await;
            for (k, v) in outputs.into_iter().flatten() {
                target.insert(k, v);
            }
            Ok(target)
        }
        .boxed()
    }

    async fn convert_property(
        &self,
        ty: &TypeInfo,
        name: &str,
        prop: Option<&PropertyInfo>,
        src: &Map<String, Value>,
        includes: &Includes,
        id: Option<&str>,
    ) -> Vec<(String, Value)> {
        let value = src.get(name);
        let Some(prop) = prop else {
            return value.map(|v| vec![(name.to_string(), v.clone())]).unwrap_or_default();
        };
        if let Some(include) = includes.get(name) {
            return self.resolve_include(include, name, src, &ty.name).await;
        }

        let types = self.types();
        let related = types.related_type(&ty.name, name).filter(|t| types.get(t).is_some());
        let nested = Includes::new();
        if let Some(v) = value.filter(|v| !v.is_null()) {
            if types.is_collection(&ty.name, name) {
                let items = match v {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let converted = if let Some(rt) = related {
                    join_all(items.iter().map(|it| self.convert_nested(it, rt, &nested))).await
                } else if let Some(conv) = &prop.converter {
                    items.iter().map(|it| conv(it)).collect()
                } else {
                    items
                };
                return vec![(name.to_string(), Value::Array(converted))];
            }
            if let Some(rt) = related {
                return vec![(name.to_string(), self.convert_nested(v, rt, &nested).await)];
            }
        }
        if let Some(conv) = &prop.converter {
            return value.map(|v| vec![(name.to_string(), conv(v))]).unwrap_or_default();
        }
        if prop.is_stream() {
            let mut out = Vec::new();
            if let Some(id) = id {
                out.push((format!("{}@odata.mediaReadLink", name), Value::String(format!("{}/{}", id, name))));
            }
            let content_type = prop
                .content_type
                .clone()
                .or_else(|| value.and_then(|v| v.get("contentType")).and_then(Value::as_str).map(str::to_string));
            if let Some(ct) = content_type {
                out.push((format!("{}@odata.mediaContentType", name), Value::String(ct)));
            }
            return out;
        }
        value.map(|v| vec![(name.to_string(), v.clone())]).unwrap_or_default()
    }

    async fn convert_nested(&self, item: &Value, type_name: &str, includes: &Includes) -> Value {
        if !item.is_object() {
            return item.clone();
        }
        match self
            .convert_entity(Map::new(), item, Some(type_name), Some(type_name), includes)
            .await
        {
            Ok(m) => Value::Object(m),
            Err(_) => item.clone(),
        }
    }

    /// `<property>@odata.context` and `<property>` for an expansion; failures omit the property.
    async fn resolve_include(
        &self,
        include: &Include,
        name: &str,
        src: &Map<String, Value>,
        element_type: &str,
    ) -> Vec<(String, Value)> {
        match self.include_value(include, name, src, element_type).await {
            Ok(Some((context, value))) => vec![
                (format!("{}@odata.context", name), Value::String(context)),
                (name.to_string(), value),
            ],
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(property = %name, error = %e, "include failed, property omitted");
                Vec::new()
            }
        }
    }

    async fn include_value(
        &self,
        include: &Include,
        name: &str,
        src: &Map<String, Value>,
        element_type: &str,
    ) -> Result<Option<(String, Value)>, ODataError> {
        let types = self.types();
        let controllers = &self.scope.service.controllers;
        let nav = include.navigation_property.as_str();
        let collection = types.is_collection(element_type, nav);
        let nav_type = types
            .related_type(element_type, nav)
            .ok_or(ODataError::ResourceNotFound)?
            .to_string();
        let nav_ctrl = controllers.for_type(&nav_type);

        let mut result = match src.get(name) {
            Some(Value::Null) => return Ok(None),
            Some(v @ (Value::Object(_) | Value::Array(_))) => {
                let mut r = ODataResult::ok(v.clone()).await?;
                Annotator::new(self.scope, self.context, nav_ctrl.as_ref())
                    .append_context(&mut r, Some(&nav_type), &include.includes)
                    .await?;
                r
            }
            _ => {
                let parent_ctrl = controllers.for_type(element_type);
                let source = Value::Object(src.clone());
                resolver::read_include(
                    self.scope,
                    self.context,
                    resolver::IncludeRead {
                        include,
                        parent: parent_ctrl.as_ref(),
                        source: &source,
                        element_type,
                        nav_type: &nav_type,
                        collection,
                    },
                )
                .await?
            }
        };

        let Some(Value::Object(mut body)) = result.body.take() else {
            return Ok(None);
        };
        body.remove(ODATA_CONTEXT);
        let set = nav_ctrl.as_ref().and_then(|c| controllers.entity_set_of(c));
        let root = &self.scope.root;
        if collection && matches!(body.get("value"), Some(Value::Array(_))) {
            let context = match set {
                Some(s) => format!("{}/$metadata#{}", root, s),
                None => format!("{}/{}", self.context, nav),
            };
            return Ok(body.remove("value").map(|v| (context, v)));
        }
        if body.is_empty() {
            return Ok(None);
        }
        let context = match set {
            Some(s) => format!("{}/$metadata#{}/$entity", root, s),
            None => format!("{}/{}", self.context, nav),
        };
        Ok(Some((context, Value::Object(body))))
    }
}

fn result_has_context(body: &Value) -> bool {
    body.get(ODATA_CONTEXT).is_some()
}

/// Type named by the source's `@odata.type` tag, if it is a known type.
fn tagged_type<'t>(types: &'t TypeRegistry, src: &Map<String, Value>) -> Option<&'t TypeInfo> {
    src.get(ODATA_TYPE).and_then(Value::as_str).and_then(|tag| types.get(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::{fixture_scope, fixture_scope_with, CONTEXT};
    use crate::config::ProcessorOptions;
    use crate::result::Payload;
    use serde_json::json;

    async fn annotate(body: Payload, declared: &str) -> ODataResult {
        let scope = fixture_scope();
        let mut r = ODataResult::ok(body).await.unwrap();
        let current = scope.service.controllers.for_type(declared);
        Annotator::new(&scope, CONTEXT, current.as_ref())
            .append_context(&mut r, Some(declared), &Includes::new())
            .await
            .unwrap();
        r
    }

    #[tokio::test]
    async fn collection_keeps_count_and_order() {
        let items = vec![json!({"Id": 3, "Name": "c"}), json!({"Id": 1, "Name": "a"}), json!({"Id": 2, "Name": "b"})];
        let r = annotate(Payload::counted(items, 42), "Product").await;
        let body = r.body.unwrap();
        assert_eq!(body["@odata.count"], json!(42));
        assert_eq!(body["@odata.context"], json!(CONTEXT));
        let ids: Vec<_> = body["value"].as_array().unwrap().iter().map(|v| v["Id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(1), json!(2)]);
        assert_eq!(body["value"][0]["@odata.id"], json!("http://localhost/Products(3)"));
        assert_eq!(body["value"][0]["@odata.editLink"], json!("http://localhost/Products(3)"));
    }

    #[tokio::test]
    async fn items_keep_input_order_when_expansions_finish_in_reverse() {
        let scope = fixture_scope();
        // The fixture's Category read sleeps longer for lower product ids.
        let items = json!([
            {"Id": 1, "Name": "a", "CategoryId": 1},
            {"Id": 2, "Name": "b", "CategoryId": 1},
            {"Id": 3, "Name": "c", "CategoryId": 2}
        ]);
        let mut r = ODataResult::ok(items).await.unwrap();
        let mut includes = Includes::new();
        includes.insert("Category".into(), Include::new("Category"));
        let current = scope.service.controllers.for_type("Product");
        Annotator::new(&scope, CONTEXT, current.as_ref())
            .append_context(&mut r, Some("Product"), &includes)
            .await
            .unwrap();
        let body = r.body.unwrap();
        let rows = body["value"].as_array().unwrap();
        let ids: Vec<_> = rows.iter().map(|v| v["Id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
        let categories: Vec<_> = rows.iter().map(|v| v["Category"]["Name"].clone()).collect();
        assert_eq!(categories, vec![json!("Fruit"), json!("Fruit"), json!("Veg")]);
    }

    #[tokio::test]
    async fn second_annotation_is_a_no_op() {
        let scope = fixture_scope();
        let mut r = ODataResult::ok(json!({"Id": 1, "Name": "a"})).await.unwrap();
        let current = scope.service.controllers.for_type("Product");
        let annotator = Annotator::new(&scope, CONTEXT, current.as_ref());
        annotator.append_context(&mut r, Some("Product"), &Includes::new()).await.unwrap();
        let once = r.body.clone();
        annotator.append_context(&mut r, Some("Product"), &Includes::new()).await.unwrap();
        assert_eq!(r.body, once);
    }

    #[tokio::test]
    async fn links_are_skipped_when_key_is_missing() {
        let r = annotate(Payload::Value(json!({"Name": "no key"})), "Product").await;
        let body = r.body.unwrap();
        assert!(body.get("@odata.id").is_none());
        assert_eq!(body["Name"], json!("no key"));
    }

    #[tokio::test]
    async fn derived_type_tag_and_converters() {
        let r = annotate(
            Payload::Value(json!({"@odata.type": "#Demo.SpecialProduct", "Id": 5, "Name": "x", "Discount": 0.5, "Tags": ["a"]})),
            "Product",
        )
        .await;
        let body = r.body.unwrap();
        assert_eq!(body["@odata.type"], json!("Demo.SpecialProduct"));
        assert_eq!(body["Discount"], json!(0.5));
        assert_eq!(body["Name"], json!("X"));
    }

    #[tokio::test]
    async fn primitive_body_is_wrapped_and_stream_links_written() {
        let r = annotate(Payload::Value(json!(0)), "Product").await;
        assert_eq!(r.body.unwrap()["value"], json!(0));

        let r = annotate(Payload::Value(json!({"Id": 9, "Data": null})), "Image").await;
        let body = r.body.unwrap();
        assert_eq!(body["@odata.mediaReadLink"], json!("http://localhost/Images(9)/$value"));
        assert_eq!(body["Data@odata.mediaReadLink"], json!("http://localhost/Images(9)/Data"));
        assert_eq!(body["Data@odata.mediaContentType"], json!("image/png"));
        assert!(body.get("Data").is_none());
    }

    #[tokio::test]
    async fn open_type_copies_undeclared_properties() {
        let r = annotate(Payload::Value(json!({"Id": 1, "Color": "red"})), "Category").await;
        assert_eq!(r.body.unwrap()["Color"], json!("red"));
    }

    #[tokio::test]
    async fn disabled_conversion_shallow_merges() {
        let options = ProcessorOptions {
            disable_entity_conversion: true,
            ..Default::default()
        };
        let scope = fixture_scope_with(options);
        let mut r = ODataResult::ok(json!({"Id": 1, "Name": "raw"})).await.unwrap();
        Annotator::new(&scope, CONTEXT, None)
            .append_context(&mut r, Some("Product"), &Includes::new())
            .await
            .unwrap();
        assert_eq!(r.body.unwrap()["Name"], json!("raw"));
    }
}
