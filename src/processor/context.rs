//! `@odata.context` URL of a request, computed once from the whole resource path.

use crate::resource::{PartKind, ResourcePath};
use crate::service::{ODataService, ReturnType};

/// `<root>/$metadata#<fragment>`; `$select` decorates the terminal segment.
pub(crate) fn build_context(service: &ODataService, path: &ResourcePath, root: &str, select: Option<&str>) -> String {
    let types = &service.types;
    let controllers = &service.controllers;
    let select = select.map(|s| format!("({})", s)).unwrap_or_default();
    let last = path.parts.len().saturating_sub(1);

    let mut fragment = String::new();
    // Element type of the previous segment; `None` is the service root.
    let mut prev_type: Option<String> = None;

    for (i, part) in path.parts.iter().enumerate() {
        if path.parts.get(i + 1).map(|n| n.kind == PartKind::Ref).unwrap_or(false) {
            continue;
        }
        let sel = if i == last { select.as_str() } else { "" };
        let keys = || part.key.iter().map(|k| k.raw.as_str()).collect::<Vec<_>>().join(",");
        match part.kind {
            PartKind::EntitySet => {
                prev_type = controllers.for_entity_set(&part.name).map(|c| c.element_type.clone());
                fragment.push_str(&part.name);
                fragment.push_str(sel);
                if part.has_key() {
                    if i == last {
                        fragment.push_str("/$entity");
                    } else {
                        fragment.push_str(&format!("({})", keys()));
                    }
                }
            }
            PartKind::EntityCollectionNavigation => {
                prev_type = prev_type
                    .as_deref()
                    .and_then(|t| types.related_type(t, &part.name))
                    .map(str::to_string);
                fragment.push('/');
                fragment.push_str(&part.name);
                if let Some(set) = prev_type.as_deref().and_then(|t| set_for_type(service, t)) {
                    fragment = set.to_string();
                }
                fragment.push_str(sel);
                if part.has_key() {
                    if i == last {
                        fragment.push_str("/$entity");
                    } else {
                        fragment.push_str(&format!("({})", keys()));
                    }
                }
            }
            PartKind::EntityNavigation => {
                prev_type = prev_type
                    .as_deref()
                    .and_then(|t| types.related_type(t, &part.name))
                    .map(str::to_string);
                match prev_type.as_deref().and_then(|t| set_for_type(service, t)) {
                    Some(set) => fragment = format!("{}{}/$entity", set, sel),
                    None => {
                        fragment.push('/');
                        fragment.push_str(&part.name);
                    }
                }
            }
            PartKind::PrimitiveProperty
            | PartKind::PrimitiveCollectionProperty
            | PartKind::ComplexProperty
            | PartKind::ComplexCollectionProperty => {
                prev_type = prev_type
                    .as_deref()
                    .and_then(|t| types.related_type(t, &part.name))
                    .map(str::to_string);
                fragment.push('/');
                fragment.push_str(&part.name);
            }
            PartKind::FunctionImport | PartKind::ActionImport | PartKind::BoundFunction | PartKind::BoundAction => {
                fragment.clear();
                let name = part.name.rsplit('.').next().unwrap_or(&part.name);
                let returns = if matches!(part.kind, PartKind::BoundFunction | PartKind::BoundAction) {
                    prev_type
                        .as_deref()
                        .and_then(|t| controllers.for_type(t))
                        .and_then(|c| c.find_bound(name, None).and_then(|op| op.returns.clone()))
                } else {
                    controllers
                        .root()
                        .and_then(|c| c.find_import(name).and_then(|op| op.returns.clone()))
                };
                let Some(returns) = returns else { continue };
                if types.get(&returns.type_name).is_some() {
                    prev_type = Some(returns.type_name.clone());
                    match set_for_type(service, &returns.type_name) {
                        Some(set) if returns.collection => fragment = format!("{}{}", set, sel),
                        Some(set) => fragment = format!("{}{}/$entity", set, sel),
                        None => fragment = return_type_name(service, &returns),
                    }
                } else {
                    fragment = return_type_name(service, &returns);
                }
            }
            PartKind::Count | PartKind::Value | PartKind::Ref => {}
        }
    }
    format!("{}/$metadata#{}", root, fragment)
}

fn set_for_type<'a>(service: &'a ODataService, type_name: &str) -> Option<&'a str> {
    let ctrl = service.controllers.for_type(type_name)?;
    service.controllers.entity_set_of(&ctrl)
}

fn return_type_name(service: &ODataService, returns: &ReturnType) -> String {
    let name = if service.types.get(&returns.type_name).is_some() {
        service.types.qualified_name(&returns.type_name)
    } else {
        returns.type_name.clone()
    };
    if returns.collection {
        format!("Collection({})", name)
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::fixture_service;
    use crate::resource::{Part, QueryOptions};
    use serde_json::json;

    const ROOT: &str = "http://localhost";

    fn context(path: ResourcePath) -> String {
        let service = fixture_service();
        let select = path.query.select().map(str::to_string);
        build_context(&service, &path, ROOT, select.as_deref())
    }

    #[test]
    fn entity_set_and_keyed_entity() {
        assert_eq!(
            context(ResourcePath::new(vec![Part::entity_set("Products")])),
            "http://localhost/$metadata#Products"
        );
        assert_eq!(
            context(ResourcePath::new(vec![Part::entity_set("Products").with_key("Id", json!(1))])),
            "http://localhost/$metadata#Products/$entity"
        );
    }

    #[test]
    fn navigation_switches_to_target_set() {
        let path = ResourcePath::new(vec![
            Part::entity_set("Categories").with_key("Id", json!(1)),
            Part::new(PartKind::EntityCollectionNavigation, "Products"),
        ]);
        assert_eq!(context(path), "http://localhost/$metadata#Products");

        let path = ResourcePath::new(vec![
            Part::entity_set("Products").with_key("Id", json!(1)),
            Part::new(PartKind::EntityNavigation, "Category"),
        ]);
        assert_eq!(context(path), "http://localhost/$metadata#Categories/$entity");
    }

    #[test]
    fn select_and_property_segments() {
        let path = ResourcePath::new(vec![Part::entity_set("Products")])
            .with_query(QueryOptions::new(vec![("$select".into(), "Name".into())]));
        assert_eq!(context(path), "http://localhost/$metadata#Products(Name)");

        let path = ResourcePath::new(vec![
            Part::entity_set("Products").with_key("Id", json!(1)),
            Part::new(PartKind::PrimitiveProperty, "Name"),
        ]);
        assert_eq!(context(path), "http://localhost/$metadata#Products(1)/Name");
    }

    #[test]
    fn ref_consumes_navigation_and_imports_reset_fragment() {
        let path = ResourcePath::new(vec![
            Part::entity_set("Categories").with_key("Id", json!(1)),
            Part::new(PartKind::EntityCollectionNavigation, "Products"),
            Part::new(PartKind::Ref, "$ref"),
        ]);
        assert_eq!(context(path), "http://localhost/$metadata#Categories(1)");

        let path = ResourcePath::new(vec![Part::new(PartKind::FunctionImport, "TopProducts")]);
        assert_eq!(context(path), "http://localhost/$metadata#Products");
    }
}
