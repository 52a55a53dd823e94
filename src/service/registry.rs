//! Entity set and element type lookup of registered controllers.

use crate::service::controller::ControllerEntry;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ControllerRegistry {
    /// (entity set, controller) in registration order.
    entity_sets: Vec<(String, Arc<ControllerEntry>)>,
    /// Non-public controllers, reachable only by element type.
    hidden: Vec<Arc<ControllerEntry>>,
    /// Controller that owns unbound function and action imports.
    service_root: Option<Arc<ControllerEntry>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `entry` under the entity set `name`.
    pub fn entity_set(mut self, name: impl Into<String>, entry: ControllerEntry) -> Self {
        self.entity_sets.push((name.into(), Arc::new(entry)));
        self
    }

    /// Register a controller that has no entity set of its own.
    pub fn controller(mut self, entry: ControllerEntry) -> Self {
        self.hidden.push(Arc::new(entry));
        self
    }

    pub fn service_root(mut self, entry: ControllerEntry) -> Self {
        self.service_root = Some(Arc::new(entry));
        self
    }

    pub fn for_entity_set(&self, name: &str) -> Option<Arc<ControllerEntry>> {
        self.entity_sets
            .iter()
            .find(|(set, _)| set == name)
            .map(|(_, c)| c.clone())
    }

    /// First controller serving the element type; published sets win over hidden controllers.
    pub fn for_type(&self, type_name: &str) -> Option<Arc<ControllerEntry>> {
        let bare = type_name.rsplit('.').next().unwrap_or(type_name);
        self.entity_sets
            .iter()
            .map(|(_, c)| c)
            .chain(self.hidden.iter())
            .find(|c| c.element_type == type_name || c.element_type == bare)
            .cloned()
    }

    /// Entity set a controller is published under.
    pub fn entity_set_of(&self, entry: &ControllerEntry) -> Option<&str> {
        self.entity_sets
            .iter()
            .find(|(_, c)| c.same_as(entry))
            .map(|(set, _)| set.as_str())
    }

    pub fn root(&self) -> Option<Arc<ControllerEntry>> {
        self.service_root.clone()
    }

    pub fn entity_sets(&self) -> impl Iterator<Item = (&str, &Arc<ControllerEntry>)> {
        self.entity_sets.iter().map(|(s, c)| (s.as_str(), c))
    }
}
