//! Service bundle: type model, controllers, reserved operations and runtime options.

mod controller;
mod registry;

pub use controller::{
    Binding, Controller, ControllerEntry, ControllerFactory, CooperativeOperation, Instruction, KeyBinding,
    MediaEntity, OperationArgs, OperationDescriptor, OperationKind, OperationOutput, ParameterRoles, Resume,
    ReturnType, Route,
};
pub use registry::ControllerRegistry;

use crate::config::{ProcessorOptions, TypeRegistry};
use crate::error::ConfigError;
use crate::processor::reserved::{ReservedOperation, ReservedRegistry};
use crate::resource::ResourcePathParser;
use std::sync::Arc;

pub struct ODataService {
    pub types: TypeRegistry,
    pub controllers: ControllerRegistry,
    pub reserved: ReservedRegistry,
    pub options: ProcessorOptions,
    /// Used to resolve `$ref` link URLs; without it the navigation segment's key is used.
    pub parser: Option<Arc<dyn ResourcePathParser>>,
}

impl ODataService {
    /// Check that every published entity set is declared in the model with the controller's type.
    pub fn new(types: TypeRegistry, controllers: ControllerRegistry) -> Result<Self, ConfigError> {
        for (set, entry) in controllers.entity_sets() {
            if types.get(&entry.element_type).is_none() {
                return Err(ConfigError::MissingReference {
                    kind: "entity type",
                    id: entry.element_type.clone(),
                });
            }
            if !types.entity_sets.is_empty() {
                match types.entity_set_type(set) {
                    Some(t) if t == entry.element_type => {}
                    _ => {
                        return Err(ConfigError::MissingReference {
                            kind: "entity set",
                            id: set.to_string(),
                        })
                    }
                }
            }
        }
        tracing::debug!(
            entity_sets = controllers.entity_sets().count(),
            types = types.types.len(),
            "odata service assembled"
        );
        Ok(ODataService {
            types,
            controllers,
            reserved: ReservedRegistry::default(),
            options: ProcessorOptions::default(),
            parser: None,
        })
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ResourcePathParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Register or replace a reserved operation.
    pub fn with_reserved(mut self, op: Arc<dyn ReservedOperation>) -> Self {
        self.reserved.register(op);
        self
    }
}
