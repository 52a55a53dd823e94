//! Shared state of the HTTP adapter: the service and the parser that turns URLs into resource paths.

use crate::resource::ResourcePathParser;
use crate::service::ODataService;
use std::sync::Arc;

#[derive(Clone)]
pub struct ODataState {
    pub service: Arc<ODataService>,
    pub parser: Arc<dyn ResourcePathParser>,
}

impl ODataState {
    pub fn new(service: Arc<ODataService>, parser: Arc<dyn ResourcePathParser>) -> Self {
        ODataState { service, parser }
    }
}
