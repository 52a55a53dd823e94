//! OData-style request resolution: resource paths are walked part by part against
//! application controllers, and the results are annotated and streamed as JSON.

pub mod config;
pub mod edm;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod resource;
pub mod response;
pub mod result;
pub mod routes;
pub mod service;
pub mod state;

pub use config::{load_from_path, resolve, ConverterTable, ModelConfig, ProcessorOptions, TypeRegistry};
pub use error::{ConfigError, ODataError};
pub use processor::{ODataRequest, ODataStream, Processor, RequestContext};
pub use resource::{Include, KeyValue, Part, PartKind, QueryOptions, ResourcePath, ResourcePathParser};
pub use response::{render, streamed};
pub use result::{ODataResult, Payload, Verb};
pub use routes::odata_routes;
pub use service::{ControllerEntry, ControllerRegistry, ODataService};
pub use state::ODataState;
