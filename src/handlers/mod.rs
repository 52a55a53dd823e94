//! HTTP handlers.

pub mod odata;
pub use odata::*;
