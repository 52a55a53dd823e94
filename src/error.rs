//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid key: type {type_name} property {property}")]
    InvalidKey { type_name: String, property: String },
    #[error("duplicate entity set: {0}")]
    DuplicateEntitySet(String),
    #[error("base type cycle at {0}")]
    BaseTypeCycle(String),
    #[error("unknown converter '{converter}' on {type_name}.{property}")]
    UnknownConverter {
        type_name: String,
        property: String,
        converter: String,
    },
    #[error("config load: {0}")]
    Load(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ODataError {
    #[error("resource not found")]
    ResourceNotFound,
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A value could not be written as a key literal.
    #[error("literal: {0}")]
    Literal(String),
    /// Raised by a controller operation; carries its own status.
    #[error("{message}")]
    Operation { status: u16, message: String },
    #[error("json: {0}")]
    Json(String),
}

impl ODataError {
    pub fn operation(status: u16, message: impl Into<String>) -> Self {
        ODataError::Operation {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ODataError::ResourceNotFound => StatusCode::NOT_FOUND,
            ODataError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ODataError::BadRequest(_) | ODataError::Literal(_) | ODataError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            ODataError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ODataError::Operation { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ODataError::ResourceNotFound => "not_found",
            ODataError::MethodNotAllowed(_) => "method_not_allowed",
            ODataError::BadRequest(_) => "bad_request",
            ODataError::Config(_) => "config_error",
            ODataError::Literal(_) => "invalid_literal",
            ODataError::Operation { .. } => "operation_error",
            ODataError::Json(_) => "invalid_json",
        }
    }
}

impl From<serde_json::Error> for ODataError {
    fn from(e: serde_json::Error) -> Self {
        ODataError::Json(e.to_string())
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ODataError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
