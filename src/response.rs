//! Rendering of pipeline results and streamed output as HTTP responses.

use crate::processor::ODataStream;
use crate::result::{ODataResult, JSON, TEXT};
use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::convert::Infallible;

/// Body as JSON, or as its raw text for `text/plain`; no body renders as an empty response.
pub fn render(result: ODataResult) -> Response {
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
    let Some(body) = result.body else {
        let mut response = status.into_response();
        if let Some(ct) = result.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
            response.headers_mut().insert(header::CONTENT_TYPE, ct);
        }
        return response;
    };
    let content_type = result.content_type.unwrap_or_else(|| JSON.to_string());
    let bytes = if content_type.starts_with(TEXT) {
        match body {
            Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        }
    } else {
        match serde_json::to_vec(&body) {
            Ok(bytes) => bytes,
            Err(e) => return crate::error::ODataError::from(e).into_response(),
        }
    };
    with_content_type(status, &content_type, Body::from(bytes))
}

/// Streaming body: `first` followed by whatever the transform still produces.
pub fn streamed(first: Bytes, rest: ODataStream) -> Response {
    let content_type = rest.content_type();
    let chunks = stream::once(async move { first })
        .chain(rest.into_stream())
        .map(Ok::<_, Infallible>);
    with_content_type(StatusCode::OK, &content_type, Body::from_stream(chunks))
}

fn with_content_type(status: StatusCode, content_type: &str, body: Body) -> Response {
    let mut response = (status, body).into_response();
    let value = HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static(JSON));
    response.headers_mut().insert(header::CONTENT_TYPE, value);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn plain_text_bodies_are_written_raw() {
        let response = render(ODataResult::new(200, Some(TEXT), Some(json!(3))));
        assert_eq!(response.headers()[header::CONTENT_TYPE], TEXT);
        assert_eq!(text(response).await, "3");

        let response = render(ODataResult::new(200, Some(TEXT), Some(json!("pear"))));
        assert_eq!(text(response).await, "pear");
    }

    #[tokio::test]
    async fn json_bodies_and_empty_results() {
        let response = render(ODataResult::new(201, None, Some(json!({"Id": 1}))));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], JSON);
        assert_eq!(text(response).await, r#"{"Id":1}"#);

        let response = render(ODataResult::new(204, None, None));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(text(response).await.is_empty());
    }
}
