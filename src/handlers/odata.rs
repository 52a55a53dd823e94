//! Catch-all handler: one HTTP request, one pipeline run.

use crate::error::ODataError;
use crate::processor::{ODataRequest, Processor, RequestContext};
use crate::response;
use crate::result::ODataResult;
use crate::state::ODataState;
use axum::{
    extract::State,
    http::{header, HeaderMap, Method, Uri},
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};

fn parse_body(body: &Bytes) -> Result<Option<Value>, ODataError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext {
        host: headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    }
}

fn joined(outcome: Result<Result<ODataResult, ODataError>, JoinError>) -> Result<ODataResult, ODataError> {
    outcome.map_err(|e| ODataError::operation(500, format!("pipeline task failed: {}", e)))?
}

/// Failures after the first streamed chunk can only be logged.
fn watch(task: JoinHandle<Result<ODataResult, ODataError>>) {
    tokio::spawn(async move {
        if let Err(e) = joined(task.await) {
            tracing::error!(error = %e, "pipeline failed after streaming started");
        }
    });
}

/// Runs the pipeline and answers with its stream if it wrote one, else with the rendered result.
pub async fn dispatch(
    State(state): State<ODataState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ODataError> {
    let body = parse_body(&body)?;
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let path = state.parser.parse(&url)?;
    let request = ODataRequest::new(method.as_str(), url).with_context(request_context(&headers));
    tracing::debug!(method = %request.method, url = %request.url, "odata request");

    let mut processor = Processor::new(state.service.clone(), request, path)?;
    let mut output = processor
        .take_stream()
        .ok_or_else(|| ODataError::operation(500, "output stream already taken"))?;
    let mut task = tokio::spawn(processor.execute(body));

    tokio::select! {
        chunk = output.next_chunk() => match chunk {
            Some(first) => {
                watch(task);
                Ok(response::streamed(first, output))
            }
            None => joined(task.await).map(response::render),
        },
        outcome = &mut task => {
            let result = joined(outcome)?;
            match output.try_next_chunk() {
                Some(first) => Ok(response::streamed(first, output)),
                None => Ok(response::render(result)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::fixture_service;
    use crate::resource::{Part, PartKind, QueryOptions, ResourcePath, ResourcePathParser};
    use crate::routes::odata_routes;
    use crate::state::ODataState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// `/<Set>[(<int>)][/$count]` with an optional query string.
    struct SimpleParser;

    impl ResourcePathParser for SimpleParser {
        fn parse(&self, url: &str) -> Result<ResourcePath, ODataError> {
            let (path, query) = url.split_once('?').unwrap_or((url, ""));
            let mut parts = Vec::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                if segment == "$count" {
                    parts.push(Part::new(PartKind::Count, segment));
                    continue;
                }
                let part = match segment.split_once('(') {
                    Some((set, key)) => {
                        let key: i64 = key
                            .trim_end_matches(')')
                            .parse()
                            .map_err(|_| ODataError::BadRequest(segment.to_string()))?;
                        Part::entity_set(set).with_key("Id", json!(key))
                    }
                    None => Part::entity_set(segment),
                };
                parts.push(part);
            }
            Ok(ResourcePath::new(parts).with_query(QueryOptions::parse(query)?))
        }
    }

    fn app() -> axum::Router {
        odata_routes(ODataState::new(fixture_service(), Arc::new(SimpleParser)))
    }

    async fn send(method: &str, uri: &str, body: &str) -> (StatusCode, String, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "shop.test")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn streams_collections_with_host_links() {
        let (status, content_type, body) = send("GET", "/Products", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "application/json");
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["@odata.context"], json!("http://shop.test/$metadata#Products"));
        assert_eq!(doc["value"].as_array().unwrap().len(), 3);
        assert_eq!(doc["value"][0]["@odata.id"], json!("http://shop.test/Products(1)"));
    }

    #[tokio::test]
    async fn renders_single_entities_and_counts() {
        let (status, _, body) = send("GET", "/Products(2)", "").await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["Name"], json!("PEAR"));

        let (status, content_type, body) = send("GET", "/Products/$count", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/plain");
        assert_eq!(body, "3");
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (status, _, body) = send("GET", "/Products(42)", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["error"]["code"], json!("not_found"));

        let (status, _, _) = send("OPTIONS", "/Products", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _, _) = send("POST", "/Products", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn writes_answer_created() {
        let (status, _, body) = send("POST", "/Products", r#"{"Name": "fig", "CategoryId": 2}"#).await;
        assert_eq!(status, StatusCode::CREATED);
        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["@odata.context"], json!("http://shop.test/$metadata#Products/$entity"));
        assert_eq!(doc["Id"], json!(4));
    }
}
