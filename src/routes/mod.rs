//! Router builders.

use crate::handlers::dispatch;
use crate::state::ODataState;
use axum::Router;

/// Every path not matched by an earlier route goes through the pipeline.
pub fn odata_routes(state: ODataState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}
