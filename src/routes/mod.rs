mod api;
mod common;

pub use api::api_routes;
pub use common::common_routes;

use crate::state::AppState;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

/// Request bodies are never read; anything larger than this is refused.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// The full application router.
pub fn app(state: AppState) -> Router {
    common_routes(state.clone())
        .merge(api_routes(state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
