//! API routes: `/` and every `/{action}/...` path go to one dispatcher.

use crate::handlers::dispatch;
use crate::state::AppState;
use axum::{routing::any, Router};

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/", any(dispatch))
        .fallback(dispatch)
        .with_state(state)
}
