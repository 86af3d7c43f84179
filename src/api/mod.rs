//! API layer -- axum routes, handlers, and middleware.

mod response;
mod routes;
pub mod state;

use self::response::ApiError;
use self::state::AppState;
use crate::error::CoreError;
use axum::http::Uri;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback(uri: Uri) -> ApiError {
    ApiError(CoreError::not_found("route", uri.path()))
}
