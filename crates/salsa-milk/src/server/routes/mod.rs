//! Routes for the upload server

pub mod index;
pub mod tasks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::convert::Infallible;
use tower_http::limit::RequestBodyLimitLayer;

use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Uploads are bounded twice: by declared length up front and by bytes read
        .route(
            "/process",
            post(tasks::api_process)
                .layer::<_, Infallible>(DefaultBodyLimit::max(max_upload_size))
                .layer::<_, Infallible>(RequestBodyLimitLayer::new(max_upload_size)),
        )
        .route("/progress/:id", get(tasks::api_progress))
        .route("/download/:id", get(tasks::api_download))
}
