//! HTTP surface over a [`Sandbox`].

mod error;
mod handlers;

pub use error::{status_for, ApiError};

use crate::sandbox::Sandbox;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub sandbox: Arc<Sandbox>,
}

pub fn router(sandbox: Arc<Sandbox>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/execute", post(handlers::execute))
        .route("/execute/stream", post(handlers::execute_stream))
        .route("/validate", post(handlers::validate))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/:id",
            get(handlers::get_session)
                .patch(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route(
            "/sessions/:id/variables",
            get(handlers::get_variables)
                .put(handlers::put_variables)
                .delete(handlers::delete_variables),
        )
        .route("/sessions/:id/files", get(handlers::list_files))
        .route(
            "/sessions/:id/files/*path",
            get(handlers::read_file)
                .put(handlers::write_file)
                .delete(handlers::delete_file),
        )
        .route("/sessions/:id/metrics", get(handlers::session_metrics))
        .route("/packages/install", post(handlers::install_packages))
        .route("/packages/uninstall", post(handlers::uninstall_packages))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { sandbox })
}

#[cfg(test)]
mod tests;
