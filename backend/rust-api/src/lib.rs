use axum::{
    http::{header, Method},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1", api_routes(app_state.clone()))
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn api_routes(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/submissions",
            get(handlers::submissions::list_submissions)
                .post(handlers::submissions::grade_submission),
        )
        .route(
            "/submissions/{id}",
            delete(handlers::submissions::delete_submission),
        )
        .route(
            "/submissions/exercise/{exercise}",
            delete(handlers::submissions::reset_exercise),
        )
        .route("/playground", get(handlers::playground::get_playground))
        .route(
            "/playground/exercise",
            put(handlers::playground::select_exercise),
        )
        .route(
            "/playground/buffer",
            put(handlers::playground::update_buffer),
        )
        .route("/playground/submit", post(handlers::playground::submit))
        .route(
            "/playground/submission",
            delete(handlers::playground::reset),
        )
        .route(
            "/completion",
            post(handlers::completion::stream_completion),
        )
        .route_layer(middleware::from_fn_with_state(
            app_state,
            middlewares::auth::auth_middleware,
        ))
        // Added after route_layer, so it stays public
        .route("/exercises", get(handlers::submissions::list_exercises))
}
