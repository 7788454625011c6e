// audio-merger ライブラリ
// テストから各モジュールにアクセスできるようにするため

pub mod audio;
pub mod config;
pub mod download;
pub mod handlers;
pub mod models;
pub mod workspace;

use crate::handlers::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn create_app(app_state: AppState) -> Router {
    // 全オリジンを許可（プリフライトも CorsLayer が応答する）
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = app_state.config.max_request_size_bytes();

    Router::new()
        .route("/", get(handlers::health_check))
        .route("/merge", post(handlers::merge_audio))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(app_state)
}
