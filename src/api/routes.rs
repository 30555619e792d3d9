use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::api::{handlers, state::AppState};
use crate::model::ComputeBackend;

// マルチパートの境界やヘッダの分
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router<B: ComputeBackend>(state: AppState<B>, allowed_origins: &[String]) -> Router {
    // バッチの最大ファイル数ぶんまで受け付ける。1 ファイルごとの上限はハンドラで確認する
    let body_limit = state.upload.max_file_size_bytes() * state.upload.max_batch_size.max(1)
        + MULTIPART_OVERHEAD;

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health::<B>))
        .route("/model/info", get(handlers::model_info::<B>))
        .route("/predict", post(handlers::predict::<B>))
        .route("/predict/batch", post(handlers::predict_batch::<B>))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(allowed_origins))
}

/// CORS 設定（"*" が含まれていれば全許可）
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
