use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::PredictError;
use crate::types::PredictionResult;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 応答に付けるタイムスタンプ（ISO8601）
pub fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub health: String,
    pub model_info: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub model_loaded: bool,
    pub version: String,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub success: bool,
    pub prediction: PredictionResult,
    pub message: String,
    pub timestamp: String,
}

/// バッチ内の 1 ファイルの結果
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResponse {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<PredictionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResponse {
    pub fn success(filename: String, prediction: PredictionResult) -> Self {
        Self {
            filename,
            success: true,
            prediction: Some(prediction),
            error: None,
        }
    }

    pub fn failure(filename: String, error: impl Into<String>) -> Self {
        Self {
            filename,
            success: false,
            prediction: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub total: usize,
    pub results: Vec<BatchItemResponse>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub detail: Option<String>,
    pub timestamp: String,
}

// ============================================================================
// Errors
// ============================================================================

/// ハンドラのエラー（ErrorResponse として返す）
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            detail: None,
        }
    }

    pub fn unavailable(reason: &str, debug: bool) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "Model not loaded. Please contact administrator.".to_string(),
            detail: debug.then(|| reason.to_string()),
        }
    }

    pub fn internal(detail: impl Into<String>, debug: bool) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Internal server error".to_string(),
            detail: debug.then(|| detail.into()),
        }
    }

    /// 推論エラーの変換（デコード失敗は 400、それ以外は 500）
    pub fn prediction(err: &PredictError, debug: bool) -> Self {
        if err.is_client_error() {
            Self {
                status: StatusCode::BAD_REQUEST,
                error: "Invalid image".to_string(),
                detail: Some(err.to_string()),
            }
        } else {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "Prediction failed".to_string(),
                detail: debug.then(|| error_chain(err)),
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self {
            status: err.status(),
            error: "Invalid multipart request".to_string(),
            detail: Some(err.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            success: false,
            error: self.error,
            detail: self.detail,
            timestamp: timestamp(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// バッチ結果に載せるエラー文言
pub fn batch_error_message(err: &PredictError, debug: bool) -> String {
    if err.is_client_error() || debug {
        error_chain(err)
    } else {
        "Prediction failed".to_string()
    }
}

/// source を辿ってエラーを 1 行にする
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_error_status() {
        let err = PredictError::internal("tensor readback", "device lost");
        let api = ApiError::prediction(&err, false);
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(api.detail.is_none());

        let api = ApiError::prediction(&err, true);
        assert_eq!(
            api.detail.as_deref(),
            Some("internal error: tensor readback: device lost")
        );

        let decode = image::load_from_memory(b"nope").unwrap_err();
        let api = ApiError::prediction(&PredictError::Decode(decode), false);
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert!(api.detail.is_some());
    }

    #[test]
    fn test_batch_item_serialization() {
        let item = BatchItemResponse::failure("scan.png".to_string(), "Invalid file type");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Invalid file type");
        assert!(json.get("prediction").is_none());
    }
}
