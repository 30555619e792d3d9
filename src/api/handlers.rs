use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info, warn};

use crate::api::{
    state::AppState,
    types::*,
};
use crate::model::{ComputeBackend, ModelInfo};
use crate::types::{BatchOutcome, NamedImage};

/// GET /
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Kidney Disease Classification API".to_string(),
        version: VERSION.to_string(),
        health: "/health".to_string(),
        model_info: "/model/info".to_string(),
    })
}

/// GET /health -- モデル未ロードなら 503
pub async fn health<B: ComputeBackend>(
    State(state): State<AppState<B>>,
) -> (StatusCode, Json<HealthResponse>) {
    let model_loaded = state.is_ready();
    let resp = HealthResponse {
        status: if model_loaded { "healthy" } else { "degraded" }.to_string(),
        timestamp: timestamp(),
        model_loaded,
        version: VERSION.to_string(),
        uptime_secs: state.uptime_seconds(),
    };

    let status = if model_loaded {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// GET /model/info
pub async fn model_info<B: ComputeBackend>(
    State(state): State<AppState<B>>,
) -> Result<Json<ModelInfo>, ApiError> {
    Ok(Json(state.pipeline()?.model_info()))
}

/// アップロードされた 1 ファイル
struct Upload {
    filename: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// 指定した名前のフィールドを読み出す
async fn read_uploads(
    multipart: &mut Multipart,
    field_name: &str,
    limit: Option<usize>,
) -> Result<Vec<Upload>, ApiError> {
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) {
            continue;
        }
        if let Some(limit) = limit {
            if uploads.len() >= limit {
                return Err(ApiError::bad_request(format!(
                    "Maximum {limit} images per batch request"
                )));
            }
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload_{}", uploads.len()));
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?.to_vec();

        uploads.push(Upload {
            filename,
            content_type,
            bytes,
        });
    }

    Ok(uploads)
}

/// POST /predict -- multipart の `file` フィールド
pub async fn predict<B: ComputeBackend>(
    State(state): State<AppState<B>>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>, ApiError> {
    let pipeline = state.pipeline()?.clone();

    let upload = read_uploads(&mut multipart, "file", None)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::bad_request("No file provided (expected field `file`)"))?;

    if !state.upload.accepts(upload.content_type.as_deref()) {
        warn!(content_type = ?upload.content_type, "invalid file type");
        return Err(ApiError::bad_request(format!(
            "Invalid file type. Expected image, got {}",
            upload.content_type.as_deref().unwrap_or("none")
        )));
    }

    if upload.bytes.len() > state.upload.max_file_size_bytes() {
        return Err(ApiError::bad_request(format!(
            "File size too large. Maximum size is {}MB.",
            state.upload.max_file_size_mb
        )));
    }

    info!(file = %upload.filename, bytes = upload.bytes.len(), "processing prediction request");

    let bytes = upload.bytes;
    let result = tokio::task::spawn_blocking(move || pipeline.predict_bytes(&bytes))
        .await
        .map_err(|e| {
            error!(error = %e, "prediction task failed");
            ApiError::internal(e.to_string(), state.debug)
        })?;

    match result {
        Ok(prediction) => {
            info!(
                class = %prediction.predicted_class,
                confidence = %format!("{:.2}%", prediction.confidence * 100.0),
                "prediction"
            );
            Ok(Json(PredictionResponse {
                success: true,
                prediction,
                message: "Prediction completed successfully".to_string(),
                timestamp: timestamp(),
            }))
        }
        Err(err) => {
            if err.is_client_error() {
                warn!(file = %upload.filename, error = %err, "rejected image");
            } else {
                error!(file = %upload.filename, error = %error_chain(&err), "prediction failed");
            }
            Err(ApiError::prediction(&err, state.debug))
        }
    }
}

/// バッチ内の位置ごとの扱い
enum Slot {
    /// 推論に回す（`NamedImage` の添字）
    Queued(usize),
    Rejected { filename: String, reason: String },
}

/// POST /predict/batch -- multipart の `files` フィールド（複数）
pub async fn predict_batch<B: ComputeBackend>(
    State(state): State<AppState<B>>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    let pipeline = state.pipeline()?.clone();

    let uploads =
        read_uploads(&mut multipart, "files", Some(state.upload.max_batch_size)).await?;
    if uploads.is_empty() {
        return Err(ApiError::bad_request("No files provided (expected field `files`)"));
    }
    let total = uploads.len();

    let mut slots = Vec::with_capacity(total);
    let mut queued = Vec::new();
    for upload in uploads {
        if !state.upload.accepts(upload.content_type.as_deref()) {
            slots.push(Slot::Rejected {
                filename: upload.filename,
                reason: "Invalid file type".to_string(),
            });
        } else if upload.bytes.len() > state.upload.max_file_size_bytes() {
            slots.push(Slot::Rejected {
                filename: upload.filename,
                reason: "File size too large".to_string(),
            });
        } else {
            slots.push(Slot::Queued(queued.len()));
            queued.push(NamedImage::new(upload.filename, upload.bytes));
        }
    }

    info!(total, queued = queued.len(), "processing batch request");

    let outcomes = tokio::task::spawn_blocking(move || pipeline.predict_batch(&queued))
        .await
        .map_err(|e| {
            error!(error = %e, "batch prediction task failed");
            ApiError::internal(e.to_string(), state.debug)
        })?;

    let mut outcomes: Vec<Option<BatchOutcome>> = outcomes.into_iter().map(Some).collect();
    let results = slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Rejected { filename, reason } => BatchItemResponse::failure(filename, reason),
            Slot::Queued(index) => match outcomes.get_mut(index).and_then(Option::take) {
                Some(BatchOutcome::Success { id, prediction }) => {
                    BatchItemResponse::success(id, prediction)
                }
                Some(BatchOutcome::Failure { id, error }) => {
                    BatchItemResponse::failure(id, batch_error_message(&error, state.debug))
                }
                None => BatchItemResponse::failure(
                    format!("upload_{index}"),
                    "Prediction result missing",
                ),
            },
        })
        .collect();

    Ok(Json(BatchResponse {
        success: true,
        total,
        results,
        timestamp: timestamp(),
    }))
}
