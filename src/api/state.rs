use chrono::{DateTime, Local};
use std::sync::Arc;

use crate::api::types::ApiError;
use crate::ml::InferencePipeline;
use crate::model::config::{AppConfig, UploadSettings};
use crate::model::ComputeBackend;

/// 推論パイプラインの状態
///
/// 読み込みに失敗した場合はプロセスが終わるまで Unavailable のまま。
pub enum Readiness<B: ComputeBackend> {
    Ready(InferencePipeline<B>),
    Unavailable { reason: Arc<str> },
}

impl<B: ComputeBackend> Clone for Readiness<B> {
    fn clone(&self) -> Self {
        match self {
            Readiness::Ready(pipeline) => Readiness::Ready(pipeline.clone()),
            Readiness::Unavailable { reason } => Readiness::Unavailable {
                reason: Arc::clone(reason),
            },
        }
    }
}

/// ハンドラ間で共有する状態
pub struct AppState<B: ComputeBackend> {
    pub readiness: Readiness<B>,
    pub upload: Arc<UploadSettings>,
    /// エラー応答に原因を含めるか
    pub debug: bool,
    pub started_at: DateTime<Local>,
}

impl<B: ComputeBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            readiness: self.readiness.clone(),
            upload: Arc::clone(&self.upload),
            debug: self.debug,
            started_at: self.started_at,
        }
    }
}

impl<B: ComputeBackend> AppState<B> {
    pub fn ready(pipeline: InferencePipeline<B>, config: &AppConfig) -> Self {
        Self::new(Readiness::Ready(pipeline), config)
    }

    pub fn unavailable(reason: impl Into<String>, config: &AppConfig) -> Self {
        let reason: String = reason.into();
        Self::new(
            Readiness::Unavailable {
                reason: Arc::from(reason),
            },
            config,
        )
    }

    fn new(readiness: Readiness<B>, config: &AppConfig) -> Self {
        Self {
            readiness,
            upload: Arc::new(config.upload.clone()),
            debug: config.debug,
            started_at: Local::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.readiness, Readiness::Ready(_))
    }

    /// 推論可能なパイプライン（未ロードなら 503）
    pub fn pipeline(&self) -> Result<&InferencePipeline<B>, ApiError> {
        match &self.readiness {
            Readiness::Ready(pipeline) => Ok(pipeline),
            Readiness::Unavailable { reason } => Err(ApiError::unavailable(reason, self.debug)),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Local::now() - self.started_at).num_seconds()
    }
}
