//! 推論パイプラインのエラー定義
//!
//! 読み込み時のエラー（[`StoreError`]）はパイプラインを Ready にさせない致命的なもの。
//! 推論時のエラー（[`PredictError`]）は呼び出し単位で返され、バッチでは該当アイテムに閉じ込められる。

use std::path::{Path, PathBuf};
use thiserror::Error;

/// モデルストア読み込み時のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// 重みファイルまたはクラス定義ファイルが見つからない
    #[error("artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    /// デシリアライズ失敗・形状不一致など
    #[error("artifact is corrupt ({}): {reason}", path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },

    /// 最終層の出力次元とクラス数が一致しない
    #[error(
        "architecture mismatch: classifier head has {model_outputs} outputs but taxonomy declares {taxonomy_len} classes"
    )]
    ArchitectureMismatch {
        model_outputs: usize,
        taxonomy_len: usize,
    },
}

impl StoreError {
    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// ファイルオープン時の I/O エラーを分類する
    pub(crate) fn from_io(path: &Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::ArtifactNotFound {
                path: path.to_path_buf(),
            }
        } else {
            StoreError::corrupt(path, format!("failed to read: {err}"))
        }
    }
}

/// 推論呼び出し時のエラー
#[derive(Debug, Error)]
pub enum PredictError {
    /// 画像としてデコードできない入力
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// 順伝播中の失敗（デバイスエラー、形状不一致など）
    #[error("inference failed: {0}")]
    Inference(String),

    /// 想定外の失敗。原因を必ず保持する
    #[error("internal error: {context}")]
    Internal {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PredictError {
    pub(crate) fn internal(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        PredictError::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// 呼び出し側の入力が原因かどうか
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictError::Decode(_))
    }
}
