//! 読み込み済みモデルの情報
//!
//! `/model/info` と CLI の起動ログで使う。

use serde::Serialize;

use crate::model::checkpoint::ExtractionStrategy;
use crate::model::device::{ComputeBackend, ComputeDevice};
use crate::model::model_storage::ModelStore;

/// 正規化定数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// モデル情報
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    /// 例: "ResNet18"
    pub model_architecture: String,
    pub classes: Vec<String>,
    pub num_classes: usize,
    /// [高さ, 幅]
    pub input_size: [u32; 2],
    /// 実際に使われているデバイス
    pub device: ComputeDevice,
    pub requested_device: ComputeDevice,
    pub backend: &'static str,
    /// 重みファイルの解釈（"raw" / "model_state_dict" など）
    pub checkpoint_format: String,
    pub normalization: Normalization,
}

impl ModelInfo {
    pub fn from_store<B: ComputeBackend>(store: &ModelStore<B>) -> Self {
        let profile = store.profile();
        let preprocess = &profile.preprocess;
        let binding = store.device_binding();

        let checkpoint_format = match store.checkpoint_format() {
            ExtractionStrategy::Nested(key) => key.to_string(),
            ExtractionStrategy::Raw => "raw".to_string(),
        };

        Self {
            model_architecture: profile.architecture.name(),
            classes: store.taxonomy().labels().to_vec(),
            num_classes: store.taxonomy().len(),
            input_size: [preprocess.crop, preprocess.crop],
            device: binding.actual,
            requested_device: binding.requested,
            backend: B::NAME,
            checkpoint_format,
            normalization: Normalization {
                mean: preprocess.mean,
                std: preprocess.std,
            },
        }
    }
}
