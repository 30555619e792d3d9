//! 推論パイプライン
//!
//! 前処理 → 順伝播 → 後処理 を 1 枚ずつ同期的に実行する。
//! パイプラインは読み込み済みの [`ModelStore`] からしか作れないので、存在する時点で Ready。

use burn::tensor::Tensor;
use image::error::{ImageError, ParameterError, ParameterErrorKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{PredictError, StoreError};
use crate::ml::postprocess::classify;
use crate::ml::preprocess::PreprocessSpec;
use crate::model::{ClassTaxonomy, ComputeBackend, ComputeDevice, ModelInfo, ModelStore};
use crate::types::{BatchOutcome, ImageSource, NamedImage, PredictionResult};

/// 推論エンジン
#[derive(Debug)]
pub struct InferencePipeline<B: ComputeBackend> {
    store: Arc<ModelStore<B>>,
    preprocess: PreprocessSpec,
}

impl<B: ComputeBackend> Clone for InferencePipeline<B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            preprocess: self.preprocess,
        }
    }
}

impl<B: ComputeBackend> InferencePipeline<B> {
    /// 読み込み済みのモデルから作成（前処理はモデルのプロファイルに固定）
    pub fn new(store: Arc<ModelStore<B>>) -> Self {
        let preprocess = store.profile().preprocess;
        Self { store, preprocess }
    }

    /// 重みとクラス定義を読み込んでパイプラインを作成
    pub fn load(
        weights_path: &Path,
        taxonomy_path: &Path,
        device: ComputeDevice,
    ) -> Result<Self, StoreError> {
        let store = ModelStore::load(weights_path, taxonomy_path, device)?;
        Ok(Self::new(Arc::new(store)))
    }

    /// 1 枚の画像を分類
    ///
    /// 処理時間はデコード開始から後処理完了までを計測する。
    /// 順伝播以外で発生した panic は [`PredictError::Internal`] として返す。
    pub fn predict<'a>(
        &self,
        image: impl Into<ImageSource<'a>>,
    ) -> Result<PredictionResult, PredictError> {
        let source = image.into();
        catch_internal("prediction panicked", || self.run(source))
    }

    fn run(&self, source: ImageSource<'_>) -> Result<PredictionResult, PredictError> {
        let started = Instant::now();

        let decoded;
        let image = match source {
            ImageSource::Bytes(bytes) => {
                decoded = PreprocessSpec::decode(bytes)?;
                &decoded
            }
            ImageSource::Decoded(image) => image,
        };
        let input = self.preprocess.apply(image).ok_or_else(empty_image_error)?;

        let logits = self.forward(&input)?;
        let classification = classify(&logits, self.store.taxonomy())?;

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            class = %classification.predicted_class,
            confidence = classification.confidence,
            processing_time_ms,
            "prediction complete"
        );

        Ok(PredictionResult {
            predicted_class: classification.predicted_class,
            confidence: classification.confidence,
            probabilities: classification.probabilities,
            processing_time_ms,
        })
    }

    /// エンコード済み画像（PNG, JPEG など）を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult, PredictError> {
        self.predict(ImageSource::Bytes(bytes))
    }

    /// 複数画像を入力順に分類
    ///
    /// 1 件の失敗は該当アイテムの [`BatchOutcome::Failure`] になるだけで、残りは続行する。
    pub fn predict_batch(&self, items: &[NamedImage]) -> Vec<BatchOutcome> {
        items
            .iter()
            .map(|item| match self.predict_bytes(&item.bytes) {
                Ok(prediction) => BatchOutcome::Success {
                    id: item.id.clone(),
                    prediction,
                },
                Err(error) => {
                    warn!(item = %item.id, error = %error, "batch item failed");
                    BatchOutcome::Failure {
                        id: item.id.clone(),
                        error,
                    }
                }
            })
            .collect()
    }

    /// 順伝播してロジットを取り出す
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>, PredictError> {
        let shape = self.preprocess.input_shape();
        let expected = shape.iter().product::<usize>();
        if input.len() != expected {
            return Err(PredictError::internal(
                "preprocessed input has the wrong size",
                format!("expected {expected} values for {shape:?}, got {}", input.len()),
            ));
        }

        let handle = self.store.handle();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let tensor = Tensor::<B, 1>::from_floats(input, handle.device()).reshape(shape);
            handle.forward(tensor).into_data().to_vec::<f32>()
        }));

        match outcome {
            Ok(Ok(logits)) => Ok(logits),
            Ok(Err(e)) => {
                error!(error = ?e, "failed to read logits back from device");
                Err(PredictError::Inference(format!(
                    "failed to read logits: {e:?}"
                )))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%message, "forward pass panicked");
                Err(PredictError::Inference(message))
            }
        }
    }

    /// モデル情報（`/model/info` 用）
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo::from_store(self.store.as_ref())
    }

    pub fn taxonomy(&self) -> &ClassTaxonomy {
        self.store.taxonomy()
    }

    pub fn preprocess(&self) -> &PreprocessSpec {
        &self.preprocess
    }
}

/// panic を [`PredictError::Internal`] に変換して返す
fn catch_internal<T>(
    context: &str,
    f: impl FnOnce() -> Result<T, PredictError>,
) -> Result<T, PredictError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(%message, context, "panic during prediction");
        Err(PredictError::internal(context, message))
    })
}

/// 幅または高さが 0 の画像（デコードできない入力と同じ扱い）
fn empty_image_error() -> PredictError {
    PredictError::Decode(ImageError::Parameter(ParameterError::from_kind(
        ParameterErrorKind::Generic("image has zero width or height".to_string()),
    )))
}

/// panic の payload からメッセージを取り出す
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
