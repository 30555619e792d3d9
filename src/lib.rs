//! 腎臓 CT 画像の分類推論
//!
//! - [`model`]: 重み・クラス定義の読み込み（[`ModelStore`]）と設定
//! - [`ml`]: ネットワーク・前処理・後処理・推論パイプライン（[`InferencePipeline`]）
//! - [`api`]: HTTP API（axum）

pub mod error;
pub mod types;
pub mod logging;

pub mod model;
pub mod ml;
pub mod api;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PredictError, StoreError};
pub use ml::InferencePipeline;
pub use model::{AppConfig, ClassTaxonomy, ComputeDevice, DefaultBackend, ModelStore};
pub use types::{BatchOutcome, ClassProbabilities, ImageSource, NamedImage, PredictionResult};
