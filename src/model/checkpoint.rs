//! 重みファイル（safetensors）の読み込み
//!
//! 学習パイプラインによって保存形式が異なるため、パラメータ辞書の取り出し方を
//! 固定の優先順位で試す（[`EXTRACTION_ORDER`]）。
//!
//! - `model_state_dict.*` / `state_dict.*` / `model.*` : チェックポイント形式（辞書がキーの下にある）
//! - それ以外 : パラメータ辞書そのもの

use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;

use crate::error::StoreError;

/// パラメータ辞書の取り出し方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// `<key>.` で始まるテンソルだけを取り出し、接頭辞を外す
    Nested(&'static str),
    /// ファイル全体をパラメータ辞書として扱う
    Raw,
}

/// 試行順（先頭から順に、最初に構造が一致したものを採用）
pub const EXTRACTION_ORDER: [ExtractionStrategy; 4] = [
    ExtractionStrategy::Nested("model_state_dict"),
    ExtractionStrategy::Nested("state_dict"),
    ExtractionStrategy::Nested("model"),
    ExtractionStrategy::Raw,
];

impl ExtractionStrategy {
    /// テンソル名の一覧がこの形式に一致するか
    pub fn matches<'a>(&self, mut names: impl Iterator<Item = &'a str>) -> bool {
        match self {
            ExtractionStrategy::Nested(key) => names.any(|name| strip_key(name, key).is_some()),
            ExtractionStrategy::Raw => true,
        }
    }

    /// テンソル名をパラメータ名に変換する（対象外なら None）
    pub fn parameter_name<'a>(&self, tensor_name: &'a str) -> Option<&'a str> {
        match self {
            ExtractionStrategy::Nested(key) => strip_key(tensor_name, key),
            ExtractionStrategy::Raw => Some(tensor_name),
        }
    }

    /// 一致する最初の形式を選ぶ
    pub fn select<'a, I>(names: I) -> ExtractionStrategy
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: Clone,
    {
        let names = names.into_iter();
        EXTRACTION_ORDER
            .iter()
            .copied()
            .find(|strategy| strategy.matches(names.clone()))
            .unwrap_or(ExtractionStrategy::Raw)
    }
}

impl std::fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionStrategy::Nested(key) => write!(f, "checkpoint[{key}]"),
            ExtractionStrategy::Raw => write!(f, "raw parameter mapping"),
        }
    }
}

fn strip_key<'a>(name: &'a str, key: &str) -> Option<&'a str> {
    name.strip_prefix(key)?.strip_prefix('.')
}

/// ホストメモリ上のテンソル（f32, 行優先）
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, values }
    }
}

/// パラメータ取り出し時のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("missing parameter: {0}")]
    Missing(String),
    #[error("shape mismatch for {name}: expected {expected:?}, found {actual:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("unexpected parameters: {}", .0.join(", "))]
    Unexpected(Vec<String>),
}

/// パラメータ名 → テンソル
#[derive(Debug)]
pub struct ParameterMap {
    tensors: HashMap<String, HostTensor>,
    strategy: ExtractionStrategy,
}

impl ParameterMap {
    /// 重みファイルを読み込む
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path).map_err(|e| StoreError::from_io(path, e))?;
        Self::from_safetensors(&bytes).map_err(|reason| StoreError::corrupt(path, reason))
    }

    /// safetensors のバイト列から作成
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self, String> {
        let file = SafeTensors::deserialize(bytes)
            .map_err(|e| format!("not a safetensors document: {e:?}"))?;

        let names = file.names();
        let strategy = ExtractionStrategy::select(names.iter().map(|name| name.as_str()));

        let mut tensors = HashMap::new();
        for (tensor_name, view) in file.tensors() {
            let Some(name) = strategy.parameter_name(&tensor_name) else {
                continue;
            };

            let values = match view.dtype() {
                Dtype::F32 => view
                    .data()
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect::<Vec<_>>(),
                Dtype::F64 => view
                    .data()
                    .chunks_exact(8)
                    .map(|b| {
                        f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                    })
                    .collect::<Vec<_>>(),
                // num_batches_tracked などの整数テンソルは推論に不要
                Dtype::I64 | Dtype::I32 | Dtype::U8 | Dtype::BOOL => {
                    tracing::debug!(parameter = name, "skipping non-float tensor");
                    continue;
                }
                other => {
                    return Err(format!("unsupported dtype {other:?} for {name}"));
                }
            };

            tensors.insert(
                name.to_string(),
                HostTensor::new(view.shape().to_vec(), values),
            );
        }

        if tensors.is_empty() {
            return Err(format!("no float parameters found ({strategy})"));
        }

        Ok(Self { tensors, strategy })
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// 形状を確認して取り出す
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<HostTensor, ParameterError> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))?;

        if tensor.shape != expected {
            return Err(ParameterError::Shape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape,
            });
        }

        Ok(tensor)
    }

    /// 取り出されなかったパラメータがあればエラー
    pub fn finish(self) -> Result<(), ParameterError> {
        if self.tensors.is_empty() {
            return Ok(());
        }
        let mut names: Vec<String> = self.tensors.into_keys().collect();
        names.sort();
        Err(ParameterError::Unexpected(names))
    }
}
