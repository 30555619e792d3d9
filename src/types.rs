use image::DynamicImage;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::PredictError;

/// クラスごとの確率（タクソノミーの順序を保持）
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities {
    entries: Vec<(String, f32)>,
}

impl ClassProbabilities {
    pub fn new(entries: Vec<(String, f32)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(l, p)| (l.as_str(), *p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 確率の合計（≈ 1）
    pub fn total(&self) -> f32 {
        self.entries.iter().map(|(_, p)| p).sum()
    }
}

// JSON ではラベル → 確率のオブジェクトとして出す
impl Serialize for ClassProbabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, probability) in &self.entries {
            map.serialize_entry(label, probability)?;
        }
        map.end()
    }
}

/// 1 枚の画像に対する推論結果
#[derive(Debug, Clone, serde::Serialize)]
pub struct PredictionResult {
    /// 予測クラス（タクソノミーのいずれか）
    pub predicted_class: String,
    /// 予測クラスの確率 (0-1)
    pub confidence: f32,
    /// 全クラスの確率
    pub probabilities: ClassProbabilities,
    /// 前処理〜後処理の処理時間（ミリ秒）
    pub processing_time_ms: f64,
}

/// 推論の入力画像
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    /// エンコード済み（PNG, JPEG など）
    Bytes(&'a [u8]),
    /// デコード済み
    Decoded(&'a DynamicImage),
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for ImageSource<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        ImageSource::Bytes(bytes.as_slice())
    }
}

impl<'a> From<&'a DynamicImage> for ImageSource<'a> {
    fn from(image: &'a DynamicImage) -> Self {
        ImageSource::Decoded(image)
    }
}

/// バッチ入力の 1 アイテム（識別子 + 画像データ）
#[derive(Debug, Clone)]
pub struct NamedImage {
    /// ファイル名など
    pub id: String,
    pub bytes: Vec<u8>,
}

impl NamedImage {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            bytes,
        }
    }
}

/// バッチ内の 1 アイテムの結果
#[derive(Debug)]
pub enum BatchOutcome {
    Success {
        id: String,
        prediction: PredictionResult,
    },
    Failure {
        id: String,
        error: PredictError,
    },
}

impl BatchOutcome {
    pub fn id(&self) -> &str {
        match self {
            BatchOutcome::Success { id, .. } | BatchOutcome::Failure { id, .. } => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success { .. })
    }

    pub fn prediction(&self) -> Option<&PredictionResult> {
        match self {
            BatchOutcome::Success { prediction, .. } => Some(prediction),
            BatchOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&PredictError> {
        match self {
            BatchOutcome::Success { .. } => None,
            BatchOutcome::Failure { error, .. } => Some(error),
        }
    }
}
