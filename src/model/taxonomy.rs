//! クラス定義（class_names.json）の読み込み
//!
//! インデックス i が出力ロジット i に対応する。読み込み後は変更しない。

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::StoreError;

#[derive(Debug, Deserialize)]
struct TaxonomyDocument {
    classes: Vec<String>,
}

/// 順序付きのクラスラベル一覧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTaxonomy {
    labels: Vec<String>,
}

impl ClassTaxonomy {
    /// ラベル一覧から作成（空・重複はエラー）
    pub fn new(labels: Vec<String>) -> Result<Self, String> {
        if labels.is_empty() {
            return Err("class list is empty".to_string());
        }

        let mut seen = HashSet::with_capacity(labels.len());
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(format!("duplicate class label: {label}"));
            }
        }

        Ok(Self { labels })
    }

    /// JSON ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::from_io(path, e))?;
        Self::from_json_str(&content).map_err(|reason| StoreError::corrupt(path, reason))
    }

    /// JSON 文字列から作成
    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let document: TaxonomyDocument =
            serde_json::from_str(json).map_err(|e| format!("invalid taxonomy document: {e}"))?;
        Self::new(document.classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// 空のタクソノミーは作れないため常に false
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_taxonomy() {
        let taxonomy =
            ClassTaxonomy::from_json_str(r#"{"classes": ["Cyst", "Normal", "Stone", "Tumor"]}"#)
                .unwrap();
        assert_eq!(taxonomy.len(), 4);
        assert_eq!(taxonomy.label(2), Some("Stone"));
        assert_eq!(taxonomy.index_of("Tumor"), Some(3));
        assert_eq!(taxonomy.label(4), None);
    }

    #[test]
    fn test_reject_empty_and_duplicates() {
        assert!(ClassTaxonomy::from_json_str(r#"{"classes": []}"#).is_err());
        let err = ClassTaxonomy::from_json_str(r#"{"classes": ["Cyst", "Cyst"]}"#).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_reject_missing_field() {
        assert!(ClassTaxonomy::from_json_str(r#"{"labels": ["Cyst"]}"#).is_err());
        assert!(ClassTaxonomy::from_json_str("not json").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("kidney_classifier_no_such_taxonomy.json");
        let err = ClassTaxonomy::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::ArtifactNotFound { .. }));
    }
}
