//! アプリケーション設定管理モジュール
//!
//! モデルファイル・サーバー・アップロード制限・ログの設定をJSON形式で保存・読み込みします。
//! 読み込み後に `KIDNEY_*` 環境変数で上書きできます。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::model::device::ComputeDevice;

/// 環境変数のプレフィックス
pub const ENV_PREFIX: &str = "KIDNEY_";

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// 重みファイル（safetensors）のパス
    pub weights_path: PathBuf,
    /// クラス定義ファイルのパス
    pub class_names_path: PathBuf,
    /// 計算デバイス（使えない場合は CPU にフォールバック）
    pub device: ComputeDevice,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from("models/model_weights.safetensors"),
            class_names_path: PathBuf::from("models/class_names.json"),
            device: ComputeDevice::Gpu,
        }
    }
}

/// サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// CORS で許可するオリジン
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://localhost:4200".to_string(),
            ],
        }
    }
}

/// アップロード制限
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    /// 1 ファイルあたりの上限（MB）
    pub max_file_size_mb: usize,
    /// バッチ 1 回あたりのファイル数上限
    pub max_batch_size: usize,
    /// 受け付ける Content-Type
    pub allowed_image_types: Vec<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: 10,
            max_batch_size: 10,
            allowed_image_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/jpg".to_string(),
            ],
        }
    }
}

impl UploadSettings {
    pub fn max_file_size_bytes(&self) -> usize {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Content-Type が画像として受け付けられるか
    pub fn accepts(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        // "image/png; charset=..." のようなパラメータは無視
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        essence.starts_with("image/")
            && (self.allowed_image_types.is_empty()
                || self.allowed_image_types.iter().any(|t| t.eq_ignore_ascii_case(&essence)))
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// `RUST_LOG` が無いときのフィルタ（"info", "kidney_classifier_lib=debug" など）
    pub level: String,
    /// ログファイルの出力先（None ならコンソールのみ）
    pub log_dir: Option<PathBuf>,
    /// ファイル名のプレフィックス（日付が付く）
    pub log_file: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: Some(PathBuf::from("logs")),
            log_file: "api.log".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub server: ServerSettings,
    pub upload: UploadSettings,
    pub logging: LoggingSettings,
    /// エラー応答に原因の詳細を含める
    pub debug: bool,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ログ初期化前に呼ばれることがあるので、結果は戻り値のメッセージで返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, String) {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => (config, format!("loaded config from {}", path.display())),
                Err(e) => (
                    Self::default(),
                    format!("failed to load config ({e:#}), using defaults"),
                ),
            }
        } else {
            (
                Self::default(),
                format!("{} not found, using defaults", path.display()),
            )
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// `KIDNEY_*` 環境変数で上書き
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(std::env::vars())
    }

    /// (キー, 値) の組で上書き。未知のキーは無視する
    pub fn apply_overrides_from<I, K, V>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();

            match name {
                "WEIGHTS_PATH" => self.model.weights_path = PathBuf::from(value),
                "CLASS_NAMES_PATH" => self.model.class_names_path = PathBuf::from(value),
                "DEVICE" => {
                    self.model.device = value
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))
                        .context("invalid KIDNEY_DEVICE")?;
                }
                "HOST" => self.server.host = value.to_string(),
                "PORT" => {
                    self.server.port = value
                        .parse()
                        .with_context(|| format!("invalid KIDNEY_PORT: {value}"))?;
                }
                "LOG_LEVEL" => self.logging.level = value.to_string(),
                "DEBUG" => self.debug = parse_flag(value),
                other => warn!(variable = %format!("{ENV_PREFIX}{other}"), "ignoring unknown variable"),
            }
        }
        Ok(())
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        info!(
            weights = %self.model.weights_path.display(),
            class_names = %self.model.class_names_path.display(),
            device = %self.model.device,
            "model settings"
        );
        info!(
            host = %self.server.host,
            port = self.server.port,
            origins = ?self.server.allowed_origins,
            max_file_size_mb = self.upload.max_file_size_mb,
            max_batch_size = self.upload.max_batch_size,
            debug = self.debug,
            "server settings"
        );
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
