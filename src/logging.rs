//! ログの初期化
//!
//! コンソール出力に加えて、ログディレクトリに書き込めれば日次ローテーションのファイルにも出す。

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::model::config::LoggingSettings;

/// サーバー用のログ初期化
///
/// 戻り値の guard を保持している間だけファイルへの書き込みが続く。
pub fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&settings.level)));

    // rolling::daily は初回のファイル作成に失敗すると panic するので先に確認する
    let (file_layer, guard) = match settings.log_dir.as_deref() {
        Some(dir) => match check_writable(dir) {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::daily(dir, &settings.log_file);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not write to log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let file_logging_enabled = file_layer.is_some();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if file_logging_enabled {
        if let Some(dir) = settings.log_dir.as_deref() {
            tracing::info!(dir = %dir.display(), file = %settings.log_file, "file logging enabled");
        }
    }

    guard
}

/// CLI 用（警告以上のみ）
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .try_init();
}

/// 設定のレベルが単語だけならライブラリ側のログも同じレベルにする
fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    if level.contains('=') || level.contains(',') {
        level
    } else {
        format!("{level},tower_http=warn,wgpu_core=warn,wgpu_hal=warn")
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".kidney_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
