use anyhow::{Context, Result};
use clap::Parser;
use kidney_classifier_lib::api::{create_router, AppState};
use kidney_classifier_lib::logging::init_logging;
use kidney_classifier_lib::model::{AppConfig, ComputeDevice, DefaultBackend};
use kidney_classifier_lib::InferencePipeline;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

/// 腎臓 CT 画像分類 API サーバー
#[derive(Debug, Parser)]
#[command(name = "kidney_classifier", version, about)]
struct Args {
    /// 設定ファイル（JSON）
    #[arg(short, long, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    /// 重みファイル（safetensors）
    #[arg(long)]
    weights: Option<PathBuf>,

    /// クラス定義ファイル（JSON）
    #[arg(long)]
    class_names: Option<PathBuf>,

    /// cpu / gpu
    #[arg(long)]
    device: Option<ComputeDevice>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// エラー応答に詳細を含める
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(weights) = &self.weights {
            config.model.weights_path = weights.clone();
        }
        if let Some(class_names) = &self.class_names {
            config.model.class_names_path = class_names.clone();
        }
        if let Some(device) = self.device {
            config.model.device = device;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_message) = AppConfig::load_or_default(&args.config);
    config.apply_env_overrides()?;
    args.apply(&mut config);

    let _log_guard = init_logging(&config.logging);
    info!("{}", config_message);
    info!("Starting Kidney Disease Classification API v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    // 読み込みはブロッキング処理なので専用スレッドで行う
    let model = config.model.clone();
    let loaded = tokio::task::spawn_blocking(move || {
        InferencePipeline::<DefaultBackend>::load(
            &model.weights_path,
            &model.class_names_path,
            model.device,
        )
    })
    .await?;

    let state = match loaded {
        Ok(pipeline) => {
            info!(classes = ?pipeline.taxonomy().labels(), "model ready");
            AppState::ready(pipeline, &config)
        }
        Err(e) => {
            // プロセスは起動するが Ready にはならない（再読み込みには再起動が必要）
            error!(error = %e, "failed to load model, prediction endpoints will return 503");
            AppState::unavailable(e.to_string(), &config)
        }
    };

    let app = create_router(state, &config.server.allowed_origins);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", config.server.host, config.server.port)
            })?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down Kidney Disease Classification API");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
