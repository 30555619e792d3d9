//! コマンドラインから画像を分類する
//!
//! 読めないファイルがあっても残りの画像は分類を続ける（読み込み失敗として報告する）。

use anyhow::{Context, Result};
use clap::Parser;
use kidney_classifier_lib::logging::init_logging_simple;
use kidney_classifier_lib::model::{ComputeDevice, DefaultBackend};
use kidney_classifier_lib::{BatchOutcome, InferencePipeline, NamedImage};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "classify", version, about = "Classify kidney CT images")]
struct Args {
    /// 分類する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// 重みファイル（safetensors）
    #[arg(long, env = "KIDNEY_WEIGHTS_PATH", default_value = "models/model_weights.safetensors")]
    weights: PathBuf,

    /// クラス定義ファイル（JSON）
    #[arg(long, env = "KIDNEY_CLASS_NAMES_PATH", default_value = "models/class_names.json")]
    class_names: PathBuf,

    /// cpu / gpu
    #[arg(long, env = "KIDNEY_DEVICE", default_value = "cpu")]
    device: ComputeDevice,

    /// 結果を JSON で出力
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_logging_simple();
    let args = Args::parse();

    let pipeline =
        InferencePipeline::<DefaultBackend>::load(&args.weights, &args.class_names, args.device)
            .context("failed to load model")?;

    let info = pipeline.model_info();
    if !args.json {
        println!("=== Kidney Disease Classifier ===");
        println!("モデル: {}", info.model_architecture);
        println!("クラス: {}", info.classes.join(", "));
        println!(
            "デバイス: {} (要求: {}, バックエンド: {})",
            info.device, info.requested_device, info.backend
        );
        println!();
    }

    let (entries, items) = read_images(&args.images);
    let outcomes = pipeline.predict_batch(&items);
    let report = assemble(entries, outcomes);
    let failures = report.iter().filter(|e| !e.is_success()).count();

    if args.json {
        let json: Vec<serde_json::Value> = report.iter().map(Entry::to_json).collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        for entry in &report {
            print_entry(entry);
        }
        println!("{} 件中 {} 件成功", report.len(), report.len() - failures);
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// 入力ファイル 1 つ分の結果
enum Entry {
    /// 分類に回した（`NamedImage` の添字）
    Queued(usize),
    Classified(BatchOutcome),
    /// ファイルを読み込めなかった
    Unreadable { path: String, error: std::io::Error },
}

impl Entry {
    fn is_success(&self) -> bool {
        matches!(self, Entry::Classified(outcome) if outcome.is_success())
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Entry::Classified(BatchOutcome::Success { id, prediction }) => serde_json::json!({
                "filename": id,
                "success": true,
                "prediction": prediction,
            }),
            Entry::Classified(BatchOutcome::Failure { id, error }) => serde_json::json!({
                "filename": id,
                "success": false,
                "error": error.to_string(),
            }),
            Entry::Unreadable { path, error } => serde_json::json!({
                "filename": path,
                "success": false,
                "error": format!("failed to read file: {error}"),
            }),
            Entry::Queued(index) => serde_json::json!({
                "filename": format!("image_{index}"),
                "success": false,
                "error": "prediction result missing",
            }),
        }
    }
}

/// 読み込めたファイルだけを分類対象にする
fn read_images(paths: &[PathBuf]) -> (Vec<Entry>, Vec<NamedImage>) {
    let mut entries = Vec::with_capacity(paths.len());
    let mut items = Vec::new();

    for path in paths {
        match std::fs::read(path) {
            Ok(bytes) => {
                entries.push(Entry::Queued(items.len()));
                items.push(NamedImage::new(path.display().to_string(), bytes));
            }
            Err(error) => entries.push(Entry::Unreadable {
                path: path.display().to_string(),
                error,
            }),
        }
    }

    (entries, items)
}

/// 分類結果を入力順に戻す
fn assemble(entries: Vec<Entry>, outcomes: Vec<BatchOutcome>) -> Vec<Entry> {
    let mut outcomes: Vec<Option<BatchOutcome>> = outcomes.into_iter().map(Some).collect();
    entries
        .into_iter()
        .map(|entry| match entry {
            Entry::Queued(index) => match outcomes.get_mut(index).and_then(Option::take) {
                Some(outcome) => Entry::Classified(outcome),
                None => Entry::Queued(index),
            },
            other => other,
        })
        .collect()
}

fn print_entry(entry: &Entry) {
    match entry {
        Entry::Classified(outcome) => print_outcome(outcome),
        Entry::Unreadable { path, error } => {
            eprintln!("✗ {}: failed to read file: {}", path, error);
            println!();
        }
        Entry::Queued(index) => {
            eprintln!("✗ image_{}: prediction result missing", index);
            println!();
        }
    }
}

fn print_outcome(outcome: &BatchOutcome) {
    match outcome {
        BatchOutcome::Success { id, prediction } => {
            println!("✓ {}", id);
            println!("  予測: {}", prediction.predicted_class);
            println!("  信頼度: {:.2}%", prediction.confidence * 100.0);
            println!("  処理時間: {:.2}ms", prediction.processing_time_ms);
            println!("  全クラスの確率:");
            for (label, probability) in prediction.probabilities.iter() {
                println!("    {:<10} {:.4}", label, probability);
            }
        }
        BatchOutcome::Failure { id, error } => {
            eprintln!("✗ {}: {}", id, error);
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_file_is_reported_as_read_failure() {
        let dir = std::env::temp_dir().join(format!("classify_cli_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let present = dir.join("scan.png");
        std::fs::write(&present, b"png bytes").unwrap();
        let missing = dir.join("missing.png");

        let (entries, items) = read_images(&[missing.clone(), present.clone()]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, present.display().to_string());

        // 読めたファイルだけが分類される
        let decode = image::load_from_memory(b"png bytes").unwrap_err();
        let outcomes = vec![BatchOutcome::Failure {
            id: items[0].id.clone(),
            error: decode.into(),
        }];
        let report = assemble(entries, outcomes);

        assert_eq!(report.len(), 2);
        let first = report[0].to_json();
        assert_eq!(first["filename"], missing.display().to_string());
        assert!(first["error"].as_str().unwrap().starts_with("failed to read file"));
        let second = report[1].to_json();
        assert!(second["error"].as_str().unwrap().starts_with("failed to decode image"));
        assert!(report.iter().all(|e| !e.is_success()));

        std::fs::remove_dir_all(&dir).ok();
    }
}
