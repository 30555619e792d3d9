//! ロジットの後処理（Softmax + Argmax + クラスごとの確率）

use crate::error::PredictError;
use crate::model::ClassTaxonomy;
use crate::types::ClassProbabilities;

/// Softmax（最大値を引いてから計算するので overflow しない）
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = logits.iter().map(|&l| ((l - max) as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|&e| (e / sum) as f32).collect()
}

/// 最大値のインデックス。同値の場合は最初のもの
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// 後処理の結果
#[derive(Debug, Clone)]
pub struct Classification {
    pub predicted_class: String,
    pub confidence: f32,
    pub probabilities: ClassProbabilities,
}

/// ロジットをクラス確率に変換する
pub fn classify(logits: &[f32], taxonomy: &ClassTaxonomy) -> Result<Classification, PredictError> {
    if logits.len() != taxonomy.len() {
        return Err(PredictError::internal(
            "logit vector does not match taxonomy",
            format!("{} logits for {} classes", logits.len(), taxonomy.len()),
        ));
    }

    if let Some(index) = logits.iter().position(|l| !l.is_finite()) {
        return Err(PredictError::Inference(format!(
            "non-finite logit {} at index {index}",
            logits[index]
        )));
    }

    let probabilities = softmax(logits);
    let index = argmax(&probabilities)
        .ok_or_else(|| PredictError::internal("empty probability vector", "argmax of nothing"))?;

    let predicted_class = taxonomy
        .label(index)
        .ok_or_else(|| {
            PredictError::internal(
                "predicted index out of range",
                format!("index {index} for {} classes", taxonomy.len()),
            )
        })?
        .to_string();

    let entries = taxonomy
        .labels()
        .iter()
        .cloned()
        .zip(probabilities.iter().copied())
        .collect();

    Ok(Classification {
        predicted_class,
        confidence: probabilities[index],
        probabilities: ClassProbabilities::new(entries),
    })
}
