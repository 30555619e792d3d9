//! モデルストア
//!
//! 重みファイルとクラス定義ファイルからネットワークを一度だけ組み立てる。
//! 組み立てたモデルとタクソノミーはプロセスの生存期間中は変更しない。
//!
//! 読み込み順序:
//! 1. class_names.json（タクソノミー）
//! 2. 重みファイル（チェックポイント形式の判定を含む）
//! 3. 分類ヘッドの出力次元とクラス数の照合
//! 4. デバイス選択（使えなければフォールバック）
//! 5. 全パラメータの形状検証とネットワーク構築

use burn::tensor::Tensor;
use std::path::Path;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::ml::ml_model::{HeadLayout, ResNet, ResNetConfig};
use crate::ml::preprocess::PreprocessSpec;
use crate::model::checkpoint::{ExtractionStrategy, ParameterMap};
use crate::model::device::{ComputeBackend, ComputeDevice, DeviceBinding};
use crate::model::taxonomy::ClassTaxonomy;

/// アーキテクチャと前処理の組
///
/// 前処理は学習時のものと一致している必要があるため、アーキテクチャと対で固定する。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelProfile {
    pub architecture: ResNetConfig,
    pub preprocess: PreprocessSpec,
}

impl ModelProfile {
    /// ResNet18 + ImageNet 前処理（256 → 224）
    pub const fn resnet18_imagenet() -> Self {
        Self {
            architecture: ResNetConfig::resnet18(),
            preprocess: PreprocessSpec::IMAGENET_224,
        }
    }
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self::resnet18_imagenet()
    }
}

/// 読み込み済みのネットワーク（推論専用・デバイス固定）
#[derive(Debug)]
pub struct ModelHandle<B: ComputeBackend> {
    network: ResNet<B>,
    device: B::Device,
}

impl<B: ComputeBackend> ModelHandle<B> {
    /// 順伝播（勾配は追跡しない）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.forward(images)
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn num_classes(&self) -> usize {
        self.network.num_classes()
    }
}

/// モデルとタクソノミーの所有者
#[derive(Debug)]
pub struct ModelStore<B: ComputeBackend> {
    handle: ModelHandle<B>,
    taxonomy: ClassTaxonomy,
    profile: ModelProfile,
    binding: DeviceBinding,
    checkpoint_format: ExtractionStrategy,
    head_layout: HeadLayout,
}

impl<B: ComputeBackend> ModelStore<B> {
    /// ResNet18 + ImageNet 前処理で読み込む
    pub fn load(
        weights_path: &Path,
        taxonomy_path: &Path,
        device: ComputeDevice,
    ) -> Result<Self, StoreError> {
        Self::load_with_profile(weights_path, taxonomy_path, device, ModelProfile::default())
    }

    /// アーキテクチャを指定して読み込む
    pub fn load_with_profile(
        weights_path: &Path,
        taxonomy_path: &Path,
        device: ComputeDevice,
        profile: ModelProfile,
    ) -> Result<Self, StoreError> {
        info!(path = %taxonomy_path.display(), "loading class taxonomy");
        let taxonomy = ClassTaxonomy::load(taxonomy_path)?;
        info!(classes = ?taxonomy.labels(), "loaded {} classes", taxonomy.len());

        info!(path = %weights_path.display(), "loading model weights");
        let mut params = ParameterMap::load(weights_path)?;
        let checkpoint_format = params.strategy();
        info!(format = %checkpoint_format, tensors = params.len(), "weights deserialized");

        let head_layout = HeadLayout::detect(&params).ok_or_else(|| {
            StoreError::corrupt(weights_path, "no classifier head (fc.1.weight / fc.weight)")
        })?;

        let head_shape = params
            .shape(&head_layout.weight_name())
            .map(<[usize]>::to_vec)
            .unwrap_or_default();
        let &[model_outputs, _] = head_shape.as_slice() else {
            return Err(StoreError::corrupt(
                weights_path,
                format!("{} must be 2-dimensional, found {head_shape:?}", head_layout.weight_name()),
            ));
        };
        if model_outputs != taxonomy.len() {
            return Err(StoreError::ArchitectureMismatch {
                model_outputs,
                taxonomy_len: taxonomy.len(),
            });
        }

        let (device, binding) = B::bind(device);
        if binding.fell_back() {
            warn!(
                requested = %binding.requested,
                actual = %binding.actual,
                backend = B::NAME,
                "requested device is unavailable, falling back"
            );
        }

        let network = profile
            .architecture
            .build::<B>(&mut params, taxonomy.len(), head_layout, &device)
            .map_err(|e| StoreError::corrupt(weights_path, e.to_string()))?;
        params
            .finish()
            .map_err(|e| StoreError::corrupt(weights_path, e.to_string()))?;

        info!(
            architecture = %profile.architecture.name(),
            device = %binding.actual,
            backend = B::NAME,
            "model loaded"
        );

        Ok(Self {
            handle: ModelHandle { network, device },
            taxonomy,
            profile,
            binding,
            checkpoint_format,
            head_layout,
        })
    }

    pub fn handle(&self) -> &ModelHandle<B> {
        &self.handle
    }

    pub fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    /// 要求デバイスと実デバイス
    pub fn device_binding(&self) -> DeviceBinding {
        self.binding
    }

    /// 重みファイルがどの形式として解釈されたか
    pub fn checkpoint_format(&self) -> ExtractionStrategy {
        self.checkpoint_format
    }

    pub fn head_layout(&self) -> HeadLayout {
        self.head_layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        tiny_profile, write_checkpoint, write_taxonomy, TestBackend, TestDir, KIDNEY_CLASSES,
    };

    #[test]
    fn test_load_raw_mapping() {
        let dir = TestDir::new("store_raw");
        let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
        let weights = write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::Linear, None);

        let store = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &taxonomy,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap();

        assert_eq!(store.taxonomy().len(), 4);
        assert_eq!(store.handle().num_classes(), 4);
        assert_eq!(store.checkpoint_format(), ExtractionStrategy::Raw);
        assert_eq!(store.head_layout(), HeadLayout::Linear);
        assert!(!store.device_binding().fell_back());
    }

    #[test]
    fn test_load_wrapped_checkpoints() {
        for key in ["model_state_dict", "state_dict", "model"] {
            let dir = TestDir::new("store_wrapped");
            let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
            let weights =
                write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::DropoutLinear, Some(key));

            let store = ModelStore::<TestBackend>::load_with_profile(
                &weights,
                &taxonomy,
                ComputeDevice::Cpu,
                tiny_profile(),
            )
            .unwrap();

            assert_eq!(store.checkpoint_format(), ExtractionStrategy::Nested(key));
            assert_eq!(store.head_layout(), HeadLayout::DropoutLinear);
        }
    }

    #[test]
    fn test_head_dimension_mismatch() {
        let dir = TestDir::new("store_mismatch");
        let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
        let weights = write_checkpoint(&dir, &tiny_profile(), 3, HeadLayout::DropoutLinear, None);

        let err = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &taxonomy,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StoreError::ArchitectureMismatch {
                model_outputs: 3,
                taxonomy_len: 4
            }
        ));
    }

    #[test]
    fn test_missing_artifacts() {
        let dir = TestDir::new("store_missing");
        let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
        let weights = write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::Linear, None);

        let err = ModelStore::<TestBackend>::load_with_profile(
            &dir.path().join("missing.safetensors"),
            &taxonomy,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactNotFound { .. }));

        let err = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &dir.path().join("missing.json"),
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactNotFound { .. }));
    }

    #[test]
    fn test_corrupt_artifacts() {
        let dir = TestDir::new("store_corrupt");
        let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);

        let garbage = dir.path().join("garbage.safetensors");
        std::fs::write(&garbage, b"\x00\x01 not tensors").unwrap();
        let err = ModelStore::<TestBackend>::load_with_profile(
            &garbage,
            &taxonomy,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactCorrupt { .. }));

        // 幅の違う重みは形状不一致
        let mut wider = tiny_profile();
        wider.architecture.base_width = 8;
        let weights = write_checkpoint(&dir, &wider, 4, HeadLayout::Linear, None);
        let err = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &taxonomy,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactCorrupt { .. }));

        let duplicated = write_taxonomy(&dir, &["Cyst", "Cyst", "Stone", "Tumor"]);
        let weights = write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::Linear, None);
        let err = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &duplicated,
            ComputeDevice::Cpu,
            tiny_profile(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactCorrupt { .. }));
    }

    #[test]
    fn test_gpu_request_falls_back() {
        let dir = TestDir::new("store_fallback");
        let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
        let weights = write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::Linear, None);

        let store = ModelStore::<TestBackend>::load_with_profile(
            &weights,
            &taxonomy,
            ComputeDevice::Gpu,
            tiny_profile(),
        )
        .unwrap();

        let binding = store.device_binding();
        assert_eq!(binding.requested, ComputeDevice::Gpu);
        assert_eq!(binding.actual, ComputeDevice::Cpu);
        assert!(binding.fell_back());
    }
}
