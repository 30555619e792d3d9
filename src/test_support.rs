//! テスト用のヘルパー（小さな ResNet の重み・クラス定義・画像を生成する）

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use safetensors::{tensor::TensorView, Dtype};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ml::ml_model::{HeadLayout, ResNetConfig};
use crate::ml::preprocess::PreprocessSpec;
use crate::model::checkpoint::ParameterMap;
use crate::model::{ComputeDevice, ModelProfile, ModelStore};

pub type TestBackend = burn_ndarray::NdArray<f32>;

pub const KIDNEY_CLASSES: [&str; 4] = ["Cyst", "Normal", "Stone", "Tumor"];

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// 1 ブロック・幅 4・入力 32x32 の小さな構成
pub fn tiny_profile() -> ModelProfile {
    ModelProfile {
        architecture: ResNetConfig {
            stage_blocks: [1, 1, 1, 1],
            base_width: 4,
        },
        preprocess: PreprocessSpec::new(40, 32),
    }
}

/// テストごとの一時ディレクトリ（Drop で削除）
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(name: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "kidney_classifier_{}_{}_{}",
            name,
            std::process::id(),
            id
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unique_file(&self, stem: &str, extension: &str) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        self.path.join(format!("{stem}_{id}.{extension}"))
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.path).ok();
    }
}

/// 決定的な乱数で PyTorch 形式の state dict を作る
pub fn synthetic_state_dict(
    config: &ResNetConfig,
    num_classes: usize,
    head: HeadLayout,
    seed: u64,
) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);

    config
        .parameter_shapes(num_classes, head)
        .into_iter()
        .map(|(name, shape)| {
            let len = shape.iter().product::<usize>();
            let values = (0..len)
                .map(|_| {
                    if name.ends_with("running_var") {
                        rng.gen_range(0.5..1.5)
                    } else if name.ends_with("bn1.weight")
                        || name.ends_with("bn2.weight")
                        || name.ends_with("downsample.1.weight")
                    {
                        rng.gen_range(0.8..1.2)
                    } else {
                        rng.gen_range(-0.3..0.3)
                    }
                })
                .collect();
            (name, shape, values)
        })
        .collect()
}

/// state dict を safetensors にシリアライズ（`prefix` があればチェックポイント形式）
pub fn serialize_state_dict(
    entries: &[(String, Vec<usize>, Vec<f32>)],
    prefix: Option<&str>,
) -> Vec<u8> {
    let mut named: Vec<(String, Vec<usize>, Vec<u8>)> = entries
        .iter()
        .map(|(name, shape, values)| {
            let name = match prefix {
                Some(p) => format!("{p}.{name}"),
                None => name.clone(),
            };
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, shape.clone(), bytes)
        })
        .collect();

    // チェックポイント形式には学習状態などのエントリも入っている
    if prefix.is_some() {
        named.push(("epoch".to_string(), vec![1], 25.0f32.to_le_bytes().to_vec()));
        named.push((
            "optimizer_state_dict.lr".to_string(),
            vec![1],
            1e-3f32.to_le_bytes().to_vec(),
        ));
    }

    let views: Vec<(String, TensorView)> = named
        .iter()
        .map(|(name, shape, bytes)| {
            (
                name.clone(),
                TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            )
        })
        .collect();

    safetensors::serialize(views, &None).unwrap()
}

/// メモリ上のパラメータ辞書
pub fn synthetic_parameters(
    config: &ResNetConfig,
    num_classes: usize,
    head: HeadLayout,
    seed: u64,
) -> ParameterMap {
    let entries = synthetic_state_dict(config, num_classes, head, seed);
    ParameterMap::from_safetensors(&serialize_state_dict(&entries, None)).unwrap()
}

/// 重みファイルを書き出す
pub fn write_checkpoint(
    dir: &TestDir,
    profile: &ModelProfile,
    num_classes: usize,
    head: HeadLayout,
    prefix: Option<&str>,
) -> PathBuf {
    let entries = synthetic_state_dict(&profile.architecture, num_classes, head, 42);
    let path = dir.unique_file("weights", "safetensors");
    std::fs::write(&path, serialize_state_dict(&entries, prefix)).unwrap();
    path
}

/// class_names.json を書き出す
pub fn write_taxonomy(dir: &TestDir, labels: &[&str]) -> PathBuf {
    let path = dir.unique_file("class_names", "json");
    let document = serde_json::json!({ "classes": labels });
    std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
    path
}

/// 4 クラスの小さなモデルを読み込む
pub fn load_tiny_store() -> Arc<ModelStore<TestBackend>> {
    let dir = TestDir::new("tiny_store");
    let taxonomy = write_taxonomy(&dir, &KIDNEY_CLASSES);
    let weights = write_checkpoint(&dir, &tiny_profile(), 4, HeadLayout::DropoutLinear, None);

    let store = ModelStore::load_with_profile(&weights, &taxonomy, ComputeDevice::Cpu, tiny_profile())
        .unwrap();
    Arc::new(store)
}

/// 単色画像
pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
}

/// 縞模様の画像（クラス確率が偏るように）
pub fn striped_image(width: u32, height: u32) -> DynamicImage {
    let image = RgbImage::from_fn(width, height, |x, y| {
        if (x / 4 + y / 3) % 2 == 0 {
            Rgb([230, 40, 90])
        } else {
            Rgb([15, 180, 60])
        }
    });
    DynamicImage::ImageRgb8(image)
}

/// PNG にエンコード
pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}
