//! 分類ネットワークの定義
//!
//! BasicBlock 構成の ResNet（ResNet18 など）を、読み込んだパラメータ辞書から組み立てる。
//! BatchNorm は読み込み時にチャネルごとの scale/shift に畳み込むため、
//! 組み立てたネットワークには学習時の挙動が存在しない（推論専用）。

use burn::{
    nn::{
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, module::conv2d, ops::ConvOptions, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::model::checkpoint::{HostTensor, ParameterError, ParameterMap};

/// BatchNorm の epsilon（学習時のデフォルト値と同じ）
pub const BATCH_NORM_EPSILON: f32 = 1e-5;

/// 分類ヘッドのパラメータ名の形式
///
/// 試行順は [`HEAD_LAYOUTS`] の通り。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeadLayout {
    /// `fc = Sequential(Dropout, Linear)` で学習したもの（`fc.1.weight`）
    DropoutLinear,
    /// 標準の全結合層（`fc.weight`）
    Linear,
}

pub const HEAD_LAYOUTS: [HeadLayout; 2] = [HeadLayout::DropoutLinear, HeadLayout::Linear];

impl HeadLayout {
    pub fn prefix(&self) -> &'static str {
        match self {
            HeadLayout::DropoutLinear => "fc.1",
            HeadLayout::Linear => "fc",
        }
    }

    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.prefix())
    }

    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.prefix())
    }

    /// パラメータ辞書に存在する最初の形式
    pub fn detect(params: &ParameterMap) -> Option<HeadLayout> {
        HEAD_LAYOUTS
            .iter()
            .copied()
            .find(|layout| params.contains(&layout.weight_name()))
    }
}

/// ResNet の構成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// 各ステージの BasicBlock 数
    pub stage_blocks: [usize; 4],
    /// 最初のステージのチャネル数（以降 2 倍ずつ）
    pub base_width: usize,
}

/// 1 ブロック分の配置情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    /// 例: `layer2.0`
    pub prefix: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
}

impl BlockSpec {
    pub fn has_downsample(&self) -> bool {
        self.stride != 1 || self.in_channels != self.out_channels
    }
}

impl ResNetConfig {
    pub const fn resnet18() -> Self {
        Self {
            stage_blocks: [2, 2, 2, 2],
            base_width: 64,
        }
    }

    /// 表示名
    pub fn name(&self) -> String {
        match (self.stage_blocks, self.base_width) {
            ([2, 2, 2, 2], 64) => "ResNet18".to_string(),
            ([3, 4, 6, 3], 64) => "ResNet34".to_string(),
            (blocks, width) => format!("ResNet(blocks={blocks:?}, width={width})"),
        }
    }

    /// 各ステージの出力チャネル数
    pub fn stage_widths(&self) -> [usize; 4] {
        let w = self.base_width;
        [w, w * 2, w * 4, w * 8]
    }

    /// プーリング後の特徴次元（分類ヘッドの入力次元）
    pub fn feature_dim(&self) -> usize {
        self.stage_widths()[3]
    }

    /// ブロックの並び（`layer1.0` から順に）
    pub fn blocks(&self) -> Vec<BlockSpec> {
        let widths = self.stage_widths();
        let mut in_channels = self.base_width;
        let mut blocks = Vec::new();

        for (stage, (&count, &out_channels)) in self.stage_blocks.iter().zip(widths.iter()).enumerate() {
            for index in 0..count {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                blocks.push(BlockSpec {
                    prefix: format!("layer{}.{}", stage + 1, index),
                    in_channels,
                    out_channels,
                    stride,
                });
                in_channels = out_channels;
            }
        }

        blocks
    }

    /// 期待されるパラメータ名と形状の一覧（PyTorch の命名規則）
    pub fn parameter_shapes(&self, num_classes: usize, head: HeadLayout) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();

        let push_bn = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str, channels: usize| {
            for field in ["weight", "bias", "running_mean", "running_var"] {
                shapes.push((format!("{prefix}.{field}"), vec![channels]));
            }
        };

        shapes.push(("conv1.weight".to_string(), vec![self.base_width, 3, 7, 7]));
        push_bn(&mut shapes, "bn1", self.base_width);

        for block in self.blocks() {
            let p = &block.prefix;
            shapes.push((
                format!("{p}.conv1.weight"),
                vec![block.out_channels, block.in_channels, 3, 3],
            ));
            push_bn(&mut shapes, &format!("{p}.bn1"), block.out_channels);
            shapes.push((
                format!("{p}.conv2.weight"),
                vec![block.out_channels, block.out_channels, 3, 3],
            ));
            push_bn(&mut shapes, &format!("{p}.bn2"), block.out_channels);

            if block.has_downsample() {
                shapes.push((
                    format!("{p}.downsample.0.weight"),
                    vec![block.out_channels, block.in_channels, 1, 1],
                ));
                push_bn(&mut shapes, &format!("{p}.downsample.1"), block.out_channels);
            }
        }

        shapes.push((head.weight_name(), vec![num_classes, self.feature_dim()]));
        shapes.push((head.bias_name(), vec![num_classes]));

        shapes
    }

    /// パラメータ辞書からネットワークを組み立てる
    ///
    /// 使ったパラメータは `params` から取り除かれる。
    pub fn build<B: Backend>(
        &self,
        params: &mut ParameterMap,
        num_classes: usize,
        head: HeadLayout,
        device: &B::Device,
    ) -> Result<ResNet<B>, ParameterError> {
        let mut loader = ParameterLoader::<B> { params, device };

        // Stem: 7x7 conv (stride 2, padding 3) + BN + ReLU + 3x3 max pool (stride 2)
        let stem = loader.conv("conv1.weight", [self.base_width, 3, 7, 7], 2, 3)?;
        let stem_norm = loader.batch_norm("bn1", self.base_width)?;

        let mut blocks = Vec::new();
        for spec in self.blocks() {
            let p = &spec.prefix;
            let conv1 = loader.conv(
                &format!("{p}.conv1.weight"),
                [spec.out_channels, spec.in_channels, 3, 3],
                spec.stride,
                1,
            )?;
            let bn1 = loader.batch_norm(&format!("{p}.bn1"), spec.out_channels)?;
            let conv2 = loader.conv(
                &format!("{p}.conv2.weight"),
                [spec.out_channels, spec.out_channels, 3, 3],
                1,
                1,
            )?;
            let bn2 = loader.batch_norm(&format!("{p}.bn2"), spec.out_channels)?;

            let downsample = if spec.has_downsample() {
                let conv = loader.conv(
                    &format!("{p}.downsample.0.weight"),
                    [spec.out_channels, spec.in_channels, 1, 1],
                    spec.stride,
                    0,
                )?;
                let norm = loader.batch_norm(&format!("{p}.downsample.1"), spec.out_channels)?;
                Some((conv, norm))
            } else {
                None
            };

            blocks.push(BasicBlock {
                conv1,
                bn1,
                conv2,
                bn2,
                downsample,
            });
        }

        // 全結合層: PyTorch は [out, in] で保存しているので転置して [in, out] で保持
        let feature_dim = self.feature_dim();
        let weight = loader.take(&head.weight_name(), &[num_classes, feature_dim])?;
        let bias = loader.take(&head.bias_name(), &[num_classes])?;
        let head_weight = Tensor::<B, 1>::from_floats(weight.values.as_slice(), device)
            .reshape([num_classes, feature_dim])
            .transpose();
        let head_bias = Tensor::<B, 1>::from_floats(bias.values.as_slice(), device)
            .reshape([1, num_classes]);

        Ok(ResNet {
            stem,
            stem_norm,
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks,
            head_weight,
            head_bias,
            activation: Relu::new(),
            num_classes,
        })
    }
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet18()
    }
}

struct ParameterLoader<'a, B: Backend> {
    params: &'a mut ParameterMap,
    device: &'a B::Device,
}

impl<B: Backend> ParameterLoader<'_, B> {
    fn take(&mut self, name: &str, shape: &[usize]) -> Result<HostTensor, ParameterError> {
        self.params.take(name, shape)
    }

    fn conv(
        &mut self,
        name: &str,
        shape: [usize; 4],
        stride: usize,
        padding: usize,
    ) -> Result<FrozenConv<B>, ParameterError> {
        let weight = self.take(name, &shape)?;
        Ok(FrozenConv {
            weight: Tensor::<B, 1>::from_floats(weight.values.as_slice(), self.device).reshape(shape),
            stride,
            padding,
        })
    }

    /// BN の 4 つのパラメータを scale/shift に畳み込む
    fn batch_norm(&mut self, prefix: &str, channels: usize) -> Result<FrozenBatchNorm<B>, ParameterError> {
        let gamma = self.take(&format!("{prefix}.weight"), &[channels])?;
        let beta = self.take(&format!("{prefix}.bias"), &[channels])?;
        let mean = self.take(&format!("{prefix}.running_mean"), &[channels])?;
        let var = self.take(&format!("{prefix}.running_var"), &[channels])?;

        let mut scale = Vec::with_capacity(channels);
        let mut shift = Vec::with_capacity(channels);
        for c in 0..channels {
            let s = gamma.values[c] / (var.values[c] + BATCH_NORM_EPSILON).sqrt();
            scale.push(s);
            shift.push(beta.values[c] - mean.values[c] * s);
        }

        Ok(FrozenBatchNorm {
            scale: Tensor::<B, 1>::from_floats(scale.as_slice(), self.device).reshape([1, channels, 1, 1]),
            shift: Tensor::<B, 1>::from_floats(shift.as_slice(), self.device).reshape([1, channels, 1, 1]),
        })
    }
}

/// バイアスなしの畳み込み（重み固定）
#[derive(Debug)]
struct FrozenConv<B: Backend> {
    weight: Tensor<B, 4>,
    stride: usize,
    padding: usize,
}

impl<B: Backend> FrozenConv<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new(
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        );
        conv2d(x, self.weight.clone(), None, options)
    }
}

/// 畳み込み済みの BatchNorm（y = x * scale + shift）
#[derive(Debug)]
struct FrozenBatchNorm<B: Backend> {
    scale: Tensor<B, 4>,
    shift: Tensor<B, 4>,
}

impl<B: Backend> FrozenBatchNorm<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x.mul(self.scale.clone()).add(self.shift.clone())
    }
}

#[derive(Debug)]
struct BasicBlock<B: Backend> {
    conv1: FrozenConv<B>,
    bn1: FrozenBatchNorm<B>,
    conv2: FrozenConv<B>,
    bn2: FrozenBatchNorm<B>,
    downsample: Option<(FrozenConv<B>, FrozenBatchNorm<B>)>,
}

impl<B: Backend> BasicBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, activation: &Relu) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some((conv, norm)) => norm.forward(conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = self.bn1.forward(self.conv1.forward(x));
        let out = activation.forward(out);
        let out = self.bn2.forward(self.conv2.forward(out));

        activation.forward(out.add(identity))
    }
}

/// 推論専用の ResNet
///
/// # アーキテクチャ
/// - Conv 7x7 (stride 2) + BN + ReLU + MaxPool 3x3 (stride 2)
/// - BasicBlock x N（4 ステージ、2 ステージ目以降の先頭で解像度 1/2）
/// - Global Average Pooling
/// - FC: feature_dim -> num_classes
#[derive(Debug)]
pub struct ResNet<B: Backend> {
    stem: FrozenConv<B>,
    stem_norm: FrozenBatchNorm<B>,
    pool: MaxPool2d,
    blocks: Vec<BasicBlock<B>>,
    head_weight: Tensor<B, 2>,
    head_bias: Tensor<B, 2>,
    activation: Relu,
    num_classes: usize,
}

impl<B: Backend> ResNet<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, height, width]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.stem_norm.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);

        let x = self
            .blocks
            .iter()
            .fold(x, |x, block| block.forward(x, &self.activation));

        // Global Average Pooling + Flatten
        let [batch_size, channels, _, _] = x.dims();
        let x = x.mean_dim(3).mean_dim(2).reshape([batch_size, channels]);

        x.matmul(self.head_weight.clone()).add(self.head_bias.clone())
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}
