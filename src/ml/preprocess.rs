//! 画像前処理
//!
//! 学習時と完全に同じ変換を行う必要がある:
//! Resize (正方形) → CenterCrop → [0, 1] スケーリング → チャネルごとの正規化

use image::{imageops::FilterType, DynamicImage, ImageResult};
use serde::Serialize;

/// ImageNet の平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet の標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 前処理の定義
///
/// 読み込んだ重みと 1 対 1 で対応する固定値。リクエストごとに変更しない。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PreprocessSpec {
    /// リサイズ後の一辺（ピクセル）
    pub resize: u32,
    /// センタークロップ後の一辺（= ネットワーク入力サイズ）
    pub crop: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl PreprocessSpec {
    /// 256 → 224 の ImageNet 前処理
    pub const IMAGENET_224: PreprocessSpec = PreprocessSpec {
        resize: 256,
        crop: 224,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    };

    /// ImageNet の正規化定数で作成
    pub const fn new(resize: u32, crop: u32) -> Self {
        Self {
            resize,
            crop,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// ネットワーク入力の形状 [1, 3, H, W]
    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.crop as usize, self.crop as usize]
    }

    /// 任意のエンコード形式の画像をデコード
    pub fn decode(bytes: &[u8]) -> ImageResult<DynamicImage> {
        image::load_from_memory(bytes)
    }

    /// 前処理を適用
    ///
    /// # 戻り値
    /// - 正規化された RGB 画像データ (C, H, W) の順で平坦化
    /// - 幅または高さが 0 の画像は None
    pub fn apply(&self, image: &DynamicImage) -> Option<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }

        // グレースケール・アルファ付きなどは RGB に変換（アルファは捨てる）
        let rgb = image.to_rgb8();

        // クロップより小さいリサイズは定義上ありえないので揃える
        let resize = self.resize.max(self.crop);
        let resized = image::imageops::resize(&rgb, resize, resize, FilterType::Triangle);

        // 余白が奇数のときは偶数丸め（torchvision の CenterCrop と同じ位置）
        let offset = ((resize - self.crop) as f64 / 2.0).round_ties_even() as u32;
        let crop = self.crop;

        let mut data = Vec::with_capacity(3 * (crop as usize) * (crop as usize));

        for channel in 0..3 {
            for y in 0..crop {
                for x in 0..crop {
                    let pixel = resized.get_pixel(offset + x, offset + y);
                    let value = pixel[channel] as f32 / 255.0;
                    let normalized = (value - self.mean[channel]) / self.std[channel];
                    data.push(normalized);
                }
            }
        }

        Some(data)
    }
}

impl Default for PreprocessSpec {
    fn default() -> Self {
        Self::IMAGENET_224
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_output_length_and_shape() {
        let spec = PreprocessSpec::IMAGENET_224;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 180, Rgb([10, 20, 30])));
        let data = spec.apply(&image).unwrap();
        assert_eq!(data.len(), 3 * 224 * 224);
        assert_eq!(spec.input_shape(), [1, 3, 224, 224]);
    }

    #[test]
    fn test_normalization_constants() {
        let spec = PreprocessSpec::new(8, 4);
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])));
        let data = spec.apply(&white).unwrap();

        // 単色画像はリサイズ後も同じ値
        for channel in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
            let plane = &data[channel * 16..(channel + 1) * 16];
            assert!(plane.iter().all(|v| (v - expected).abs() < 1e-5));
        }
    }

    #[test]
    fn test_center_crop_offset() {
        // 左半分が黒・右半分が白の 6x6 画像。6 → 2 のクロップで境界の 2 列を取る
        let mut image = RgbImage::new(6, 6);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            *pixel = if x < 3 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) };
        }
        let spec = PreprocessSpec {
            resize: 6,
            crop: 2,
            mean: [0.0; 3],
            std: [1.0; 3],
        };
        let data = spec.apply(&DynamicImage::ImageRgb8(image)).unwrap();
        // offset = 2 → x = 2 (黒), x = 3 (白)
        assert!(data[0] < 0.01);
        assert!(data[1] > 0.99);
    }

    #[test]
    fn test_center_crop_odd_margin_rounds_to_even() {
        // 7 → 2 は余白 5、offset = round(2.5) = 2（偶数丸め）
        let mut image = RgbImage::from_pixel(7, 7, Rgb([255, 255, 255]));
        for y in 0..7 {
            image.put_pixel(2, y, Rgb([0, 0, 0]));
        }
        let spec = PreprocessSpec {
            resize: 7,
            crop: 2,
            mean: [0.0; 3],
            std: [1.0; 3],
        };
        let data = spec.apply(&DynamicImage::ImageRgb8(image)).unwrap();
        assert!(data[0] < 0.01);
        assert!(data[1] > 0.99);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let spec = PreprocessSpec::new(8, 4);
        assert!(spec.apply(&DynamicImage::new_rgb8(0, 0)).is_none());
        assert!(spec.apply(&DynamicImage::new_rgb8(5, 0)).is_none());
    }

    #[test]
    fn test_grayscale_and_alpha_are_converted() {
        let spec = PreprocessSpec::new(8, 4);

        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 9, Luma([128])));
        assert_eq!(spec.apply(&gray).unwrap().len(), 3 * 16);

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(5, 5, Rgba([0, 0, 0, 0])));
        let black = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 5, Rgb([0, 0, 0])));
        assert_eq!(spec.apply(&rgba), spec.apply(&black));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PreprocessSpec::decode(b"not an image").is_err());
    }
}
