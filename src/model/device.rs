//! 計算デバイスの選択
//!
//! 要求されたデバイスが使えない場合はデフォルトへフォールバックし、
//! その結果を [`DeviceBinding`] として呼び出し側に返す。

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    /// CPU
    #[default]
    Cpu,
    /// GPU（CUDA / WGPU）
    Gpu,
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeDevice::Cpu),
            "gpu" | "cuda" | "wgpu" => Ok(ComputeDevice::Gpu),
            other => Err(format!("unknown compute device: {other}")),
        }
    }
}

/// 要求デバイスと実際に使われたデバイスの組
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceBinding {
    pub requested: ComputeDevice,
    pub actual: ComputeDevice,
}

impl DeviceBinding {
    /// 要求どおりのデバイスが使えなかったか
    pub fn fell_back(&self) -> bool {
        self.requested != self.actual
    }
}

/// 推論に使えるバックエンド
///
/// バックエンドごとに「要求デバイス → 実デバイス」の対応を決める。
pub trait ComputeBackend: Backend {
    /// バックエンド名（ログ・モデル情報用）
    const NAME: &'static str;

    fn bind(requested: ComputeDevice) -> (Self::Device, DeviceBinding);
}

impl ComputeBackend for burn_ndarray::NdArray<f32> {
    const NAME: &'static str = "ndarray";

    fn bind(requested: ComputeDevice) -> (Self::Device, DeviceBinding) {
        // NdArray は CPU のみ
        let binding = DeviceBinding {
            requested,
            actual: ComputeDevice::Cpu,
        };
        (burn_ndarray::NdArrayDevice::Cpu, binding)
    }
}

/// デバイス上にテンソルを作って読み戻せるか
///
/// アダプタが見つからない場合、バックエンドは初回のテンソル作成で panic する。
pub fn device_usable<B: Backend>(device: &B::Device) -> bool {
    let readback = catch_unwind(AssertUnwindSafe(|| {
        Tensor::<B, 1>::from_floats([1.0f32], device)
            .into_data()
            .to_vec::<f32>()
    }));
    matches!(readback, Ok(Ok(values)) if values == [1.0])
}

#[cfg(feature = "wgpu")]
impl ComputeBackend for burn_wgpu::Wgpu {
    const NAME: &'static str = "wgpu";

    fn bind(requested: ComputeDevice) -> (Self::Device, DeviceBinding) {
        use burn_wgpu::WgpuDevice;

        let actual = match requested {
            ComputeDevice::Gpu if device_usable::<Self>(&WgpuDevice::DefaultDevice) => {
                ComputeDevice::Gpu
            }
            ComputeDevice::Gpu => {
                tracing::warn!("no usable GPU adapter found, using the wgpu CPU device");
                ComputeDevice::Cpu
            }
            ComputeDevice::Cpu => ComputeDevice::Cpu,
        };
        let device = match actual {
            ComputeDevice::Gpu => WgpuDevice::DefaultDevice,
            ComputeDevice::Cpu => WgpuDevice::Cpu,
        };
        (device, DeviceBinding { requested, actual })
    }
}

/// サーバー・CLI が使うバックエンド
#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn_ndarray::NdArray<f32>;

/// サーバー・CLI が使うバックエンド
#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn_wgpu::Wgpu;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_names() {
        assert_eq!("cpu".parse::<ComputeDevice>(), Ok(ComputeDevice::Cpu));
        assert_eq!("CUDA".parse::<ComputeDevice>(), Ok(ComputeDevice::Gpu));
        assert_eq!(" wgpu ".parse::<ComputeDevice>(), Ok(ComputeDevice::Gpu));
        assert!("tpu".parse::<ComputeDevice>().is_err());
    }

    #[test]
    fn test_ndarray_falls_back_to_cpu() {
        let (_, binding) = <burn_ndarray::NdArray<f32> as ComputeBackend>::bind(ComputeDevice::Gpu);
        assert_eq!(binding.actual, ComputeDevice::Cpu);
        assert!(binding.fell_back());

        let (_, binding) = <burn_ndarray::NdArray<f32> as ComputeBackend>::bind(ComputeDevice::Cpu);
        assert!(!binding.fell_back());
    }

    #[test]
    fn test_ndarray_device_is_usable() {
        assert!(device_usable::<burn_ndarray::NdArray<f32>>(&burn_ndarray::NdArrayDevice::Cpu));
    }

    #[cfg(feature = "wgpu")]
    #[test]
    fn test_wgpu_binding_follows_adapter_availability() {
        use burn_wgpu::{Wgpu, WgpuDevice};

        let (device, binding) = <Wgpu as ComputeBackend>::bind(ComputeDevice::Gpu);
        let gpu_available = device_usable::<Wgpu>(&WgpuDevice::DefaultDevice);
        assert_eq!(binding.requested, ComputeDevice::Gpu);
        assert_eq!(binding.fell_back(), !gpu_available);
        if gpu_available {
            assert_eq!(device, WgpuDevice::DefaultDevice);
        } else {
            assert_eq!(device, WgpuDevice::Cpu);
        }

        let (device, binding) = <Wgpu as ComputeBackend>::bind(ComputeDevice::Cpu);
        assert_eq!(device, WgpuDevice::Cpu);
        assert!(!binding.fell_back());
    }

    #[test]
    fn test_device_display() {
        assert_eq!(format!("{}", ComputeDevice::Cpu), "cpu");
        assert_eq!(format!("{}", ComputeDevice::Gpu), "gpu");
    }
}
