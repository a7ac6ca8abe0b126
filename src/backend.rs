//! Compile-time backend selection. NdArray on the CPU unless a GPU backend
//! feature is enabled.

use burn::backend::Autodiff;

#[cfg(feature = "wgpu-backend")]
pub type InnerBackend = burn_wgpu::Wgpu;

#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
pub type InnerBackend = burn_tch::LibTorch;

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
pub type InnerBackend = burn_ndarray::NdArray<f32>;

/// The autodiff backend used for training.
pub type TrainBackend = Autodiff<InnerBackend>;

pub type Device = <InnerBackend as burn::tensor::backend::Backend>::Device;

/// Device for the configured index; the CPU backend has a single device.
pub fn device(index: usize) -> Device {
    #[cfg(feature = "wgpu-backend")]
    {
        burn_wgpu::WgpuDevice::DiscreteGpu(index)
    }
    #[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
    {
        burn_tch::LibTorchDevice::Cuda(index)
    }
    #[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
    {
        let _ = index;
        burn_ndarray::NdArrayDevice::Cpu
    }
}

pub fn backend_name() -> &'static str {
    #[cfg(feature = "wgpu-backend")]
    {
        "WGPU (GPU)"
    }
    #[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
    {
        "LibTorch (CUDA)"
    }
    #[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
    {
        "NdArray (CPU)"
    }
}
