//! Compile-time backend selection
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (default)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//! - `cuda`: Native CUDA backend (NVIDIA GPUs only)
//!
//! With `fusion` enabled, burn wraps the GPU backends in its kernel-fusion
//! decorator.

#[cfg(feature = "ndarray")]
pub use burn::backend::ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn::backend::wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn::backend::cuda::{Cuda, CudaDevice};

/// Type alias for the default backend when using cuda feature
#[cfg(feature = "cuda")]
pub type DefaultBackend = Cuda;

/// Type alias for the default backend when using wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type DefaultBackend = Wgpu;

/// Type alias for the default backend when using ndarray feature
#[cfg(all(feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
pub type DefaultBackend = NdArray;

/// Get the default device for the enabled backend
#[cfg(feature = "cuda")]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Names of the backends compiled into this build
pub fn compiled_backends() -> Vec<&'static str> {
    let mut names = Vec::new();
    if cfg!(feature = "cuda") {
        names.push("cuda");
    }
    if cfg!(feature = "wgpu") {
        names.push("wgpu");
    }
    if cfg!(feature = "ndarray") {
        names.push("ndarray");
    }
    if cfg!(feature = "fusion") {
        names.push("fusion");
    }
    names
}

#[cfg(test)]
mod tests {
    #[cfg(any(feature = "ndarray", feature = "wgpu", feature = "cuda"))]
    use super::*;

    #[test]
    #[cfg(any(feature = "ndarray", feature = "wgpu", feature = "cuda"))]
    fn test_default_device() {
        let _device = default_device();
        assert!(!compiled_backends().is_empty());
    }
}
