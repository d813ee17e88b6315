//! # denoise
//!
//! Backend abstraction core of a neural image denoiser.
//!
//! This is the top-level facade crate that re-exports everything an
//! inference-graph builder needs.
//!
//! ## Usage
//!
//! ```rust
//! use denoise::prelude::*;
//!
//! let device = denoise::new_device(DeviceKind::Cpu, DeviceConfig::default()).unwrap();
//! assert_eq!(device.name(), "cpu");
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `denoise-core` | Buffer, Tensor, Image, operator traits, Device trait, errors |
//! | `denoise-cpu` | Host backend: rayon kernels behind an ordered queue |
//! | `denoise-cuda` | NVIDIA backend: cuDNN and NVRTC kernels (feature-gated) |
//!
//! ## Modules
//!
//! - [`device`] — `DeviceKind` and backend selection
//! - [`scratch`] — one scratch tensor shared by a group of operators
//! - [`logging`] — a `tracing-subscriber` setup for the library's events

/// Re-export core types.
pub use denoise_core::{
    ceil_div, Activation, Allocator, Autoexposure, Buffer, Conv, ConvDesc, DataType, Device,
    DeviceConfig, Element, Error, ErrorCode, HostFn, Image, ImageCopy, ImageDesc, ImageFormat,
    InputImages, InputProcess, InputProcessDesc, MemoryBinding, Op, OpState, OutputProcess,
    OutputProcessDesc, Pool, PoolDesc, Result, Storage, Tensor, TensorDesc, TensorLayout, Tile,
    TransferFunction, TransferKind, Upsample, UpsampleDesc, WorkDim,
};

/// Tensor read/write helpers.
pub use denoise_core::tensor::{read_tensor, write_tensor};

/// Re-export the CPU backend.
pub use denoise_cpu::{CpuDevice, CpuTensor};

/// Re-export the CUDA backend (requires the `cuda` feature).
#[cfg(feature = "cuda")]
pub use denoise_cuda::{CudaDevice, CudaTensor};

/// Backend selection.
pub mod device;

/// Logging setup.
pub mod logging;

/// Shared scratch planning.
pub mod scratch;

pub use device::{new_device, new_device_from_env, DeviceKind};
pub use scratch::ScratchPlan;

pub mod prelude {
    pub use crate::device::{new_device, DeviceKind};
    pub use crate::scratch::ScratchPlan;
    pub use denoise_core::{
        Activation, ConvDesc, DataType, Device, DeviceConfig, Error, Image, ImageDesc,
        ImageFormat, InputProcessDesc, Op, OpState, OutputProcessDesc, PoolDesc, Result, Storage,
        Tensor, TensorDesc, TensorLayout, Tile, TransferFunction, TransferKind, UpsampleDesc,
    };
}
