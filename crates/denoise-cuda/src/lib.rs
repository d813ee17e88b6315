// CUDA Backend — NVIDIA GPU execution of the denoise operators
//
// This crate implements the denoise Device trait on NVIDIA GPUs. Nothing is
// linked at build time: the CUDA driver, cuDNN and NVRTC are opened with
// libloading when a device is created, so the crate builds on machines
// without a CUDA toolkit and CudaDevice::new reports UnsupportedHardware there.
//
// ARCHITECTURE:
// - CudaDevice wraps Arc<CudaEngine> (primary context + stream + cuDNN handle
//   + compiled kernel module + allocator)
// - CudaTensor binds a raw device pointer; cuDNN descriptors are built by
//   the operators that need them
// - Convolution, bias, ReLU and pooling go through cuDNN; the algorithm is
//   chosen at finalize() time against the bound scratch size
// - Upsample and the image operators are NVRTC-compiled kernels, with f32
//   and f16 variants
//
// USAGE:
//   let device = CudaDevice::new(DeviceConfig::default().device_ordinal(0))?;
//   let conv = device.new_conv(desc)?;

pub mod allocator;
mod autoexposure;
pub mod context;
mod conv;
pub mod cudnn;
pub mod device;
pub mod driver;
mod image_copy;
mod input_process;
pub mod kernels;
pub mod nvrtc;
mod output_process;
mod pool;
pub mod tensor;
mod upsample;

pub use allocator::CudaAllocator;
pub use autoexposure::CudaAutoexposure;
pub use conv::CudaConv;
pub use device::{CudaDevice, CudaEngine};
pub use driver::is_available;
pub use image_copy::CudaImageCopy;
pub use input_process::CudaInputProcess;
pub use output_process::CudaOutputProcess;
pub use pool::CudaPool;
pub use tensor::{cuda_tensor, CudaTensor};
pub use upsample::CudaUpsample;
