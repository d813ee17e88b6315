// CPU Backend — host execution of the denoise operators
//
// This crate implements the denoise Device trait on the host. Memory comes from
// a tracking allocator, work is ordered by a single-threaded queue, and every
// kernel fans out over a rayon thread pool.
//
// ARCHITECTURE:
// - CpuDevice wraps Arc<CpuEngine> (allocator + queue + rayon pool)
// - CpuTensor binds its memory through a dnn::Memory (native descriptor and
//   data handle); tensors the dnn layer cannot describe stay usable as memory
//   but make operators unsupported
// - Convolution runs through dnn::ConvPrimitive, which picks between a direct
//   and an im2col algorithm at finalize() time
// - Pool, upsample and the image operators are plain element kernels
//
// USAGE:
//   let device = CpuDevice::new(DeviceConfig::default().num_threads(4))?;
//   let conv = device.new_conv(desc)?;

pub mod allocator;
mod autoexposure;
mod conv;
pub mod device;
pub mod dnn;
mod image_copy;
mod input_process;
pub mod kernels;
mod output_process;
mod pool;
pub mod queue;
pub mod tensor;
mod upsample;

pub use allocator::{AllocStats, HostAllocator};
pub use autoexposure::CpuAutoexposure;
pub use conv::CpuConv;
pub use device::{CpuDevice, CpuEngine};
pub use image_copy::CpuImageCopy;
pub use input_process::CpuInputProcess;
pub use kernels::SyncPtr;
pub use output_process::CpuOutputProcess;
pub use pool::CpuPool;
pub use queue::HostQueue;
pub use tensor::{cpu_tensor, CpuTensor};
pub use upsample::CpuUpsample;
