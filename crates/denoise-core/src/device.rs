use std::sync::Arc;

use crate::buffer::{Allocator, Buffer};
use crate::config::DeviceConfig;
use crate::dtype::DataType;
use crate::error::Result;
use crate::image::ImageDesc;
use crate::layout::TensorLayout;
use crate::op::{Autoexposure, Conv, ImageCopy, InputProcess, OutputProcess, Pool, Upsample};
use crate::op_desc::{ConvDesc, InputProcessDesc, OutputProcessDesc, PoolDesc, UpsampleDesc};
use crate::storage::Storage;
use crate::tensor::Tensor;
use crate::tensor_desc::TensorDesc;

// Device — one execution backend (CPU, CUDA, ...)
//
// A device is a factory for everything that touches its memory or its
// queue: buffers, tensors, and the seven operator kinds. Each backend crate
// implements this trait; callers hold the device as Arc<dyn Device> and
// never see the concrete type.
//
// EXECUTION MODEL:
//
//   Every device owns exactly one ordered queue. Operator run() calls and
//   run_host_func_async() enqueue work and return immediately; work executes
//   in submission order. wait() blocks until everything submitted so far has
//   completed and reports the first error raised by queued work since the
//   previous wait().
//
// A device is created in a fully initialised state or not at all; errors
// from the constructor are fatal for that device.

/// Host function enqueued on a device queue.
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

/// An execution backend.
pub trait Device: Send + Sync {
    /// Human readable name, e.g. "cpu" or "cuda:0".
    fn name(&self) -> String;

    fn config(&self) -> &DeviceConfig;

    /// The allocator behind this device's buffers.
    fn allocator(&self) -> Arc<dyn Allocator>;

    /// Storage class used for tensors and scratch when none is specified.
    fn default_storage(&self) -> Storage;

    /// Preferred activation layout of this device.
    fn tensor_layout(&self) -> TensorLayout;

    /// Weight layout matching [`Device::tensor_layout`].
    fn weight_layout(&self) -> TensorLayout;

    /// Preferred element type for activations.
    fn tensor_data_type(&self) -> DataType;

    fn malloc(&self, byte_size: usize, storage: Storage) -> Result<*mut u8> {
        self.allocator().malloc(byte_size, storage)
    }

    fn free(&self, ptr: *mut u8, storage: Storage) {
        self.allocator().free(ptr, storage)
    }

    fn memcpy(&self, dst: *mut u8, src: *const u8, byte_size: usize) -> Result<()> {
        self.allocator().memcpy(dst, src, byte_size)
    }

    fn pointer_storage(&self, ptr: *const u8) -> Storage {
        self.allocator().pointer_storage(ptr)
    }

    fn new_buffer(&self, byte_size: usize, storage: Storage) -> Result<Arc<Buffer>> {
        Ok(Arc::new(Buffer::new(self.allocator(), byte_size, storage)?))
    }

    /// A buffer whose memory is only allocated on `commit()`.
    fn new_deferred_buffer(&self, byte_size: usize, storage: Storage) -> Result<Arc<Buffer>> {
        Ok(Arc::new(Buffer::deferred(self.allocator(), byte_size, storage)?))
    }

    /// Wrap caller memory in a non-owning buffer; its storage is classified
    /// by the device.
    fn wrap_buffer(&self, ptr: *mut u8, byte_size: usize) -> Result<Arc<Buffer>> {
        let storage = self.pointer_storage(ptr);
        Ok(Arc::new(Buffer::wrap(self.allocator(), ptr, byte_size, storage)?))
    }

    /// A tensor backed by a new buffer of its own.
    fn new_tensor(&self, desc: TensorDesc, storage: Storage) -> Result<Arc<dyn Tensor>>;

    /// A tensor over external memory. No bounds check is possible.
    fn new_tensor_from_ptr(&self, desc: TensorDesc, ptr: *mut u8) -> Result<Arc<dyn Tensor>>;

    /// A view of `buffer` at `byte_offset`. Fails with InvalidArgument if the
    /// tensor does not fit.
    fn new_tensor_view(
        &self,
        buffer: Arc<Buffer>,
        desc: TensorDesc,
        byte_offset: usize,
    ) -> Result<Arc<dyn Tensor>>;

    /// A flat byte tensor suitable as operator scratch.
    fn new_scratch_tensor(&self, byte_size: usize) -> Result<Arc<dyn Tensor>> {
        self.new_tensor(TensorDesc::bytes(byte_size.max(1))?, self.default_storage())
    }

    fn new_conv(&self, desc: ConvDesc) -> Result<Box<dyn Conv>>;

    fn new_pool(&self, desc: PoolDesc) -> Result<Box<dyn Pool>>;

    fn new_upsample(&self, desc: UpsampleDesc) -> Result<Box<dyn Upsample>>;

    fn new_autoexposure(&self, src_desc: ImageDesc) -> Result<Box<dyn Autoexposure>>;

    fn new_input_process(&self, desc: InputProcessDesc) -> Result<Box<dyn InputProcess>>;

    fn new_output_process(&self, desc: OutputProcessDesc) -> Result<Box<dyn OutputProcess>>;

    fn new_image_copy(&self) -> Result<Box<dyn ImageCopy>>;

    /// Enqueue a host function after all previously submitted work.
    fn run_host_func_async(&self, f: HostFn) -> Result<()>;

    /// Block until the queue drains; returns the first error raised by
    /// queued work since the last wait.
    fn wait(&self) -> Result<()>;
}
