use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use denoise_core::op::{bind_optional_tensor, bind_tensor, Lifecycle};
use denoise_core::tensor::downcast;
use denoise_core::{
    Allocator, Buffer, Error, Image, MemoryBinding, Result, Storage, Tensor, TensorDesc,
};

// CudaTensor — a TensorDesc bound to a raw device pointer
//
// Unlike the CPU tensor there is no native memory object: cuDNN descriptors
// describe shapes only and are owned by the operators, which read the bound
// pointer at run() time.

/// Tensor of the CUDA device.
#[derive(Debug)]
pub struct CudaTensor {
    desc: TensorDesc,
    binding: MemoryBinding,
    ptr: AtomicPtr<u8>,
}

impl CudaTensor {
    fn bind(desc: TensorDesc, binding: MemoryBinding) -> Self {
        let ptr = AtomicPtr::new(binding.current_ptr());
        CudaTensor { desc, binding, ptr }
    }

    pub fn new(allocator: Arc<dyn Allocator>, desc: TensorDesc, storage: Storage) -> Result<Self> {
        let buffer = Buffer::new(allocator, desc.byte_size(), storage)?;
        Ok(Self::bind(desc, MemoryBinding::Owned(Arc::new(buffer))))
    }

    pub fn from_ptr(desc: TensorDesc, ptr: *mut u8) -> Self {
        Self::bind(desc, MemoryBinding::external(ptr))
    }

    pub fn view(buffer: Arc<Buffer>, desc: TensorDesc, byte_offset: usize) -> Result<Self> {
        let binding = MemoryBinding::view(buffer, byte_offset, desc.byte_size())?;
        Ok(Self::bind(desc, binding))
    }
}

impl Tensor for CudaTensor {
    fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    fn binding(&self) -> &MemoryBinding {
        &self.binding
    }

    fn data(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    fn update_ptr(&self) -> Result<()> {
        let ptr = self.binding.refresh(self.desc.byte_size())?;
        self.ptr.store(ptr, Ordering::Release);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn cuda_tensor(tensor: &dyn Tensor) -> Result<&CudaTensor> {
    downcast::<CudaTensor>(tensor, "cuda")
}

pub(crate) fn bind_operand(
    lifecycle: &Lifecycle,
    operand: &str,
    expected: &TensorDesc,
    tensor: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>> {
    cuda_tensor(tensor.as_ref())?;
    bind_tensor(lifecycle, operand, expected, tensor)
}

/// Like [`bind_operand`], but a first binding is accepted after finalize().
pub(crate) fn bind_optional_operand(
    lifecycle: &Lifecycle,
    operand: &str,
    expected: &TensorDesc,
    bound: bool,
    tensor: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>> {
    cuda_tensor(tensor.as_ref())?;
    bind_optional_tensor(lifecycle, operand, expected, bound, tensor)
}

/// The bound pointer of an operand, which must not be null.
pub(crate) fn device_ptr(op: &str, operand: &str, tensor: &dyn Tensor) -> Result<*mut c_void> {
    let ptr = tensor.data();
    if ptr.is_null() {
        return Err(Error::logic(format!(
            "{op} {operand} memory is not allocated (commit the buffer and call update_ptr)"
        )));
    }
    Ok(ptr as *mut c_void)
}

pub(crate) fn image_ptr(op: &str, operand: &str, image: &Image) -> Result<*mut u8> {
    let ptr = image.data();
    if ptr.is_null() {
        return Err(Error::logic(format!(
            "{op} {operand} image memory is not allocated"
        )));
    }
    Ok(ptr)
}
