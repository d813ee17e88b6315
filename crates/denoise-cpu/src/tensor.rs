use std::any::Any;
use std::sync::Arc;

use denoise_core::op::{bind_optional_tensor, bind_tensor, Lifecycle};
use denoise_core::tensor::downcast;
use denoise_core::{
    Allocator, Buffer, Error, Image, MemoryBinding, Result, Storage, Tensor, TensorDesc,
};

use crate::dnn::{Memory, MemoryDesc};
use crate::kernels::SyncPtr;

// CpuTensor — a TensorDesc bound to a native dnn::Memory
//
// The native descriptor is derived from the TensorDesc at construction. If
// the primitive layer cannot express it (f16 activations, for instance) the
// tensor is still created, just without a native descriptor; operators
// handed such a tensor report themselves unsupported.

/// Tensor of the CPU device.
#[derive(Debug)]
pub struct CpuTensor {
    desc: TensorDesc,
    binding: MemoryBinding,
    memory: Memory,
}

impl CpuTensor {
    fn bind(desc: TensorDesc, binding: MemoryBinding, native: Option<MemoryDesc>) -> Self {
        let native = native.or_else(|| match MemoryDesc::new(&desc) {
            Ok(md) => Some(md),
            Err(e) => {
                tracing::debug!(target: "denoise::cpu", tensor = %desc, error = %e, "no native descriptor");
                None
            }
        });
        let memory = Memory::new(native, binding.current_ptr());
        CpuTensor {
            desc,
            binding,
            memory,
        }
    }

    /// Allocate a buffer of its own.
    pub fn new(allocator: Arc<dyn Allocator>, desc: TensorDesc, storage: Storage) -> Result<Self> {
        let buffer = Buffer::new(allocator, desc.byte_size(), storage)?;
        Ok(Self::bind(desc, MemoryBinding::Owned(Arc::new(buffer)), None))
    }

    /// Bind external memory.
    pub fn from_ptr(desc: TensorDesc, ptr: *mut u8) -> Self {
        Self::bind(desc, MemoryBinding::external(ptr), None)
    }

    /// View `buffer` at `byte_offset`.
    pub fn view(buffer: Arc<Buffer>, desc: TensorDesc, byte_offset: usize) -> Result<Self> {
        let binding = MemoryBinding::view(buffer, byte_offset, desc.byte_size())?;
        Ok(Self::bind(desc, binding, None))
    }

    /// A flat byte tensor sized for a native descriptor, which it keeps as
    /// its own native descriptor.
    pub fn from_native(
        allocator: Arc<dyn Allocator>,
        native: MemoryDesc,
        storage: Storage,
    ) -> Result<Self> {
        let desc = native.byte_tensor_desc()?;
        let buffer = Buffer::new(allocator, desc.byte_size(), storage)?;
        Ok(Self::bind(
            desc,
            MemoryBinding::Owned(Arc::new(buffer)),
            Some(native),
        ))
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn native_desc(&self) -> Option<&MemoryDesc> {
        self.memory.desc()
    }
}

impl Tensor for CpuTensor {
    fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    fn binding(&self) -> &MemoryBinding {
        &self.binding
    }

    fn data(&self) -> *mut u8 {
        self.memory.handle()
    }

    fn update_ptr(&self) -> Result<()> {
        let ptr = self.binding.refresh(self.desc.byte_size())?;
        self.memory.set_handle(ptr);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Downcast to the CPU tensor type.
pub fn cpu_tensor(tensor: &dyn Tensor) -> Result<&CpuTensor> {
    downcast::<CpuTensor>(tensor, "cpu")
}

/// Bind a tensor operand of a CPU operator.
pub(crate) fn bind_operand(
    lifecycle: &Lifecycle,
    operand: &str,
    expected: &TensorDesc,
    tensor: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>> {
    cpu_tensor(tensor.as_ref())?;
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
    cpu_tensor(tensor.as_ref())?;
    bind_optional_tensor(lifecycle, operand, expected, bound, tensor)
}

/// The bound pointer of an operand, which must not be null.
pub(crate) fn bound_ptr<T: Copy>(op: &str, operand: &str, tensor: &dyn Tensor) -> Result<SyncPtr<T>> {
    let ptr = tensor.data();
    if ptr.is_null() {
        return Err(Error::logic(format!(
            "{op} {operand} memory is not allocated (commit the buffer and call update_ptr)"
        )));
    }
    Ok(SyncPtr::new(ptr))
}

/// The bound pointer of an image operand, which must not be null.
pub(crate) fn image_ptr(op: &str, operand: &str, image: &Image) -> Result<SyncPtr<u8>> {
    let ptr = image.data();
    if ptr.is_null() {
        return Err(Error::logic(format!(
            "{op} {operand} image memory is not allocated"
        )));
    }
    Ok(SyncPtr::new(ptr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HostAllocator;
    use denoise_core::{DataType, TensorLayout};

    fn f32_desc(c: usize, h: usize, w: usize) -> TensorDesc {
        TensorDesc::chw(c, h, w, TensorLayout::Chw, DataType::Float32).unwrap()
    }

    #[test]
    fn test_owned_tensor_has_native_desc() {
        let t = CpuTensor::new(Arc::new(HostAllocator::new()), f32_desc(3, 4, 4), Storage::Host)
            .unwrap();
        assert!(t.native_desc().is_some());
        assert!(!t.data().is_null());
        assert_eq!(t.byte_offset(), 0);
    }

    #[test]
    fn test_half_tensor_has_no_native_desc() {
        let desc = TensorDesc::chw(8, 2, 2, TensorLayout::Chw8c, DataType::Float16).unwrap();
        let t = CpuTensor::new(Arc::new(HostAllocator::new()), desc, Storage::Host).unwrap();
        assert!(t.native_desc().is_none());
    }

    #[test]
    fn test_view_rebinds_after_realloc() {
        let alloc: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let buffer = Arc::new(Buffer::new(alloc, 256, Storage::Host).unwrap());
        let t = CpuTensor::view(buffer.clone(), f32_desc(1, 4, 4), 64).unwrap();
        assert_eq!(t.data(), unsafe { buffer.data().add(64) });
        buffer.realloc(512).unwrap();
        t.update_ptr().unwrap();
        assert_eq!(t.data(), unsafe { buffer.data().add(64) });
        buffer.realloc(100).unwrap();
        assert!(matches!(t.update_ptr(), Err(Error::Range(_))));
    }

    #[test]
    fn test_from_native_matches_size() {
        let native = MemoryDesc::new(&f32_desc(8, 3, 3)).unwrap();
        let t = CpuTensor::from_native(Arc::new(HostAllocator::new()), native.clone(), Storage::Host)
            .unwrap();
        assert_eq!(t.desc().byte_size(), native.byte_size());
        assert_eq!(t.desc().dtype(), DataType::UInt8);
        assert_eq!(t.native_desc(), Some(&native));
    }

    #[test]
    fn test_unallocated_operand_is_logic_error() {
        let alloc: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let buffer = Arc::new(Buffer::deferred(alloc, 64, Storage::Host).unwrap());
        let t = CpuTensor::view(buffer, f32_desc(1, 4, 4), 0).unwrap();
        assert!(matches!(
            bound_ptr::<f32>("conv", "source", &t),
            Err(Error::Logic(_))
        ));
    }
}
