use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::buffer::{Allocator, Buffer};
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::memory::{self, MemoryBinding};
use crate::tensor_desc::TensorDesc;

// Tensor — a TensorDesc bound to memory through a backend-native descriptor
//
// Each backend implements this trait with its own tensor type, which holds
// the backend's native memory object next to the engine-level TensorDesc.
// Operators of a backend downcast the tensors they are given through
// as_any(); a tensor from another backend is rejected as an invalid argument.
//
// CONSTRUCTION FORMS (see Device):
//
//   new_tensor(desc, storage)          — allocates its own Buffer
//   new_tensor_from_ptr(desc, ptr)     — external memory, no Buffer
//   new_tensor_view(buffer, desc, off) — view, validated against the buffer
//
// INVARIANT:
//
//   byte_offset + desc.byte_size() <= buffer.byte_size(), checked at
//   construction (InvalidArgument) and on every update_ptr() (Range).
//
// Two views over the same Buffer are never synchronised with each other.
// Binding overlapping regions as distinct operands is a caller error that is
// not detected.

/// A tensor bound to memory on one backend.
pub trait Tensor: Send + Sync + fmt::Debug {
    fn desc(&self) -> &TensorDesc;

    fn binding(&self) -> &MemoryBinding;

    /// The data pointer currently bound in the native descriptor.
    fn data(&self) -> *mut u8;

    /// Re-read the backing buffer's pointer, re-validate the region and
    /// rebind the native descriptor.
    fn update_ptr(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.binding().buffer()
    }

    fn byte_offset(&self) -> usize {
        self.binding().byte_offset()
    }

    fn byte_size(&self) -> usize {
        self.desc().byte_size()
    }
}

/// Downcast a tensor to a backend's concrete type.
pub fn downcast<'a, T: 'static>(tensor: &'a dyn Tensor, backend: &str) -> Result<&'a T> {
    tensor.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::invalid_argument(format!(
            "tensor {} does not belong to the {backend} backend",
            tensor.desc()
        ))
    })
}

/// Check that an operand has exactly the descriptor an operator expects.
///
/// Descriptors compare by rank too: `[C, H, W]` and `[1, C, H, W]` are
/// different descriptors even though they address the same elements.
pub fn check_operand(op: &str, operand: &str, expected: &TensorDesc, got: &dyn Tensor) -> Result<()> {
    if got.desc() != expected {
        return Err(Error::invalid_argument(format!(
            "{op} {operand} descriptor mismatch: expected {expected}, got {}",
            got.desc()
        )));
    }
    Ok(())
}

/// Copy a tensor's contents to a host vector.
pub fn read_tensor<T: Element>(allocator: &dyn Allocator, tensor: &dyn Tensor) -> Result<Vec<T>> {
    check_dtype::<T>(tensor)?;
    memory::read_elements(allocator, tensor.data(), tensor.desc().num_elements())
}

/// Overwrite a tensor's contents from host data.
pub fn write_tensor<T: Element>(
    allocator: &dyn Allocator,
    tensor: &dyn Tensor,
    data: &[T],
) -> Result<()> {
    check_dtype::<T>(tensor)?;
    let n = tensor.desc().num_elements();
    if data.len() != n {
        return Err(Error::invalid_argument(format!(
            "tensor {} holds {n} elements, got {}",
            tensor.desc(),
            data.len()
        )));
    }
    memory::write_elements(allocator, tensor.data(), data)
}

fn check_dtype<T: Element>(tensor: &dyn Tensor) -> Result<()> {
    if tensor.desc().dtype() != T::DATA_TYPE {
        return Err(Error::invalid_argument(format!(
            "tensor {} accessed as {}",
            tensor.desc(),
            T::DATA_TYPE
        )));
    }
    Ok(())
}
