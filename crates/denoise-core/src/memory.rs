use std::sync::Arc;

use crate::buffer::{region_fits, Allocator, Buffer};
use crate::dtype::Element;
use crate::error::{Error, Result};

// MemoryBinding — what a tensor or image is bound to
//
// Three backing forms exist:
//
//   Owned     — the view allocated its own Buffer and is its only user
//   View      — a byte range of a caller-supplied (possibly shared) Buffer
//   External  — a raw caller pointer with no Buffer; no bounds are known
//
// The binding itself never caches the data pointer. current_ptr() always
// derives it from the Buffer so that a refresh picks up a moved allocation.

/// Backing memory of a tensor or image.
#[derive(Debug, Clone)]
pub enum MemoryBinding {
    Owned(Arc<Buffer>),
    View {
        buffer: Arc<Buffer>,
        byte_offset: usize,
    },
    External(ExternalPtr),
}

/// Caller-supplied pointer with no owning buffer.
#[derive(Debug, Clone, Copy)]
pub struct ExternalPtr(pub *mut u8);

// SAFETY: the pointer is an address handle; dereferencing it is the caller's
// contract (the external memory must outlive every view bound to it).
unsafe impl Send for ExternalPtr {}
unsafe impl Sync for ExternalPtr {}

impl MemoryBinding {
    /// Bind a view of `byte_size` bytes at `byte_offset` into `buffer`.
    ///
    /// Fails with InvalidArgument if the region does not fit.
    pub fn view(buffer: Arc<Buffer>, byte_offset: usize, byte_size: usize) -> Result<Self> {
        if !region_fits(byte_offset, byte_size, buffer.byte_size()) {
            return Err(Error::invalid_argument(format!(
                "buffer region is out of range: offset {byte_offset} + size {byte_size} > {}",
                buffer.byte_size()
            )));
        }
        Ok(MemoryBinding::View {
            buffer,
            byte_offset,
        })
    }

    pub fn external(ptr: *mut u8) -> Self {
        MemoryBinding::External(ExternalPtr(ptr))
    }

    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        match self {
            MemoryBinding::Owned(buffer) | MemoryBinding::View { buffer, .. } => Some(buffer),
            MemoryBinding::External(_) => None,
        }
    }

    pub fn byte_offset(&self) -> usize {
        match self {
            MemoryBinding::View { byte_offset, .. } => *byte_offset,
            _ => 0,
        }
    }

    /// The pointer the binding designates right now (null if the buffer has
    /// not been allocated yet).
    pub fn current_ptr(&self) -> *mut u8 {
        match self {
            MemoryBinding::External(p) => p.0,
            MemoryBinding::Owned(buffer) | MemoryBinding::View { buffer, .. } => {
                let base = buffer.data();
                if base.is_null() {
                    base
                } else {
                    // SAFETY: the offset was validated against the buffer size.
                    unsafe { base.add(self.byte_offset()) }
                }
            }
        }
    }

    /// Re-validate the region against the buffer's current size and return
    /// the current pointer. Fails with a range error if the buffer shrank
    /// beneath the view.
    pub fn refresh(&self, byte_size: usize) -> Result<*mut u8> {
        if let Some(buffer) = self.buffer() {
            let offset = self.byte_offset();
            if !region_fits(offset, byte_size, buffer.byte_size()) {
                return Err(Error::range(format!(
                    "buffer region is out of range: offset {offset} + size {byte_size} > {}",
                    buffer.byte_size()
                )));
            }
        }
        Ok(self.current_ptr())
    }
}

/// Copy `byte_size` bytes at `ptr` into a host vector of `T`.
pub fn read_elements<T: Element>(
    allocator: &dyn Allocator,
    ptr: *const u8,
    count: usize,
) -> Result<Vec<T>> {
    let mut out = Vec::<T>::with_capacity(count);
    if count == 0 {
        return Ok(out);
    }
    if ptr.is_null() {
        return Err(Error::logic("cannot read from unbound memory"));
    }
    let byte_size = count * std::mem::size_of::<T>();
    allocator.memcpy(out.as_mut_ptr() as *mut u8, ptr, byte_size)?;
    // SAFETY: Element is only implemented for plain scalar types, every bit
    // pattern is valid and memcpy initialised all `count` elements.
    unsafe { out.set_len(count) };
    Ok(out)
}

/// Copy host elements to `ptr`.
pub fn write_elements<T: Element>(allocator: &dyn Allocator, ptr: *mut u8, data: &[T]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if ptr.is_null() {
        return Err(Error::logic("cannot write to unbound memory"));
    }
    allocator.memcpy(ptr, data.as_ptr() as *const u8, std::mem::size_of_val(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::TestAllocator;
    use crate::storage::Storage;

    fn buffer(size: usize) -> Arc<Buffer> {
        Arc::new(Buffer::new(Arc::new(TestAllocator::default()), size, Storage::Host).unwrap())
    }

    #[test]
    fn test_view_pointer_is_offset() {
        let buf = buffer(64);
        let b = MemoryBinding::view(buf.clone(), 16, 32).unwrap();
        assert_eq!(b.current_ptr(), unsafe { buf.data().add(16) });
        assert_eq!(b.byte_offset(), 16);
    }

    #[test]
    fn test_view_out_of_range() {
        let err = MemoryBinding::view(buffer(64), 40, 32).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_refresh_after_shrink_is_range_error() {
        let buf = buffer(64);
        let b = MemoryBinding::view(buf.clone(), 32, 32).unwrap();
        buf.realloc(48).unwrap();
        assert!(matches!(b.refresh(32), Err(Error::Range(_))));
        buf.realloc(128).unwrap();
        assert_eq!(b.refresh(32).unwrap(), unsafe { buf.data().add(32) });
    }

    #[test]
    fn test_external_has_no_bounds() {
        let mut host = [0u8; 4];
        let b = MemoryBinding::external(host.as_mut_ptr());
        assert!(b.buffer().is_none());
        assert_eq!(b.refresh(1 << 20).unwrap(), host.as_mut_ptr());
    }

    #[test]
    fn test_element_round_trip() {
        let a = TestAllocator::default();
        let mut host = [0u8; 16];
        write_elements(&a, host.as_mut_ptr(), &[1.5f32, -2.0]).unwrap();
        let back: Vec<f32> = read_elements(&a, host.as_ptr(), 2).unwrap();
        assert_eq!(back, vec![1.5, -2.0]);
        assert!(read_elements::<f32>(&a, std::ptr::null(), 1).is_err());
    }
}
