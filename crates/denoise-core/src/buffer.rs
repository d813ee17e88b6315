use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::storage::Storage;

// Buffer — a raw backend allocation of one storage class
//
// Every backend exposes its allocator through the Allocator trait; Buffer is
// the single, backend-independent owner of one allocation made through it.
//
// POINTER STABILITY:
//
//   The data pointer of a Buffer is NOT stable. It is null for a deferred
//   buffer until commit(), and it moves on realloc(). Tensors and images that
//   view a Buffer therefore never cache the pointer silently: they bind it
//   into their native descriptor and must be refreshed with update_ptr()
//   whenever the allocation may have moved.
//
// OWNERSHIP:
//
//   Buffers are shared as Arc<Buffer>. Owned allocations are released through
//   the allocator when the last reference drops; wrapped (caller-supplied)
//   memory is never freed.

/// Allocator abstraction keyed by storage class, implemented by each device.
pub trait Allocator: Send + Sync {
    /// Allocate `byte_size` bytes of the given storage class.
    ///
    /// Fails with [`Error::OutOfMemory`] (or a backend status error) instead of
    /// retrying. A zero-byte request returns a null pointer.
    fn malloc(&self, byte_size: usize, storage: Storage) -> Result<*mut u8>;

    /// Release memory previously returned by `malloc` with the same storage.
    fn free(&self, ptr: *mut u8, storage: Storage);

    /// Blocking copy between any two pointers this allocator can address.
    fn memcpy(&self, dst: *mut u8, src: *const u8, byte_size: usize) -> Result<()>;

    /// Classify an arbitrary pointer (Undefined if unknown to the backend).
    fn pointer_storage(&self, ptr: *const u8) -> Storage;
}

struct Allocation {
    ptr: *mut u8,
    byte_size: usize,
}

/// A contiguous allocation of a fixed byte size on one storage class.
pub struct Buffer {
    allocator: Arc<dyn Allocator>,
    storage: Storage,
    owned: bool,
    alloc: RwLock<Allocation>,
}

// SAFETY: the raw pointer is an address handle; all access to the memory it
// designates goes through the allocator or through the device queue, whose
// ordering is the caller's contract.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate `byte_size` bytes of `storage` memory now.
    pub fn new(allocator: Arc<dyn Allocator>, byte_size: usize, storage: Storage) -> Result<Self> {
        check_storage(storage)?;
        let ptr = allocator.malloc(byte_size, storage)?;
        Ok(Buffer {
            allocator,
            storage,
            owned: true,
            alloc: RwLock::new(Allocation { ptr, byte_size }),
        })
    }

    /// Create a buffer whose memory is allocated on the first `commit()`.
    pub fn deferred(
        allocator: Arc<dyn Allocator>,
        byte_size: usize,
        storage: Storage,
    ) -> Result<Self> {
        check_storage(storage)?;
        Ok(Buffer {
            allocator,
            storage,
            owned: true,
            alloc: RwLock::new(Allocation {
                ptr: std::ptr::null_mut(),
                byte_size,
            }),
        })
    }

    /// Wrap caller-owned memory. The buffer never frees or reallocates it.
    pub fn wrap(
        allocator: Arc<dyn Allocator>,
        ptr: *mut u8,
        byte_size: usize,
        storage: Storage,
    ) -> Result<Self> {
        if ptr.is_null() && byte_size > 0 {
            return Err(Error::invalid_argument("cannot wrap a null pointer"));
        }
        Ok(Buffer {
            allocator,
            storage,
            owned: false,
            alloc: RwLock::new(Allocation { ptr, byte_size }),
        })
    }

    /// Current data pointer. Null while a deferred allocation is pending.
    pub fn data(&self) -> *mut u8 {
        self.alloc.read().ptr
    }

    pub fn byte_size(&self) -> usize {
        self.alloc.read().byte_size
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// Whether the buffer owns (and will free) its allocation.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Perform a pending deferred allocation. No-op if already allocated.
    pub fn commit(&self) -> Result<()> {
        let mut alloc = self.alloc.write();
        if alloc.ptr.is_null() && alloc.byte_size > 0 {
            alloc.ptr = self.allocator.malloc(alloc.byte_size, self.storage)?;
            tracing::trace!(
                target: "denoise::buffer",
                bytes = alloc.byte_size,
                storage = %self.storage,
                "committed deferred buffer"
            );
        }
        Ok(())
    }

    /// Replace the allocation with a new one of `byte_size` bytes.
    ///
    /// The contents are not preserved and the data pointer moves. Views bound
    /// to this buffer must call `update_ptr()` before their next use; a view
    /// that no longer fits fails that refresh with a range error.
    pub fn realloc(&self, byte_size: usize) -> Result<()> {
        if !self.owned {
            return Err(Error::logic("cannot reallocate a wrapped buffer"));
        }
        let mut alloc = self.alloc.write();
        let ptr = self.allocator.malloc(byte_size, self.storage)?;
        if !alloc.ptr.is_null() {
            self.allocator.free(alloc.ptr, self.storage);
        }
        alloc.ptr = ptr;
        alloc.byte_size = byte_size;
        Ok(())
    }

    /// Blocking copy of `dst.len()` bytes starting at `byte_offset` to the host.
    ///
    /// Does not wait for queued device work touching this buffer.
    pub fn read(&self, byte_offset: usize, dst: &mut [u8]) -> Result<()> {
        let alloc = self.alloc.read();
        check_region(byte_offset, dst.len(), alloc.byte_size)?;
        if dst.is_empty() {
            return Ok(());
        }
        check_committed(alloc.ptr)?;
        // SAFETY: the region was checked against the allocation size.
        let src = unsafe { alloc.ptr.add(byte_offset) };
        self.allocator.memcpy(dst.as_mut_ptr(), src, dst.len())
    }

    /// Blocking copy of `src` into the buffer starting at `byte_offset`.
    pub fn write(&self, byte_offset: usize, src: &[u8]) -> Result<()> {
        let alloc = self.alloc.read();
        check_region(byte_offset, src.len(), alloc.byte_size)?;
        if src.is_empty() {
            return Ok(());
        }
        check_committed(alloc.ptr)?;
        // SAFETY: the region was checked against the allocation size.
        let dst = unsafe { alloc.ptr.add(byte_offset) };
        self.allocator.memcpy(dst, src.as_ptr(), src.len())
    }

    /// The allocator this buffer was created with.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let alloc = self.alloc.get_mut();
        if self.owned && !alloc.ptr.is_null() {
            self.allocator.free(alloc.ptr, self.storage);
            alloc.ptr = std::ptr::null_mut();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alloc = self.alloc.read();
        f.debug_struct("Buffer")
            .field("ptr", &alloc.ptr)
            .field("byte_size", &alloc.byte_size)
            .field("storage", &self.storage)
            .field("owned", &self.owned)
            .finish()
    }
}

fn check_storage(storage: Storage) -> Result<()> {
    if storage == Storage::Undefined {
        return Err(Error::invalid_argument(
            "cannot allocate memory with undefined storage",
        ));
    }
    Ok(())
}

fn check_committed(ptr: *mut u8) -> Result<()> {
    if ptr.is_null() {
        return Err(Error::logic("buffer memory has not been allocated yet"));
    }
    Ok(())
}

/// Whether `[byte_offset, byte_offset + byte_size)` fits in `capacity` bytes.
pub fn region_fits(byte_offset: usize, byte_size: usize, capacity: usize) -> bool {
    byte_offset
        .checked_add(byte_size)
        .is_some_and(|end| end <= capacity)
}

fn check_region(byte_offset: usize, byte_size: usize, capacity: usize) -> Result<()> {
    if !region_fits(byte_offset, byte_size, capacity) {
        return Err(Error::invalid_argument(format!(
            "buffer region [{byte_offset}, +{byte_size}) is out of range of {capacity} bytes"
        )));
    }
    Ok(())
}
