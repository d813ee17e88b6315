// Host allocator — aligned host memory for every storage class
//
// On the CPU device Host, Device and Managed storage are all plain host
// memory. Blocks are 64-byte aligned so that channel-blocked rows start on
// a cache line.
//
// Live allocations are tracked by address so that:
//
//   - free() only releases blocks this allocator handed out
//   - pointer_storage() can classify any pointer inside a live block
//   - statistics (live/peak bytes) are available for diagnostics
//
// Pointers unknown to the allocator are still host memory and classify as
// Host.

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use denoise_core::{Allocator, Error, Result, Storage};

pub const ALIGNMENT: usize = 64;

/// Snapshot of the allocator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes currently allocated.
    pub live_bytes: usize,
    /// Number of live blocks.
    pub live_blocks: usize,
    /// Highest `live_bytes` seen so far.
    pub peak_bytes: usize,
    /// Cumulative number of successful allocations.
    pub allocations: u64,
}

struct Block {
    byte_size: usize,
    storage: Storage,
}

#[derive(Default)]
struct Blocks {
    by_addr: BTreeMap<usize, Block>,
    live_bytes: usize,
    peak_bytes: usize,
}

/// Aligned host allocator with allocation tracking.
#[derive(Default)]
pub struct HostAllocator {
    blocks: Mutex<Blocks>,
    allocations: AtomicU64,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AllocStats {
        let blocks = self.blocks.lock();
        AllocStats {
            live_bytes: blocks.live_bytes,
            live_blocks: blocks.by_addr.len(),
            peak_bytes: blocks.peak_bytes,
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    fn layout(byte_size: usize, storage: Storage) -> Result<Layout> {
        Layout::from_size_align(byte_size, ALIGNMENT).map_err(|_| Error::OutOfMemory {
            bytes: byte_size,
            storage,
        })
    }
}

impl Allocator for HostAllocator {
    fn malloc(&self, byte_size: usize, storage: Storage) -> Result<*mut u8> {
        if byte_size == 0 {
            return Ok(std::ptr::null_mut());
        }
        let layout = Self::layout(byte_size, storage)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory {
                bytes: byte_size,
                storage,
            });
        }
        let mut blocks = self.blocks.lock();
        blocks
            .by_addr
            .insert(ptr as usize, Block { byte_size, storage });
        blocks.live_bytes += byte_size;
        blocks.peak_bytes = blocks.peak_bytes.max(blocks.live_bytes);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    fn free(&self, ptr: *mut u8, storage: Storage) {
        if ptr.is_null() {
            return;
        }
        let block = {
            let mut blocks = self.blocks.lock();
            let block = blocks.by_addr.remove(&(ptr as usize));
            if let Some(b) = &block {
                blocks.live_bytes -= b.byte_size;
            }
            block
        };
        match block {
            Some(block) => {
                if block.storage != storage {
                    tracing::warn!(
                        target: "denoise::cpu",
                        allocated = %block.storage,
                        freed = %storage,
                        "memory freed with a different storage class"
                    );
                }
                if let Ok(layout) = Self::layout(block.byte_size, block.storage) {
                    // SAFETY: the block was allocated by malloc() with this layout
                    // and has just been removed from the live set.
                    unsafe { std::alloc::dealloc(ptr, layout) };
                }
            }
            None => tracing::warn!(
                target: "denoise::cpu",
                ptr = ?ptr,
                "ignoring free of memory not allocated by this device"
            ),
        }
    }

    fn memcpy(&self, dst: *mut u8, src: *const u8, byte_size: usize) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(Error::invalid_argument("memcpy with a null pointer"));
        }
        // SAFETY: the caller guarantees both regions are valid host memory of
        // at least byte_size bytes; copy() tolerates overlap.
        unsafe { std::ptr::copy(src, dst, byte_size) };
        Ok(())
    }

    fn pointer_storage(&self, ptr: *const u8) -> Storage {
        if ptr.is_null() {
            return Storage::Undefined;
        }
        let addr = ptr as usize;
        let blocks = self.blocks.lock();
        match blocks.by_addr.range(..=addr).next_back() {
            Some((&base, block)) if addr < base + block.byte_size => block.storage,
            _ => Storage::Host,
        }
    }
}
