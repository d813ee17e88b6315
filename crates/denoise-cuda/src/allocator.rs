use std::ffi::c_void;
use std::sync::Arc;

use denoise_core::{Allocator, Error, Result, Storage};

use crate::context::CudaContext;
use crate::driver::{
    CUdeviceptr, CUDA_ERROR_OUT_OF_MEMORY, CUDA_SUCCESS, CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_HOST,
    CU_MEMORYTYPE_UNIFIED, CU_MEM_ATTACH_GLOBAL, CU_POINTER_ATTRIBUTE_IS_MANAGED,
    CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
};

// CudaAllocator — storage classes on an NVIDIA GPU
//
//   Host     pinned host memory (cuMemAllocHost)
//   Device   device memory (cuMemAlloc)
//   Managed  unified memory attached globally (cuMemAllocManaged)
//
// memcpy is cuMemcpy with unified addressing, so any pair of pointers works,
// including plain pageable host memory. It runs on the legacy default stream
// and therefore waits for work already queued on the device stream.

pub struct CudaAllocator {
    ctx: Arc<CudaContext>,
}

impl CudaAllocator {
    pub fn new(ctx: Arc<CudaContext>) -> Self {
        CudaAllocator { ctx }
    }

    fn map_alloc_error(&self, code: i32, call: &'static str, bytes: usize, storage: Storage) -> Result<()> {
        if code == CUDA_ERROR_OUT_OF_MEMORY {
            return Err(Error::OutOfMemory { bytes, storage });
        }
        self.ctx.driver().check(code, call)
    }

    fn pointer_attribute(&self, ptr: *const u8, attribute: i32) -> Option<u32> {
        let mut value = 0u32;
        // SAFETY: valid out pointer; the attribute writes an unsigned int.
        let code = unsafe {
            (self.ctx.driver().fns.cu_pointer_get_attribute)(
                &mut value as *mut u32 as *mut c_void,
                attribute,
                ptr as CUdeviceptr,
            )
        };
        (code == CUDA_SUCCESS).then_some(value)
    }
}

impl Allocator for CudaAllocator {
    fn malloc(&self, byte_size: usize, storage: Storage) -> Result<*mut u8> {
        if byte_size == 0 {
            return Ok(std::ptr::null_mut());
        }
        self.ctx.bind()?;
        let fns = &self.ctx.driver().fns;
        let ptr = match storage {
            Storage::Host => {
                let mut p: *mut c_void = std::ptr::null_mut();
                // SAFETY: valid out pointer.
                let code = unsafe { (fns.cu_mem_alloc_host)(&mut p, byte_size) };
                self.map_alloc_error(code, "cuMemAllocHost", byte_size, storage)?;
                p as *mut u8
            }
            Storage::Device => {
                let mut p: CUdeviceptr = 0;
                // SAFETY: valid out pointer.
                let code = unsafe { (fns.cu_mem_alloc)(&mut p, byte_size) };
                self.map_alloc_error(code, "cuMemAlloc", byte_size, storage)?;
                p as *mut u8
            }
            Storage::Managed => {
                let mut p: CUdeviceptr = 0;
                // SAFETY: valid out pointer.
                let code = unsafe { (fns.cu_mem_alloc_managed)(&mut p, byte_size, CU_MEM_ATTACH_GLOBAL) };
                self.map_alloc_error(code, "cuMemAllocManaged", byte_size, storage)?;
                p as *mut u8
            }
            Storage::Undefined => {
                return Err(Error::invalid_argument("cannot allocate undefined storage"));
            }
        };
        tracing::trace!(target: "denoise::cuda", bytes = byte_size, %storage, "allocated");
        Ok(ptr)
    }

    fn free(&self, ptr: *mut u8, storage: Storage) {
        if ptr.is_null() {
            return;
        }
        if let Err(err) = self.ctx.bind() {
            tracing::warn!(target: "denoise::cuda", error = %err, "cannot bind context to free memory");
            return;
        }
        let fns = &self.ctx.driver().fns;
        let (code, call) = match storage {
            // SAFETY: ptr came from cuMemAllocHost.
            Storage::Host => (unsafe { (fns.cu_mem_free_host)(ptr as *mut c_void) }, "cuMemFreeHost"),
            // SAFETY: ptr came from cuMemAlloc or cuMemAllocManaged.
            _ => (unsafe { (fns.cu_mem_free)(ptr as CUdeviceptr) }, "cuMemFree"),
        };
        if let Err(err) = self.ctx.driver().check(code, call) {
            tracing::warn!(target: "denoise::cuda", error = %err, %storage, "failed to free memory");
        }
    }

    fn memcpy(&self, dst: *mut u8, src: *const u8, byte_size: usize) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        // SAFETY: the caller guarantees both regions hold byte_size bytes.
        self.ctx.driver().check(
            unsafe {
                (self.ctx.driver().fns.cu_memcpy)(dst as CUdeviceptr, src as CUdeviceptr, byte_size)
            },
            "cuMemcpy",
        )
    }

    fn pointer_storage(&self, ptr: *const u8) -> Storage {
        if ptr.is_null() || self.ctx.bind().is_err() {
            return Storage::Undefined;
        }
        if self.pointer_attribute(ptr, CU_POINTER_ATTRIBUTE_IS_MANAGED) == Some(1) {
            return Storage::Managed;
        }
        match self.pointer_attribute(ptr, CU_POINTER_ATTRIBUTE_MEMORY_TYPE) {
            Some(CU_MEMORYTYPE_HOST) => Storage::Host,
            Some(CU_MEMORYTYPE_DEVICE) => Storage::Device,
            Some(CU_MEMORYTYPE_UNIFIED) => Storage::Managed,
            _ => Storage::Undefined,
        }
    }
}
