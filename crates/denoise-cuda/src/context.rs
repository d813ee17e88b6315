use std::ffi::c_void;
use std::sync::Arc;

use denoise_core::Result;

use crate::driver::{CUcontext, CUdevice, CUstream, Driver};

// RAII owners of driver objects
//
//   CudaContext  the retained primary context of one GPU
//   Stream       the ordered queue of a device
//   Module       the loaded kernel module
//
// Every driver call is made with the context current on the calling thread;
// bind() is cheap and is called before each group of calls.

/// The primary context of one GPU, retained for the lifetime of this value.
pub struct CudaContext {
    driver: Arc<Driver>,
    device: CUdevice,
    raw: usize,
}

impl CudaContext {
    pub fn retain(driver: Arc<Driver>, device: CUdevice) -> Result<Self> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: valid out pointer and device handle.
        driver.check(
            unsafe { (driver.fns.cu_device_primary_ctx_retain)(&mut ctx, device) },
            "cuDevicePrimaryCtxRetain",
        )?;
        Ok(CudaContext {
            driver,
            device,
            raw: ctx as usize,
        })
    }

    /// Make this context current on the calling thread.
    pub fn bind(&self) -> Result<()> {
        // SAFETY: the context is retained.
        self.driver.check(
            unsafe { (self.driver.fns.cu_ctx_set_current)(self.raw as CUcontext) },
            "cuCtxSetCurrent",
        )
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn device(&self) -> CUdevice {
        self.device
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        // SAFETY: balanced with the retain in CudaContext::retain.
        let code = unsafe { (self.driver.fns.cu_device_primary_ctx_release)(self.device) };
        if let Err(err) = self.driver.check(code, "cuDevicePrimaryCtxRelease") {
            tracing::warn!(target: "denoise::cuda", error = %err, "failed to release primary context");
        }
    }
}

/// A CUDA stream created in a context.
pub struct Stream {
    ctx: Arc<CudaContext>,
    raw: usize,
}

impl Stream {
    /// A blocking stream: the legacy default stream (used by cuMemcpy)
    /// synchronises with it.
    pub fn new(ctx: Arc<CudaContext>) -> Result<Self> {
        ctx.bind()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: valid out pointer; the context is current.
        ctx.driver.check(
            unsafe { (ctx.driver.fns.cu_stream_create)(&mut stream, 0) },
            "cuStreamCreate",
        )?;
        Ok(Stream {
            ctx,
            raw: stream as usize,
        })
    }

    pub fn raw(&self) -> usize {
        self.raw
    }

    pub fn as_ptr(&self) -> CUstream {
        self.raw as CUstream
    }

    /// Block until all work submitted to the stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.ctx.bind()?;
        // SAFETY: the stream is live.
        self.ctx.driver.check(
            unsafe { (self.ctx.driver.fns.cu_stream_synchronize)(self.as_ptr()) },
            "cuStreamSynchronize",
        )
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.ctx.bind().is_err() {
            return;
        }
        // SAFETY: the stream was created by cuStreamCreate.
        let code = unsafe { (self.ctx.driver.fns.cu_stream_destroy)(self.as_ptr()) };
        if let Err(err) = self.ctx.driver.check(code, "cuStreamDestroy") {
            tracing::warn!(target: "denoise::cuda", error = %err, "failed to destroy stream");
        }
    }
}

/// A loaded module.
pub struct Module {
    ctx: Arc<CudaContext>,
    raw: usize,
}

impl Module {
    pub fn load(ctx: Arc<CudaContext>, ptx: &str) -> Result<Self> {
        ctx.bind()?;
        let raw = ctx.driver.load_module(ptx)?;
        Ok(Module { ctx, raw })
    }

    /// Handle of the kernel entry point `name`.
    pub fn function(&self, name: &str) -> Result<usize> {
        self.ctx.driver.module_function(self.raw, name)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.ctx.bind().is_err() {
            return;
        }
        // SAFETY: the module was loaded by cuModuleLoadData.
        let code = unsafe { (self.ctx.driver.fns.cu_module_unload)(self.raw as *mut c_void) };
        if let Err(err) = self.ctx.driver.check(code, "cuModuleUnload") {
            tracing::warn!(target: "denoise::cuda", error = %err, "failed to unload module");
        }
    }
}
