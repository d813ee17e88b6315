// CUDA driver API — loaded at runtime with libloading
//
// Only the driver entry points the backend needs are resolved. The library is
// opened once per process; a machine without libcuda gets an
// UnsupportedHardware error from driver(), never a link failure.
//
// Raw handles (contexts, streams, modules, functions) are stored as usize so
// the owning types stay Send + Sync.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, OnceLock};

use libloading::Library;

use denoise_core::{Error, Result};

pub type CUresult = i32;
pub type CUdevice = i32;
pub type CUcontext = *mut c_void;
pub type CUdeviceptr = u64;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUhostFn = unsafe extern "C" fn(user_data: *mut c_void);

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;

pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;
pub const CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING: i32 = 41;
pub const CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY: i32 = 83;

pub const CU_POINTER_ATTRIBUTE_MEMORY_TYPE: i32 = 2;
pub const CU_POINTER_ATTRIBUTE_IS_MANAGED: i32 = 8;
pub const CU_MEMORYTYPE_HOST: u32 = 1;
pub const CU_MEMORYTYPE_DEVICE: u32 = 2;
pub const CU_MEMORYTYPE_UNIFIED: u32 = 4;

pub const CU_MEM_ATTACH_GLOBAL: u32 = 1;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn = unsafe extern "C" fn(name: *mut c_char, len: i32, dev: CUdevice) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxRetainFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxReleaseFn = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuLaunchHostFuncFn =
    unsafe extern "C" fn(stream: CUstream, f: CUhostFn, user_data: *mut c_void) -> CUresult;
type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemAllocHostFn = unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type CuMemAllocManagedFn =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize, flags: u32) -> CUresult;
type CuMemcpyFn =
    unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult;
type CuMemcpyAsyncFn = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuPointerGetAttributeFn =
    unsafe extern "C" fn(data: *mut c_void, attribute: i32, ptr: CUdeviceptr) -> CUresult;
type CuModuleLoadDataFn = unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type CuGetErrorStringFn = unsafe extern "C" fn(error: CUresult, p_str: *mut *const c_char) -> CUresult;

pub(crate) struct DriverFns {
    pub cu_init: CuInitFn,
    pub cu_device_get_count: CuDeviceGetCountFn,
    pub cu_device_get: CuDeviceGetFn,
    pub cu_device_get_name: CuDeviceGetNameFn,
    pub cu_device_get_attribute: CuDeviceGetAttributeFn,
    pub cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    pub cu_device_primary_ctx_release: CuDevicePrimaryCtxReleaseFn,
    pub cu_ctx_set_current: CuCtxSetCurrentFn,
    pub cu_stream_create: CuStreamCreateFn,
    pub cu_stream_destroy: CuStreamDestroyFn,
    pub cu_stream_synchronize: CuStreamSynchronizeFn,
    pub cu_launch_host_func: CuLaunchHostFuncFn,
    pub cu_mem_alloc: CuMemAllocFn,
    pub cu_mem_free: CuMemFreeFn,
    pub cu_mem_alloc_host: CuMemAllocHostFn,
    pub cu_mem_free_host: CuMemFreeHostFn,
    pub cu_mem_alloc_managed: CuMemAllocManagedFn,
    pub cu_memcpy: CuMemcpyFn,
    pub cu_memcpy_async: CuMemcpyAsyncFn,
    pub cu_pointer_get_attribute: CuPointerGetAttributeFn,
    pub cu_module_load_data: CuModuleLoadDataFn,
    pub cu_module_unload: CuModuleUnloadFn,
    pub cu_module_get_function: CuModuleGetFunctionFn,
    pub cu_launch_kernel: CuLaunchKernelFn,
    pub cu_get_error_string: CuGetErrorStringFn,
}

/// The loaded CUDA driver library.
pub struct Driver {
    _lib: Library,
    pub(crate) fns: DriverFns,
}

static DRIVER: OnceLock<std::result::Result<Arc<Driver>, String>> = OnceLock::new();

/// Whether the CUDA driver can be loaded and initialised.
pub fn is_available() -> bool {
    driver().is_ok()
}

/// The process-wide driver, loaded and initialised on first use.
pub fn driver() -> Result<Arc<Driver>> {
    let init = DRIVER.get_or_init(|| match Driver::load() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(Error::UnsupportedHardware(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl Driver {
    fn load() -> Result<Self> {
        let lib = load_library(
            "CUDA driver",
            &["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"],
        )?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_device_primary_ctx_retain: load_symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
            cu_device_primary_ctx_release: load_symbol(&lib, b"cuDevicePrimaryCtxRelease_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_launch_host_func: load_symbol(&lib, b"cuLaunchHostFunc\0")?,
            cu_mem_alloc: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_mem_alloc_host: load_symbol(&lib, b"cuMemAllocHost_v2\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_mem_alloc_managed: load_symbol(&lib, b"cuMemAllocManaged\0")?,
            cu_memcpy: load_symbol(&lib, b"cuMemcpy\0")?,
            cu_memcpy_async: load_symbol(&lib, b"cuMemcpyAsync\0")?,
            cu_pointer_get_attribute: load_symbol(&lib, b"cuPointerGetAttribute\0")?,
            cu_module_load_data: load_symbol(&lib, b"cuModuleLoadData\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
            cu_get_error_string: load_symbol(&lib, b"cuGetErrorString\0")?,
        };
        let driver = Driver { _lib: lib, fns };
        // SAFETY: cuInit takes no pointers.
        driver.check(unsafe { (driver.fns.cu_init)(0) }, "cuInit")?;
        Ok(driver)
    }

    /// Turn a driver status into a Result.
    pub fn check(&self, code: CUresult, call: &'static str) -> Result<()> {
        if code == CUDA_SUCCESS {
            return Ok(());
        }
        let mut p: *const c_char = std::ptr::null();
        // SAFETY: cuGetErrorString writes a pointer to a static string or leaves it null.
        let message = unsafe {
            if (self.fns.cu_get_error_string)(code, &mut p) == CUDA_SUCCESS && !p.is_null() {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            } else {
                "unknown error".to_string()
            }
        };
        Err(Error::backend("cuda", call, code as i64, message))
    }

    pub fn device_count(&self) -> Result<usize> {
        let mut count = 0i32;
        // SAFETY: valid out pointer.
        let code = unsafe { (self.fns.cu_device_get_count)(&mut count) };
        if code == CUDA_ERROR_NO_DEVICE {
            return Ok(0);
        }
        self.check(code, "cuDeviceGetCount")?;
        Ok(count.max(0) as usize)
    }

    pub fn device(&self, ordinal: usize) -> Result<CUdevice> {
        let mut dev: CUdevice = 0;
        // SAFETY: valid out pointer.
        self.check(
            unsafe { (self.fns.cu_device_get)(&mut dev, ordinal as i32) },
            "cuDeviceGet",
        )?;
        Ok(dev)
    }

    pub fn device_name(&self, dev: CUdevice) -> Result<String> {
        let mut buf = [0 as c_char; 256];
        // SAFETY: the buffer length is passed along.
        self.check(
            unsafe { (self.fns.cu_device_get_name)(buf.as_mut_ptr(), buf.len() as i32, dev) },
            "cuDeviceGetName",
        )?;
        // SAFETY: the driver NUL-terminates within the given length.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned())
    }

    pub fn device_attribute(&self, dev: CUdevice, attribute: i32) -> Result<i32> {
        let mut value = 0i32;
        // SAFETY: valid out pointer.
        self.check(
            unsafe { (self.fns.cu_device_get_attribute)(&mut value, attribute, dev) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value)
    }

    /// Load a PTX image and return the module handle.
    pub fn load_module(&self, ptx: &str) -> Result<usize> {
        let image = CString::new(ptx)
            .map_err(|_| Error::msg("PTX image contains a NUL byte"))?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: the image is NUL-terminated and the out pointer is valid.
        self.check(
            unsafe { (self.fns.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        Ok(module as usize)
    }

    pub fn module_function(&self, module: usize, name: &str) -> Result<usize> {
        let symbol = CString::new(name)
            .map_err(|_| Error::msg("kernel symbol contains a NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module is a loaded module and the out pointer is valid.
        self.check(
            unsafe {
                (self.fns.cu_module_get_function)(&mut function, module as CUmodule, symbol.as_ptr())
            },
            "cuModuleGetFunction",
        )?;
        Ok(function as usize)
    }
}

pub(crate) fn load_library(what: &str, candidates: &[&str]) -> Result<Library> {
    for candidate in candidates {
        // SAFETY: dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            tracing::debug!(target: "denoise::cuda", library = candidate, "loaded {what}");
            return Ok(lib);
        }
    }
    Err(Error::UnsupportedHardware(format!(
        "failed to load the {what} library (tried {})",
        candidates.join(", ")
    )))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: the caller provides the symbol type declared by the vendor API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        Error::UnsupportedHardware(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}
