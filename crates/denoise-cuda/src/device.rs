use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use denoise_core::{
    Allocator, Autoexposure, Buffer, Conv, ConvDesc, DataType, Device, DeviceConfig, Error,
    HostFn, ImageCopy, ImageDesc, InputProcess, InputProcessDesc, OutputProcess,
    OutputProcessDesc, Pool, PoolDesc, Result, Storage, Tensor, TensorDesc, TensorLayout,
    Upsample, UpsampleDesc, WorkDim,
};

use crate::allocator::CudaAllocator;
use crate::context::{CudaContext, Module, Stream};
use crate::cudnn::{self, Cudnn, Handle};
use crate::driver::{self, CUfunction, CUDA_SUCCESS};
use crate::kernels::{KERNEL_NAMES, KERNEL_SOURCE, MODULE_NAME};
use crate::nvrtc::nvrtc;
use crate::tensor::CudaTensor;
use crate::{autoexposure, conv, image_copy, input_process, output_process, pool, upsample};

// CudaDevice — the NVIDIA GPU execution backend
//
// ARCHITECTURE:
//
//   CudaDevice ──► Arc<CudaEngine> ◄── every operator created by the device
//                     │
//                     ├── CudaContext   (retained primary context)
//                     ├── Stream        (the device queue, FIFO)
//                     ├── cuDNN Handle  (bound to the stream, behind a mutex)
//                     ├── Module        (NVRTC-compiled element kernels)
//                     └── CudaAllocator (host / device / managed)
//
// Operator run() calls enqueue cuDNN calls and kernel launches on the stream;
// host functions go through cuLaunchHostFunc. wait() synchronises the stream
// and then reports the first error raised by a host function since the last
// wait.

/// Largest grid size along y and z.
const MAX_GRID_YZ: u32 = 65_535;

/// Grid and block sizes `(x, y, z)` for a launch over `global`. The last
/// dimension of the domain maps to x.
pub fn launch_dims<const N: usize>(global: &WorkDim<N>) -> Result<([u32; 3], [u32; 3])> {
    if N == 0 || N > 3 {
        return Err(Error::invalid_argument(format!(
            "kernels take 1 to 3 dimensions, got {N}"
        )));
    }
    let group = WorkDim::<N>::suggested_group_size();
    let groups = global.num_groups(&group);
    let mut grid = [1u32; 3];
    let mut block = [1u32; 3];
    for i in 0..N {
        let axis = N - 1 - i;
        grid[i] = u32::try_from(groups.0[axis])
            .map_err(|_| Error::invalid_argument(format!("launch domain {global:?} is too large")))?;
        block[i] = group.0[axis] as u32;
    }
    if grid[1] > MAX_GRID_YZ || grid[2] > MAX_GRID_YZ {
        return Err(Error::invalid_argument(format!(
            "launch domain {global:?} exceeds the grid limits"
        )));
    }
    Ok((grid, block))
}

/// Pointer to one kernel argument, as cuLaunchKernel expects it.
pub fn arg<T>(value: &mut T) -> *mut c_void {
    value as *mut T as *mut c_void
}

struct HostJob {
    f: HostFn,
    errors: Arc<Mutex<Option<Error>>>,
}

unsafe extern "C" fn run_host_job(data: *mut c_void) {
    // SAFETY: data is the Box<HostJob> leaked by run_host_func_async; the
    // driver calls each host function exactly once.
    let job = unsafe { Box::from_raw(data as *mut HostJob) };
    let HostJob { f, errors } = *job;
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let what = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "(non-string panic)".to_string());
        let err = Error::msg(format!("host function panicked: {what}"));
        tracing::warn!(target: "denoise::cuda", error = %err, "queued host function failed");
        let mut slot = errors.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// State shared by the CUDA device and its operators.
pub struct CudaEngine {
    config: DeviceConfig,
    name: String,
    capability: (i32, i32),
    cudnn_lib: Arc<Cudnn>,
    cudnn: Mutex<Handle>,
    functions: HashMap<&'static str, usize>,
    _module: Module,
    stream: Stream,
    allocator: Arc<CudaAllocator>,
    ctx: Arc<CudaContext>,
    host_error: Arc<Mutex<Option<Error>>>,
}

impl CudaEngine {
    fn new(config: DeviceConfig) -> Result<Self> {
        let driver = driver::driver()?;
        let count = driver.device_count()?;
        if count == 0 {
            return Err(Error::UnsupportedHardware("no CUDA device found".to_string()));
        }
        let ordinal = config.device_ordinal;
        if ordinal >= count {
            return Err(Error::invalid_argument(format!(
                "CUDA device ordinal {ordinal} is out of range ({count} devices)"
            )));
        }
        let device = driver.device(ordinal)?;
        let name = driver.device_name(device)?;
        let capability = (
            driver.device_attribute(device, driver::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
            driver.device_attribute(device, driver::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
        );
        if driver.device_attribute(device, driver::CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING)? == 0 {
            return Err(Error::UnsupportedHardware(format!(
                "{name} does not support unified addressing"
            )));
        }
        let managed = driver.device_attribute(device, driver::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY)? != 0;

        let ctx = Arc::new(CudaContext::retain(driver, device)?);
        let stream = Stream::new(ctx.clone())?;
        let cudnn_lib = cudnn::cudnn()?;
        let handle = cudnn_lib.new_handle(stream.raw())?;

        let ptx = nvrtc()?.compile_ptx(KERNEL_SOURCE, MODULE_NAME, capability)?;
        let module = Module::load(ctx.clone(), &ptx)?;
        let functions = KERNEL_NAMES
            .iter()
            .map(|&name| Ok((name, module.function(name)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        tracing::info!(
            target: "denoise::cuda",
            ordinal,
            device = %name,
            compute_capability = %format!("{}.{}", capability.0, capability.1),
            cudnn_version = cudnn_lib.version(),
            managed_memory = managed,
            "created cuda device"
        );

        Ok(CudaEngine {
            config,
            name,
            capability,
            cudnn_lib,
            cudnn: Mutex::new(handle),
            functions,
            _module: module,
            stream,
            allocator: Arc::new(CudaAllocator::new(ctx.clone())),
            ctx,
            host_error: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Marketing name of the GPU.
    pub fn device_name(&self) -> &str {
        &self.name
    }

    pub fn compute_capability(&self) -> (i32, i32) {
        self.capability
    }

    /// Whether tensor core math may be used (Volta and newer).
    pub fn has_tensor_cores(&self) -> bool {
        self.capability.0 >= 7
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    /// The cuDNN library, for creating descriptors.
    pub fn cudnn_lib(&self) -> &Arc<Cudnn> {
        &self.cudnn_lib
    }

    /// The cuDNN handle with the device context current.
    pub fn cudnn(&self) -> Result<MutexGuard<'_, Handle>> {
        self.ctx.bind()?;
        Ok(self.cudnn.lock())
    }

    pub fn bind(&self) -> Result<()> {
        self.ctx.bind()
    }

    fn function(&self, kernel: &str) -> Result<usize> {
        self.functions
            .get(kernel)
            .copied()
            .ok_or_else(|| Error::msg(format!("kernel {kernel} is not part of {MODULE_NAME}")))
    }

    /// Enqueue `kernel` over `global` with the given argument pointers.
    pub fn run_kernel_async<const N: usize>(
        &self,
        kernel: &str,
        global: WorkDim<N>,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        if global.is_empty() {
            return Ok(());
        }
        let function = self.function(kernel)?;
        let (grid, block) = launch_dims(&global)?;
        self.ctx.bind()?;
        let driver = self.ctx.driver();
        // SAFETY: params point to live values matching the kernel signature;
        // the driver copies them before returning.
        let code = unsafe {
            (driver.fns.cu_launch_kernel)(
                function as CUfunction,
                grid[0],
                grid[1],
                grid[2],
                block[0],
                block[1],
                block[2],
                0,
                self.stream.as_ptr(),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        driver.check(code, "cuLaunchKernel")
    }

    /// Enqueue an asynchronous copy on the stream.
    ///
    /// # Safety
    /// Both regions must hold `byte_size` bytes until the copy has executed.
    pub unsafe fn memcpy_async(&self, dst: *mut u8, src: *const u8, byte_size: usize) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        self.ctx.bind()?;
        let driver = self.ctx.driver();
        driver.check(
            (driver.fns.cu_memcpy_async)(dst as u64, src as u64, byte_size, self.stream.as_ptr()),
            "cuMemcpyAsync",
        )
    }

    pub fn run_host_func_async(&self, f: HostFn) -> Result<()> {
        self.ctx.bind()?;
        let job = Box::into_raw(Box::new(HostJob {
            f,
            errors: self.host_error.clone(),
        }));
        let driver = self.ctx.driver();
        // SAFETY: run_host_job takes ownership of the job when it runs.
        let code = unsafe {
            (driver.fns.cu_launch_host_func)(self.stream.as_ptr(), run_host_job, job as *mut c_void)
        };
        if code != CUDA_SUCCESS {
            // SAFETY: the launch failed, so the job was never handed over.
            drop(unsafe { Box::from_raw(job) });
        }
        driver.check(code, "cuLaunchHostFunc")
    }

    pub fn wait(&self) -> Result<()> {
        self.stream.synchronize()?;
        match self.host_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for CudaEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stream.synchronize() {
            tracing::warn!(target: "denoise::cuda", error = %err, "failed to drain stream on shutdown");
        }
        if let Some(err) = self.host_error.lock().take() {
            tracing::warn!(target: "denoise::cuda", error = %err, "dropping unreported host function error");
        }
    }
}

/// The NVIDIA GPU device.
pub struct CudaDevice {
    engine: Arc<CudaEngine>,
}

impl CudaDevice {
    /// Open the GPU selected by `config.device_ordinal`.
    ///
    /// Fails with UnsupportedHardware if the driver, cuDNN or NVRTC cannot be
    /// loaded or no GPU is present.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Ok(CudaDevice {
            engine: Arc::new(CudaEngine::new(config)?),
        })
    }

    /// Whether a usable CUDA driver with at least one GPU is present.
    pub fn is_supported() -> bool {
        driver::driver()
            .and_then(|d| d.device_count())
            .is_ok_and(|n| n > 0)
    }

    pub fn engine(&self) -> &Arc<CudaEngine> {
        &self.engine
    }

    /// Enqueue a kernel on this device. See [`CudaEngine::run_kernel_async`].
    pub fn run_kernel_async<const N: usize>(
        &self,
        kernel: &str,
        global: WorkDim<N>,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        self.engine.run_kernel_async(kernel, global, params)
    }
}

impl Device for CudaDevice {
    fn name(&self) -> String {
        format!("cuda:{}", self.engine.config.device_ordinal)
    }

    fn config(&self) -> &DeviceConfig {
        self.engine.config()
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.engine.allocator()
    }

    fn default_storage(&self) -> Storage {
        Storage::Device
    }

    fn tensor_layout(&self) -> TensorLayout {
        TensorLayout::Chw
    }

    fn weight_layout(&self) -> TensorLayout {
        TensorLayout::Oihw
    }

    fn tensor_data_type(&self) -> DataType {
        if self.engine.has_tensor_cores() {
            DataType::Float16
        } else {
            DataType::Float32
        }
    }

    fn new_tensor(&self, desc: TensorDesc, storage: Storage) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CudaTensor::new(self.engine.allocator(), desc, storage)?))
    }

    fn new_tensor_from_ptr(&self, desc: TensorDesc, ptr: *mut u8) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CudaTensor::from_ptr(desc, ptr)))
    }

    fn new_tensor_view(
        &self,
        buffer: Arc<Buffer>,
        desc: TensorDesc,
        byte_offset: usize,
    ) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CudaTensor::view(buffer, desc, byte_offset)?))
    }

    fn new_conv(&self, desc: ConvDesc) -> Result<Box<dyn Conv>> {
        Ok(Box::new(conv::CudaConv::new(self.engine.clone(), desc)))
    }

    fn new_pool(&self, desc: PoolDesc) -> Result<Box<dyn Pool>> {
        Ok(Box::new(pool::CudaPool::new(self.engine.clone(), desc)))
    }

    fn new_upsample(&self, desc: UpsampleDesc) -> Result<Box<dyn Upsample>> {
        Ok(Box::new(upsample::CudaUpsample::new(self.engine.clone(), desc)))
    }

    fn new_autoexposure(&self, src_desc: ImageDesc) -> Result<Box<dyn Autoexposure>> {
        Ok(Box::new(autoexposure::CudaAutoexposure::new(
            self.engine.clone(),
            src_desc,
        )?))
    }

    fn new_input_process(&self, desc: InputProcessDesc) -> Result<Box<dyn InputProcess>> {
        Ok(Box::new(input_process::CudaInputProcess::new(
            self.engine.clone(),
            desc,
        )))
    }

    fn new_output_process(&self, desc: OutputProcessDesc) -> Result<Box<dyn OutputProcess>> {
        Ok(Box::new(output_process::CudaOutputProcess::new(
            self.engine.clone(),
            desc,
        )))
    }

    fn new_image_copy(&self) -> Result<Box<dyn ImageCopy>> {
        Ok(Box::new(image_copy::CudaImageCopy::new(self.engine.clone())))
    }

    fn run_host_func_async(&self, f: HostFn) -> Result<()> {
        self.engine.run_host_func_async(f)
    }

    fn wait(&self) -> Result<()> {
        self.engine.wait()
    }
}
