use std::sync::Arc;

use rayon::ThreadPool;

use denoise_core::{
    Allocator, Autoexposure, Buffer, Conv, ConvDesc, DataType, Device, DeviceConfig, Error,
    HostFn, ImageCopy, ImageDesc, InputProcess, InputProcessDesc, OutputProcess,
    OutputProcessDesc, Pool, PoolDesc, Result, Storage, Tensor, TensorDesc, TensorLayout,
    Upsample, UpsampleDesc, WorkDim,
};

use crate::allocator::{AllocStats, HostAllocator};
use crate::dnn::MemoryDesc;
use crate::kernels::parallel_for;
use crate::queue::{HostQueue, Job};
use crate::tensor::CpuTensor;
use crate::{autoexposure, conv, image_copy, input_process, output_process, pool, upsample};

// CpuDevice — the host execution backend
//
// ARCHITECTURE:
//
//   CpuDevice ──► Arc<CpuEngine> ◄── every operator created by the device
//                    │
//                    ├── HostAllocator   (tracked, 64-byte aligned)
//                    ├── HostQueue       (one worker thread, FIFO)
//                    └── rayon pool      (config.num_threads workers)
//
// Operators keep the engine alive, so an operator may outlive the device
// handle that created it. Work is submitted to the queue; parallel kernels
// fan out onto the rayon pool from inside the queued job.

/// State shared by the CPU device and its operators.
pub struct CpuEngine {
    config: DeviceConfig,
    allocator: Arc<HostAllocator>,
    queue: HostQueue,
    pool: Arc<ThreadPool>,
}

impl CpuEngine {
    fn new(config: DeviceConfig) -> Result<Self> {
        let num_threads = config.effective_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("denoise-cpu-{i}"))
            .build()
            .map_err(|e| Error::msg(format!("failed to create cpu thread pool: {e}")))?;
        let queue = HostQueue::new("denoise-cpu-queue")?;
        Ok(CpuEngine {
            config,
            allocator: Arc::new(HostAllocator::new()),
            queue,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Enqueue a job on the device queue.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.queue.submit(job)
    }

    /// Enqueue a kernel over `global`, split into suggested work groups.
    pub fn run_kernel_async<const N: usize, F>(&self, global: WorkDim<N>, f: F) -> Result<()>
    where
        F: Fn([usize; N]) + Send + Sync + 'static,
    {
        let pool = self.pool.clone();
        self.submit(Box::new(move || {
            parallel_for(&pool, global, f);
            Ok(())
        }))
    }

    pub fn wait(&self) -> Result<()> {
        self.queue.wait()
    }

    /// Jobs submitted but not yet started.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

/// The CPU device.
pub struct CpuDevice {
    engine: Arc<CpuEngine>,
}

impl CpuDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let engine = Arc::new(CpuEngine::new(config)?);
        tracing::info!(
            target: "denoise::cpu",
            threads = engine.num_threads(),
            layout = %TensorLayout::Chw8c,
            "created cpu device"
        );
        Ok(CpuDevice { engine })
    }

    pub fn engine(&self) -> &Arc<CpuEngine> {
        &self.engine
    }

    /// Allocation statistics of the device allocator.
    pub fn alloc_stats(&self) -> AllocStats {
        self.engine.allocator.stats()
    }

    /// A flat byte tensor holding memory for a native descriptor.
    pub fn new_native_tensor(&self, native: MemoryDesc, storage: Storage) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CpuTensor::from_native(
            self.engine.allocator(),
            native,
            storage,
        )?))
    }

    /// Enqueue a kernel on this device. See [`CpuEngine::run_kernel_async`].
    pub fn run_kernel_async<const N: usize, F>(&self, global: WorkDim<N>, f: F) -> Result<()>
    where
        F: Fn([usize; N]) + Send + Sync + 'static,
    {
        self.engine.run_kernel_async(global, f)
    }
}

impl Device for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn config(&self) -> &DeviceConfig {
        self.engine.config()
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.engine.allocator()
    }

    fn default_storage(&self) -> Storage {
        Storage::Host
    }

    fn tensor_layout(&self) -> TensorLayout {
        TensorLayout::Chw8c
    }

    fn weight_layout(&self) -> TensorLayout {
        TensorLayout::OIhw8i8o
    }

    fn tensor_data_type(&self) -> DataType {
        DataType::Float32
    }

    fn new_tensor(&self, desc: TensorDesc, storage: Storage) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CpuTensor::new(self.engine.allocator(), desc, storage)?))
    }

    fn new_tensor_from_ptr(&self, desc: TensorDesc, ptr: *mut u8) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CpuTensor::from_ptr(desc, ptr)))
    }

    fn new_tensor_view(
        &self,
        buffer: Arc<Buffer>,
        desc: TensorDesc,
        byte_offset: usize,
    ) -> Result<Arc<dyn Tensor>> {
        Ok(Arc::new(CpuTensor::view(buffer, desc, byte_offset)?))
    }

    fn new_conv(&self, desc: ConvDesc) -> Result<Box<dyn Conv>> {
        Ok(Box::new(conv::CpuConv::new(self.engine.clone(), desc)))
    }

    fn new_pool(&self, desc: PoolDesc) -> Result<Box<dyn Pool>> {
        Ok(Box::new(pool::CpuPool::new(self.engine.clone(), desc)))
    }

    fn new_upsample(&self, desc: UpsampleDesc) -> Result<Box<dyn Upsample>> {
        Ok(Box::new(upsample::CpuUpsample::new(self.engine.clone(), desc)))
    }

    fn new_autoexposure(&self, src_desc: ImageDesc) -> Result<Box<dyn Autoexposure>> {
        Ok(Box::new(autoexposure::CpuAutoexposure::new(
            self.engine.clone(),
            src_desc,
        )))
    }

    fn new_input_process(&self, desc: InputProcessDesc) -> Result<Box<dyn InputProcess>> {
        Ok(Box::new(input_process::CpuInputProcess::new(
            self.engine.clone(),
            desc,
        )))
    }

    fn new_output_process(&self, desc: OutputProcessDesc) -> Result<Box<dyn OutputProcess>> {
        Ok(Box::new(output_process::CpuOutputProcess::new(
            self.engine.clone(),
            desc,
        )))
    }

    fn new_image_copy(&self) -> Result<Box<dyn ImageCopy>> {
        Ok(Box::new(image_copy::CpuImageCopy::new(self.engine.clone())))
    }

    fn run_host_func_async(&self, f: HostFn) -> Result<()> {
        self.engine.submit(Box::new(move || {
            f();
            Ok(())
        }))
    }

    fn wait(&self) -> Result<()> {
        self.engine.wait()
    }
}
