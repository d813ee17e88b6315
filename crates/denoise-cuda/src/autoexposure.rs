use std::sync::Arc;

use parking_lot::Mutex;

use denoise_core::exposure::{exposure_from_bins, num_bins};
use denoise_core::op::{bind_image, Lifecycle};
use denoise_core::{
    Autoexposure, Buffer, Error, Image, ImageDesc, Op, OpState, Result, Storage, WorkDim,
};

use crate::device::{arg, CudaEngine};
use crate::kernels::ImageArg;
use crate::tensor::image_ptr;

// CudaAutoexposure — exposure estimation on the GPU
//
// run() enqueues three steps on the device stream:
//
//   autoexposure_bins   average luminance per bin into device memory
//   cuMemcpyAsync       bins to pinned host memory
//   host function       reduce the bins to the exposure, publish the result
//
// Both bin buffers are sized for the source description at creation.

pub struct CudaAutoexposure {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    src_desc: ImageDesc,
    bins: (usize, usize),
    device_bins: Arc<Buffer>,
    host_bins: Arc<Buffer>,
    src: Option<Arc<Image>>,
    result: Arc<Mutex<Option<f32>>>,
}

impl CudaAutoexposure {
    pub fn new(engine: Arc<CudaEngine>, src_desc: ImageDesc) -> Result<Self> {
        let bins = num_bins(src_desc.height, src_desc.width);
        let byte_size = bins.0 * bins.1 * std::mem::size_of::<f32>();
        let device_bins = Arc::new(Buffer::new(engine.allocator(), byte_size, Storage::Device)?);
        let host_bins = Arc::new(Buffer::new(engine.allocator(), byte_size, Storage::Host)?);
        Ok(CudaAutoexposure {
            engine,
            lifecycle: Lifecycle::new("autoexposure", true),
            src_desc,
            bins,
            device_bins,
            host_bins,
            src: None,
            result: Arc::new(Mutex::new(None)),
        })
    }
}

impl Op for CudaAutoexposure {
    fn name(&self) -> &'static str {
        "autoexposure"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle
            .check_finalizable(&[("source", self.src.is_some())])?;
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let Some(src) = &self.src else {
            return self.lifecycle.check_finalized();
        };
        *self.result.lock() = None;
        let (nh, nw) = self.bins;
        let count = nh * nw;

        let mut image = ImageArg::new(image_ptr("autoexposure", "source", src)?, src.desc());
        let mut bins_ptr = self.device_bins.data();
        let (mut nh32, mut nw32) = (nh as u32, nw as u32);
        self.engine.run_kernel_async(
            "autoexposure_bins",
            WorkDim([nh, nw]),
            &mut [
                arg(&mut image),
                arg(&mut bins_ptr),
                arg(&mut nh32),
                arg(&mut nw32),
            ],
        )?;
        // SAFETY: both buffers hold count floats; the host buffer stays alive
        // through the host function below and cuMemFree of the device buffer
        // waits for pending work.
        unsafe {
            self.engine.memcpy_async(
                self.host_bins.data(),
                self.device_bins.data(),
                self.host_bins.byte_size(),
            )?;
        }

        let host_bins = self.host_bins.clone();
        let result = self.result.clone();
        self.engine.run_host_func_async(Box::new(move || {
            let bins: &[f32] = if count == 0 {
                &[]
            } else {
                // SAFETY: pinned memory holding count floats, written by the
                // copy that precedes this function on the stream.
                unsafe { std::slice::from_raw_parts(host_bins.data() as *const f32, count) }
            };
            let exposure = exposure_from_bins(bins);
            tracing::trace!(target: "denoise::cuda", bins = count, exposure, "autoexposure");
            *result.lock() = Some(exposure);
        }))
    }
}

impl Autoexposure for CudaAutoexposure {
    fn src_desc(&self) -> &ImageDesc {
        &self.src_desc
    }

    fn set_src(&mut self, src: Arc<Image>) -> Result<()> {
        if src.width() != self.src_desc.width || src.height() != self.src_desc.height {
            return Err(Error::invalid_argument(format!(
                "autoexposure source is {}x{}, expected {}x{}",
                src.width(),
                src.height(),
                self.src_desc.width,
                self.src_desc.height
            )));
        }
        self.src = Some(bind_image(&self.lifecycle, src)?);
        Ok(())
    }

    fn result(&self) -> Result<f32> {
        (*self.result.lock())
            .ok_or_else(|| Error::logic("autoexposure result is not available before run and wait"))
    }
}
