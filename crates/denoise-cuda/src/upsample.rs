use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{Op, OpState, Result, Tensor, Upsample, UpsampleDesc, WorkDim};

use crate::cudnn::activation_dims;
use crate::device::{arg, CudaEngine};
use crate::kernels::typed_kernel;
use crate::tensor::{bind_operand, device_ptr};

/// 2x nearest-neighbour upsampling on the CUDA device.
///
/// One thread per source element writes the 2x2 block it expands to.
pub struct CudaUpsample {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    desc: UpsampleDesc,
    kernel: String,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
}

impl CudaUpsample {
    pub fn new(engine: Arc<CudaEngine>, desc: UpsampleDesc) -> Self {
        let supported = activation_dims(&desc.src).is_some();
        CudaUpsample {
            engine,
            lifecycle: Lifecycle::new("upsample", supported),
            kernel: typed_kernel("upsample", desc.src.dtype()),
            desc,
            src: None,
            dst: None,
        }
    }
}

impl Op for CudaUpsample {
    fn name(&self) -> &'static str {
        "upsample"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle.check_finalizable(&[
            ("source", self.src.is_some()),
            ("destination", self.dst.is_some()),
        ])?;
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let (Some(src), Some(dst)) = (&self.src, &self.dst) else {
            return self.lifecycle.check_finalized();
        };
        let mut src_ptr = device_ptr("upsample", "source", src.as_ref())?;
        let mut dst_ptr = device_ptr("upsample", "destination", dst.as_ref())?;
        let desc = &self.desc.src;
        let nc = desc.n() * desc.c();
        let (mut nc32, mut h, mut w) = (nc as u32, desc.h() as u32, desc.w() as u32);
        self.engine.run_kernel_async(
            &self.kernel,
            WorkDim([nc, desc.h(), desc.w()]),
            &mut [
                arg(&mut src_ptr),
                arg(&mut dst_ptr),
                arg(&mut nc32),
                arg(&mut h),
                arg(&mut w),
            ],
        )
    }
}

impl Upsample for CudaUpsample {
    fn desc(&self) -> &UpsampleDesc {
        &self.desc
    }

    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()> {
        self.src = Some(bind_operand(&self.lifecycle, "source", &self.desc.src, src)?);
        Ok(())
    }

    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()> {
        self.dst = Some(bind_operand(&self.lifecycle, "destination", self.desc.dst(), dst)?);
        Ok(())
    }
}
