use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{Op, OpState, Result, Tensor, Upsample, UpsampleDesc, WorkDim};

use crate::device::CpuEngine;
use crate::dnn::MemoryDesc;
use crate::tensor::{bind_operand, bound_ptr};

/// 2x nearest-neighbour upsampling on the CPU device.
///
/// One work item per source element writes the 2x2 block it expands to.
pub struct CpuUpsample {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    desc: UpsampleDesc,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
}

impl CpuUpsample {
    pub fn new(engine: Arc<CpuEngine>, desc: UpsampleDesc) -> Self {
        let supported = MemoryDesc::new(&desc.src).is_ok();
        CpuUpsample {
            engine,
            lifecycle: Lifecycle::new("upsample", supported),
            desc,
            src: None,
            dst: None,
        }
    }
}

impl Op for CpuUpsample {
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
        let (Some(src), Some(dst)) = (self.src.clone(), self.dst.clone()) else {
            return self.lifecycle.check_finalized();
        };
        let src_ptr = bound_ptr::<f32>("upsample", "source", src.as_ref())?;
        let dst_ptr = bound_ptr::<f32>("upsample", "destination", dst.as_ref())?;
        let src_desc = self.desc.src.clone();
        let dst_desc = self.desc.dst().clone();
        let c = src_desc.c();
        let global = WorkDim([src_desc.n() * c, src_desc.h(), src_desc.w()]);
        self.engine.run_kernel_async(global, move |[nc, y, x]| {
            let _alive = (&src, &dst);
            let (n, ch) = (nc / c, nc % c);
            // SAFETY: (n, ch, y, x) is inside the source.
            let v = unsafe { src_ptr.get(src_desc.activation_offset(n, ch, y, x)) };
            for dy in 0..2 {
                for dx in 0..2 {
                    let off = dst_desc.activation_offset(n, ch, 2 * y + dy, 2 * x + dx);
                    // SAFETY: the 2x2 block belongs to this work item only.
                    unsafe { dst_ptr.set(off, v) };
                }
            }
        })
    }
}

impl Upsample for CpuUpsample {
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
