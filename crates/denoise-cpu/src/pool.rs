use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{Op, OpState, Pool, PoolDesc, Result, Tensor, WorkDim};

use crate::device::CpuEngine;
use crate::dnn::MemoryDesc;
use crate::tensor::{bind_operand, bound_ptr};

/// 2x2 max pooling on the CPU device.
pub struct CpuPool {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    desc: PoolDesc,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
}

impl CpuPool {
    pub fn new(engine: Arc<CpuEngine>, desc: PoolDesc) -> Self {
        let supported = MemoryDesc::new(&desc.src).is_ok();
        CpuPool {
            engine,
            lifecycle: Lifecycle::new("pool", supported),
            desc,
            src: None,
            dst: None,
        }
    }
}

impl Op for CpuPool {
    fn name(&self) -> &'static str {
        "pool"
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
        let src_ptr = bound_ptr::<f32>("pool", "source", src.as_ref())?;
        let dst_ptr = bound_ptr::<f32>("pool", "destination", dst.as_ref())?;
        let src_desc = self.desc.src.clone();
        let dst_desc = self.desc.dst().clone();
        let c = dst_desc.c();
        let global = WorkDim([dst_desc.n() * c, dst_desc.h(), dst_desc.w()]);
        self.engine.run_kernel_async(global, move |[nc, y, x]| {
            let _alive = (&src, &dst);
            let (n, ch) = (nc / c, nc % c);
            let mut v = f32::NEG_INFINITY;
            for dy in 0..2 {
                for dx in 0..2 {
                    let off = src_desc.activation_offset(n, ch, 2 * y + dy, 2 * x + dx);
                    // SAFETY: 2y+1 < H and 2x+1 < W because the destination is floor(H/2) x floor(W/2).
                    v = v.max(unsafe { src_ptr.get(off) });
                }
            }
            // SAFETY: each destination element is written by one work item.
            unsafe { dst_ptr.set(dst_desc.activation_offset(n, ch, y, x), v) };
        })
    }
}

impl Pool for CpuPool {
    fn desc(&self) -> &PoolDesc {
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
