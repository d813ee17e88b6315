use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{Error, Op, OpState, Pool, PoolDesc, Result, Tensor};

use crate::cudnn::{activation_dims, Descriptor};
use crate::device::CudaEngine;
use crate::tensor::{bind_operand, device_ptr};

struct PoolNative {
    src: Descriptor,
    dst: Descriptor,
    pool: Descriptor,
}

impl PoolNative {
    fn new(engine: &CudaEngine, desc: &PoolDesc) -> Result<Self> {
        let (Some(src), Some(dst)) = (activation_dims(&desc.src), activation_dims(desc.dst())) else {
            return Err(Error::invalid_argument(format!(
                "cuda pooling requires planar f32/f16 activations, got {}",
                desc.src
            )));
        };
        let lib = engine.cudnn_lib();
        let dtype = desc.src.dtype();
        Ok(PoolNative {
            src: lib.tensor_4d(src, dtype)?,
            dst: lib.tensor_4d(dst, dtype)?,
            pool: lib.max_pool_2x2()?,
        })
    }
}

/// 2x2 max pooling on the CUDA device (cuDNN).
pub struct CudaPool {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    desc: PoolDesc,
    native: Option<PoolNative>,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
}

impl CudaPool {
    pub fn new(engine: Arc<CudaEngine>, desc: PoolDesc) -> Self {
        let native = PoolNative::new(&engine, &desc)
            .map_err(|e| tracing::debug!(target: "denoise::cuda", error = %e, "pooling unsupported"))
            .ok();
        CudaPool {
            engine,
            lifecycle: Lifecycle::new("pool", native.is_some()),
            desc,
            native,
            src: None,
            dst: None,
        }
    }
}

impl Op for CudaPool {
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
        let (Some(native), Some(src), Some(dst)) = (&self.native, &self.src, &self.dst) else {
            return self.lifecycle.check_finalized();
        };
        let src_ptr = device_ptr("pool", "source", src.as_ref())?;
        let dst_ptr = device_ptr("pool", "destination", dst.as_ref())?;
        let handle = self.engine.cudnn()?;
        // SAFETY: both pointers are bound to memory matching the descriptors.
        unsafe { handle.pooling_forward(&native.pool, &native.src, src_ptr, &native.dst, dst_ptr) }
    }
}

impl Pool for CudaPool {
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
