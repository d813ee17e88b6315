use std::sync::Arc;

use denoise_core::op::{bind_image, Lifecycle};
use denoise_core::{Error, Image, ImageCopy, Op, OpState, Result, WorkDim};

use crate::device::{arg, CudaEngine};
use crate::kernels::ImageArg;
use crate::tensor::image_ptr;

/// Pixel-wise copy between images of the same size on the CUDA device.
pub struct CudaImageCopy {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    src: Option<Arc<Image>>,
    dst: Option<Arc<Image>>,
}

impl CudaImageCopy {
    pub fn new(engine: Arc<CudaEngine>) -> Self {
        CudaImageCopy {
            engine,
            lifecycle: Lifecycle::new("image_copy", true),
            src: None,
            dst: None,
        }
    }

    fn check_sizes(&self) -> Result<()> {
        match (&self.src, &self.dst) {
            (Some(src), Some(dst)) if !src.same_size(dst) => Err(Error::invalid_argument(format!(
                "image copy between {}x{} and {}x{} images",
                src.width(),
                src.height(),
                dst.width(),
                dst.height()
            ))),
            _ => Ok(()),
        }
    }
}

impl Op for CudaImageCopy {
    fn name(&self) -> &'static str {
        "image_copy"
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
        let mut src_arg = ImageArg::new(image_ptr("image_copy", "source", src)?, src.desc());
        let mut dst_arg = ImageArg::new(image_ptr("image_copy", "destination", dst)?, dst.desc());
        self.engine.run_kernel_async(
            "image_copy",
            WorkDim([dst.height(), dst.width()]),
            &mut [arg(&mut src_arg), arg(&mut dst_arg)],
        )
    }
}

impl ImageCopy for CudaImageCopy {
    fn set_src(&mut self, src: Arc<Image>) -> Result<()> {
        let prev = self.src.replace(bind_image(&self.lifecycle, src)?);
        if let Err(e) = self.check_sizes() {
            self.src = prev;
            return Err(e);
        }
        Ok(())
    }

    fn set_dst(&mut self, dst: Arc<Image>) -> Result<()> {
        let prev = self.dst.replace(bind_image(&self.lifecycle, dst)?);
        if let Err(e) = self.check_sizes() {
            self.dst = prev;
            return Err(e);
        }
        Ok(())
    }
}
