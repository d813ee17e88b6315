use std::sync::Arc;

use denoise_core::image::{load_channel, store_channel};
use denoise_core::op::{bind_image, Lifecycle};
use denoise_core::{Error, Image, ImageCopy, Op, OpState, Result, WorkDim};

use crate::device::CpuEngine;
use crate::tensor::image_ptr;

/// Pixel-wise copy between images of the same size.
///
/// Formats may differ: shared channels are converted, destination channels
/// the source lacks are zeroed.
pub struct CpuImageCopy {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    src: Option<Arc<Image>>,
    dst: Option<Arc<Image>>,
}

impl CpuImageCopy {
    pub fn new(engine: Arc<CpuEngine>) -> Self {
        CpuImageCopy {
            engine,
            lifecycle: Lifecycle::new("image_copy", true),
            src: None,
            dst: None,
        }
    }

    fn check_sizes(&self) -> Result<()> {
        if let (Some(src), Some(dst)) = (&self.src, &self.dst) {
            if !src.same_size(dst) {
                return Err(Error::invalid_argument(format!(
                    "image copy between {}x{} and {}x{} images",
                    src.width(),
                    src.height(),
                    dst.width(),
                    dst.height()
                )));
            }
        }
        Ok(())
    }
}

impl Op for CpuImageCopy {
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
        let (Some(src), Some(dst)) = (self.src.clone(), self.dst.clone()) else {
            return self.lifecycle.check_finalized();
        };
        let src_ptr = image_ptr("image_copy", "source", &src)?;
        let dst_ptr = image_ptr("image_copy", "destination", &dst)?;
        let (src_desc, dst_desc) = (*src.desc(), *dst.desc());
        let shared = src_desc.format.num_channels().min(dst_desc.format.num_channels());
        let channels = dst_desc.format.num_channels();

        let global = WorkDim([dst_desc.height, dst_desc.width]);
        self.engine.run_kernel_async(global, move |[h, w]| {
            let _alive = (&src, &dst);
            for c in 0..channels {
                // SAFETY: both images are h x w and c is below each channel count.
                unsafe {
                    let v = if c < shared {
                        load_channel(src_ptr.as_u8(), &src_desc, h, w, c)
                    } else {
                        0.0
                    };
                    store_channel(dst_ptr.as_u8(), &dst_desc, h, w, c, v);
                }
            }
        })
    }
}

impl ImageCopy for CpuImageCopy {
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
