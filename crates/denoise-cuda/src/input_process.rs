use std::sync::Arc;

use denoise_core::op::{check_tile, Lifecycle};
use denoise_core::{
    Image, InputImages, InputProcess, InputProcessDesc, Op, OpState, Result, Tensor, Tile, WorkDim,
};

use crate::cudnn::activation_dims;
use crate::device::{arg, CudaEngine};
use crate::kernels::{typed_kernel, ImageArg, TileArg, TransferArg};
use crate::tensor::{bind_operand, device_ptr, image_ptr};

// CudaInputProcess — images to network input tensor on the GPU
//
// One thread per tensor pixel. Unbound images are passed as a null ImageArg
// and skipped by the kernel, so channel packing matches the CPU device.

pub struct CudaInputProcess {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    desc: InputProcessDesc,
    kernel: String,
    images: InputImages,
    dst: Option<Arc<dyn Tensor>>,
    tile: Option<Tile>,
}

impl CudaInputProcess {
    pub fn new(engine: Arc<CudaEngine>, desc: InputProcessDesc) -> Self {
        let supported = activation_dims(&desc.dst).is_some();
        CudaInputProcess {
            engine,
            lifecycle: Lifecycle::new("input_process", supported),
            kernel: typed_kernel("input_process", desc.dst.dtype()),
            desc,
            images: InputImages::default(),
            dst: None,
            tile: None,
        }
    }

    fn image_arg(image: &Option<Arc<Image>>) -> Result<ImageArg> {
        match image {
            Some(img) => Ok(ImageArg::new(image_ptr("input_process", "source", img)?, img.desc())),
            None => Ok(ImageArg::none()),
        }
    }
}

impl Op for CudaInputProcess {
    fn name(&self) -> &'static str {
        "input_process"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle.check_finalizable(&[
            ("source", !self.images.is_empty()),
            ("destination", self.dst.is_some()),
        ])?;
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let Some(dst) = &self.dst else {
            return self.lifecycle.check_finalized();
        };
        let (ih, iw) = self.images.size();
        let (th, tw) = (self.desc.dst.h(), self.desc.dst.w());
        let tile = self
            .tile
            .unwrap_or_else(|| Tile::full(ih.min(th), iw.min(tw)));
        check_tile("input_process", &tile, (ih, iw), (th, tw))?;

        let mut dst_ptr = device_ptr("input_process", "destination", dst.as_ref())?;
        let mut color = Self::image_arg(&self.images.color)?;
        let mut albedo = Self::image_arg(&self.images.albedo)?;
        let mut normal = Self::image_arg(&self.images.normal)?;
        let mut tile_arg = TileArg::from(tile);
        let mut tf = TransferArg::new(&self.desc.transfer, self.desc.hdr, self.desc.snorm);
        let (mut c, mut h, mut w) = (self.desc.dst.c() as u32, th as u32, tw as u32);

        self.engine.run_kernel_async(
            &self.kernel,
            WorkDim([th, tw]),
            &mut [
                arg(&mut dst_ptr),
                arg(&mut c),
                arg(&mut h),
                arg(&mut w),
                arg(&mut color),
                arg(&mut albedo),
                arg(&mut normal),
                arg(&mut tile_arg),
                arg(&mut tf),
            ],
        )
    }
}

impl InputProcess for CudaInputProcess {
    fn desc(&self) -> &InputProcessDesc {
        &self.desc
    }

    fn set_src(
        &mut self,
        color: Option<Arc<Image>>,
        albedo: Option<Arc<Image>>,
        normal: Option<Arc<Image>>,
    ) -> Result<()> {
        self.lifecycle.check_configurable()?;
        self.images = InputImages::new(&self.desc, color, albedo, normal)?;
        Ok(())
    }

    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()> {
        self.dst = Some(bind_operand(&self.lifecycle, "destination", &self.desc.dst, dst)?);
        Ok(())
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        self.tile = Some(tile);
        Ok(())
    }

    fn set_input_scale(&mut self, scale: f32) {
        self.desc.transfer.set_input_scale(scale);
    }
}
