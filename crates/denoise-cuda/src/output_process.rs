use std::sync::Arc;

use denoise_core::op::{bind_image, check_tile, Lifecycle};
use denoise_core::{
    Image, Op, OpState, OutputProcess, OutputProcessDesc, Result, Tensor, Tile, WorkDim,
};

use crate::cudnn::activation_dims;
use crate::device::{arg, CudaEngine};
use crate::kernels::{typed_kernel, ImageArg, TileArg, TransferArg};
use crate::tensor::{bind_operand, device_ptr, image_ptr};

/// Network output tensor to image on the CUDA device, one thread per tile
/// pixel.
pub struct CudaOutputProcess {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    desc: OutputProcessDesc,
    kernel: String,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<Image>>,
    tile: Option<Tile>,
}

impl CudaOutputProcess {
    pub fn new(engine: Arc<CudaEngine>, desc: OutputProcessDesc) -> Self {
        let supported = activation_dims(&desc.src).is_some();
        CudaOutputProcess {
            engine,
            lifecycle: Lifecycle::new("output_process", supported),
            kernel: typed_kernel("output_process", desc.src.dtype()),
            desc,
            src: None,
            dst: None,
            tile: None,
        }
    }
}

impl Op for CudaOutputProcess {
    fn name(&self) -> &'static str {
        "output_process"
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
        let (th, tw) = (self.desc.src.h(), self.desc.src.w());
        let (ih, iw) = (dst.height(), dst.width());
        let tile = self
            .tile
            .unwrap_or_else(|| Tile::full(ih.min(th), iw.min(tw)));
        // The tensor is the tile source here, so the roles are swapped for the check.
        check_tile(
            "output_process",
            &Tile {
                h_src: tile.h_dst,
                w_src: tile.w_dst,
                h_dst: tile.h_src,
                w_dst: tile.w_src,
                ..tile
            },
            (ih, iw),
            (th, tw),
        )?;

        let mut src_ptr = device_ptr("output_process", "source", src.as_ref())?;
        let mut image = ImageArg::new(image_ptr("output_process", "destination", dst)?, dst.desc());
        let mut tile_arg = TileArg::from(tile);
        let mut tf = TransferArg::new(&self.desc.transfer, self.desc.hdr, self.desc.snorm);
        let (mut h, mut w) = (th as u32, tw as u32);

        self.engine.run_kernel_async(
            &self.kernel,
            WorkDim([tile.h, tile.w]),
            &mut [
                arg(&mut src_ptr),
                arg(&mut h),
                arg(&mut w),
                arg(&mut image),
                arg(&mut tile_arg),
                arg(&mut tf),
            ],
        )
    }
}

impl OutputProcess for CudaOutputProcess {
    fn desc(&self) -> &OutputProcessDesc {
        &self.desc
    }

    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()> {
        self.src = Some(bind_operand(&self.lifecycle, "source", &self.desc.src, src)?);
        Ok(())
    }

    fn set_dst(&mut self, dst: Arc<Image>) -> Result<()> {
        self.dst = Some(bind_image(&self.lifecycle, dst)?);
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
