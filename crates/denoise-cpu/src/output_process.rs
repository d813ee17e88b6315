use std::sync::Arc;

use denoise_core::image::store_pixel3;
use denoise_core::op::{bind_image, check_tile, Lifecycle};
use denoise_core::{
    Image, Op, OpState, OutputProcess, OutputProcessDesc, Result, Tensor, Tile, WorkDim,
};

use crate::device::CpuEngine;
use crate::dnn::MemoryDesc;
use crate::tensor::{bind_operand, bound_ptr, image_ptr};

// CpuOutputProcess — network output tensor to image
//
// One work item per tile pixel reads channels 0..3 of the tensor at the tile
// source, decodes them and stores them at the tile destination of the image.
// NaN becomes 0 and negative values are cut before decoding; LDR output is
// clamped to 1. A snorm output is remapped from [0, 1] to [-1, 1].

pub struct CpuOutputProcess {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    desc: OutputProcessDesc,
    src: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<Image>>,
    tile: Option<Tile>,
}

impl CpuOutputProcess {
    pub fn new(engine: Arc<CpuEngine>, desc: OutputProcessDesc) -> Self {
        let supported = MemoryDesc::new(&desc.src).is_ok();
        CpuOutputProcess {
            engine,
            lifecycle: Lifecycle::new("output_process", supported),
            desc,
            src: None,
            dst: None,
            tile: None,
        }
    }
}

impl Op for CpuOutputProcess {
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
        let (Some(src), Some(dst)) = (self.src.clone(), self.dst.clone()) else {
            return self.lifecycle.check_finalized();
        };
        let src_desc = self.desc.src.clone();
        let (th, tw) = (src_desc.h(), src_desc.w());
        let (ih, iw) = (dst.height(), dst.width());
        let tile = self
            .tile
            .unwrap_or_else(|| Tile::full(ih.min(th), iw.min(tw)));
        // Source and destination swap roles relative to input processing.
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
        let src_ptr = bound_ptr::<f32>("output_process", "source", src.as_ref())?;
        let dst_ptr = image_ptr("output_process", "destination", &dst)?;
        let image_desc = *dst.desc();
        let transfer = self.desc.transfer;
        let (hdr, snorm) = (self.desc.hdr, self.desc.snorm);

        self.engine
            .run_kernel_async(WorkDim([tile.h, tile.w]), move |[h, w]| {
                let _alive = (&src, &dst);
                let (hs, ws) = (tile.h_src + h, tile.w_src + w);
                let mut rgb = [0.0f32; 3];
                for (c, out) in rgb.iter_mut().enumerate() {
                    // SAFETY: (hs, ws) is inside the tensor and C >= 3.
                    let v = unsafe { src_ptr.get(src_desc.activation_offset(0, c, hs, ws)) };
                    let v = if v.is_nan() { 0.0 } else { v.max(0.0) };
                    let mut v = transfer.inverse(v) / transfer.input_scale();
                    if !hdr {
                        v = v.min(1.0);
                    }
                    if snorm {
                        v = (v * 2.0 - 1.0).clamp(-1.0, 1.0);
                    }
                    *out = v;
                }
                let (hd, wd) = (tile.h_dst + h, tile.w_dst + w);
                // SAFETY: (hd, wd) is inside the image and owned by this work item.
                unsafe { store_pixel3(dst_ptr.as_u8(), &image_desc, hd, wd, rgb) };
            })
    }
}

impl OutputProcess for CpuOutputProcess {
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
