use std::sync::Arc;

use denoise_core::image::load_pixel3;
use denoise_core::op::{check_tile, Lifecycle};
use denoise_core::transfer::HDR_MAX;
use denoise_core::{
    Image, ImageDesc, InputImages, InputProcess, InputProcessDesc, Op, OpState, Result, Tensor,
    Tile, TransferFunction, WorkDim,
};

use crate::device::CpuEngine;
use crate::dnn::MemoryDesc;
use crate::kernels::SyncPtr;
use crate::tensor::{bind_operand, bound_ptr, image_ptr};

// CpuInputProcess — images to network input tensor
//
// One work item per tensor pixel (h, w) writes all C channels of that pixel:
//
//   channels  0..3   color   x input_scale, clamped, transfer-encoded
//             3..6   albedo  clamped to [0, 1]
//             6..9   normal  clamped to [-1, 1], remapped to [0, 1] unless snorm
//             ..C    zero
//
// Images that are not bound are skipped, so the next bound image takes their
// channels. Pixels outside the tile are zero in every channel. Without an
// explicit tile the images are mapped onto the tensor origin.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Color,
    Albedo,
    Normal,
}

#[derive(Clone, Copy)]
struct Source {
    role: Role,
    ptr: SyncPtr<u8>,
    desc: ImageDesc,
}

#[derive(Clone, Copy)]
struct Params {
    transfer: TransferFunction,
    hdr: bool,
    snorm: bool,
}

impl Params {
    #[inline]
    fn encode(&self, role: Role, v: f32) -> f32 {
        let v = if v.is_nan() { 0.0 } else { v };
        match role {
            Role::Color => {
                let v = v * self.transfer.input_scale();
                let v = if self.hdr {
                    v.clamp(0.0, HDR_MAX)
                } else {
                    v.clamp(0.0, 1.0)
                };
                self.transfer.forward(v)
            }
            Role::Albedo => v.clamp(0.0, 1.0),
            Role::Normal => {
                let v = v.clamp(-1.0, 1.0);
                if self.snorm {
                    v
                } else {
                    v * 0.5 + 0.5
                }
            }
        }
    }
}

pub struct CpuInputProcess {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    desc: InputProcessDesc,
    images: InputImages,
    dst: Option<Arc<dyn Tensor>>,
    tile: Option<Tile>,
}

impl CpuInputProcess {
    pub fn new(engine: Arc<CpuEngine>, desc: InputProcessDesc) -> Self {
        let supported = MemoryDesc::new(&desc.dst).is_ok();
        CpuInputProcess {
            engine,
            lifecycle: Lifecycle::new("input_process", supported),
            desc,
            images: InputImages::default(),
            dst: None,
            tile: None,
        }
    }

    fn sources(&self) -> Result<Vec<Source>> {
        let roles = [
            (Role::Color, &self.images.color),
            (Role::Albedo, &self.images.albedo),
            (Role::Normal, &self.images.normal),
        ];
        roles
            .into_iter()
            .filter_map(|(role, image)| image.as_ref().map(|img| (role, img)))
            .map(|(role, img)| {
                Ok(Source {
                    role,
                    ptr: image_ptr("input_process", "source", img)?,
                    desc: *img.desc(),
                })
            })
            .collect()
    }
}

impl Op for CpuInputProcess {
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
        let Some(dst) = self.dst.clone() else {
            return self.lifecycle.check_finalized();
        };
        let dst_desc = self.desc.dst.clone();
        let (ih, iw) = self.images.size();
        let (th, tw) = (dst_desc.h(), dst_desc.w());
        let tile = self
            .tile
            .unwrap_or_else(|| Tile::full(ih.min(th), iw.min(tw)));
        check_tile("input_process", &tile, (ih, iw), (th, tw))?;
        let dst_ptr = bound_ptr::<f32>("input_process", "destination", dst.as_ref())?;
        let sources = self.sources()?;
        let images: Vec<Arc<Image>> = self.images.iter().cloned().collect();
        let params = Params {
            transfer: self.desc.transfer,
            hdr: self.desc.hdr,
            snorm: self.desc.snorm,
        };
        let c = dst_desc.c();

        let global = WorkDim([dst_desc.h(), dst_desc.w()]);
        self.engine.run_kernel_async(global, move |[h, w]| {
            let _alive = (&images, &dst);
            let inside = h >= tile.h_dst
                && h < tile.h_dst + tile.h
                && w >= tile.w_dst
                && w < tile.w_dst + tile.w;
            let mut ch = 0;
            if inside {
                let (hs, ws) = (h - tile.h_dst + tile.h_src, w - tile.w_dst + tile.w_src);
                for src in &sources {
                    // SAFETY: check_tile guarantees (hs, ws) is inside every image.
                    let rgb = unsafe { load_pixel3(src.ptr.as_u8(), &src.desc, hs, ws) };
                    for v in rgb {
                        let off = dst_desc.activation_offset(0, ch, h, w);
                        // SAFETY: ch < C since InputImages checked 3 * count <= C.
                        unsafe { dst_ptr.set(off, params.encode(src.role, v)) };
                        ch += 1;
                    }
                }
            }
            for ch in ch..c {
                // SAFETY: the remaining channels of this pixel.
                unsafe { dst_ptr.set(dst_desc.activation_offset(0, ch, h, w), 0.0) };
            }
        })
    }
}

impl InputProcess for CpuInputProcess {
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
