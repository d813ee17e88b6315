use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use denoise_core::exposure::{bin_range, exposure_from_bins, luminance, num_bins};
use denoise_core::image::load_pixel3;
use denoise_core::op::{bind_image, Lifecycle};
use denoise_core::{Autoexposure, Error, Image, ImageDesc, Op, OpState, Result};

use crate::device::CpuEngine;
use crate::tensor::image_ptr;

// CpuAutoexposure — exposure estimation on the host
//
// One queued job: the bin averages are computed in parallel on the rayon pool,
// then reduced to the exposure on the queue thread. The result slot is shared
// with the job and only holds a value once the job has completed.

pub struct CpuAutoexposure {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    src_desc: ImageDesc,
    src: Option<Arc<Image>>,
    result: Arc<Mutex<Option<f32>>>,
}

impl CpuAutoexposure {
    pub fn new(engine: Arc<CpuEngine>, src_desc: ImageDesc) -> Self {
        CpuAutoexposure {
            engine,
            lifecycle: Lifecycle::new("autoexposure", true),
            src_desc,
            src: None,
            result: Arc::new(Mutex::new(None)),
        }
    }
}

impl Op for CpuAutoexposure {
    fn name(&self) -> &'static str {
        "autoexposure"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle
            .check_finalizable(&[("source", self.src.is_some())])?;
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let Some(src) = self.src.clone() else {
            return self.lifecycle.check_finalized();
        };
        let ptr = image_ptr("autoexposure", "source", &src)?;
        let desc = *src.desc();
        let pool = self.engine.pool().clone();
        let result = self.result.clone();
        *result.lock() = None;

        self.engine.submit(Box::new(move || {
            let _alive = &src;
            let (nh, nw) = num_bins(desc.height, desc.width);
            let bins: Vec<f32> = pool.install(|| {
                (0..nh * nw)
                    .into_par_iter()
                    .map(|bin| {
                        let (h0, h1) = bin_range(bin / nw, nh, desc.height);
                        let (w0, w1) = bin_range(bin % nw, nw, desc.width);
                        let mut sum = 0.0f32;
                        for h in h0..h1 {
                            for w in w0..w1 {
                                // SAFETY: (h, w) is inside the bound image.
                                let rgb = unsafe { load_pixel3(ptr.as_u8(), &desc, h, w) };
                                sum += luminance(rgb);
                            }
                        }
                        sum / ((h1 - h0) * (w1 - w0)) as f32
                    })
                    .collect()
            });
            let exposure = exposure_from_bins(&bins);
            tracing::trace!(target: "denoise::cpu", bins = bins.len(), exposure, "autoexposure");
            *result.lock() = Some(exposure);
            Ok(())
        }))
    }
}

impl Autoexposure for CpuAutoexposure {
    fn src_desc(&self) -> &ImageDesc {
        &self.src_desc
    }

    fn set_src(&mut self, src: Arc<Image>) -> Result<()> {
        if src.width() != self.src_desc.width || src.height() != self.src_desc.height {
            return Err(Error::invalid_argument(format!(
                "autoexposure source is {}x{}, expected {}x{}",
                src.width(),
                src.height(),
                self.src_desc.width,
                self.src_desc.height
            )));
        }
        self.src = Some(bind_image(&self.lifecycle, src)?);
        Ok(())
    }

    fn result(&self) -> Result<f32> {
        (*self.result.lock())
            .ok_or_else(|| Error::logic("autoexposure result is not available before run and wait"))
    }
}
