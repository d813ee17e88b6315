use std::sync::Arc;

use crate::error::{Error, Result};
use crate::image::{Image, ImageDesc};
use crate::op_desc::{ConvDesc, InputProcessDesc, OutputProcessDesc, PoolDesc, UpsampleDesc};
use crate::tensor::{check_operand, Tensor};
use crate::tensor_desc::TensorDesc;
use crate::transfer::Tile;

// Op — operator lifecycle shared by every backend
//
// An operator is created by a Device from a descriptor, then driven through
// a fixed sequence:
//
//   create(desc) ──► set operands / scratch ──► finalize() ──► run() ...
//
// STATES:
//
//   Unsupported  the backend cannot build a native primitive for the
//                descriptor. is_supported() is false; finalize() fails.
//   Configured   operands may be (re)bound.
//   Finalized    the native primitive exists; run() may be called any number
//                of times. Operands can no longer be rebound.
//
// Every misuse is a Logic error and leaves the state unchanged:
//
//   finalize() twice                    "conv already finalized"
//   finalize() with an operand missing  "conv source not set before finalization"
//   run() before finalize()             "conv not finalized" (nothing enqueued)
//
// run() never blocks. It enqueues the work on the device queue and returns;
// errors raised while the queued work executes surface from Device::wait().

/// Where an operator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    Unsupported,
    Configured,
    Finalized,
}

/// The state machine behind [`OpState`], embedded in every operator.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: &'static str,
    state: OpState,
}

impl Lifecycle {
    pub fn new(name: &'static str, supported: bool) -> Self {
        let state = if supported {
            OpState::Configured
        } else {
            OpState::Unsupported
        };
        Lifecycle { name, state }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    pub fn is_supported(&self) -> bool {
        self.state != OpState::Unsupported
    }

    /// Operands and scratch may only change before finalization.
    pub fn check_configurable(&self) -> Result<()> {
        if self.state == OpState::Finalized {
            return Err(Error::logic(format!(
                "cannot rebind operands of finalized {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Fails if the operator is unsupported.
    pub fn check_supported(&self) -> Result<()> {
        if self.state == OpState::Unsupported {
            return Err(Error::logic(format!(
                "{} is not supported by this device",
                self.name
            )));
        }
        Ok(())
    }

    /// Validate that finalize() may proceed. `operands` lists each required
    /// operand with whether it has been bound.
    pub fn check_finalizable(&self, operands: &[(&str, bool)]) -> Result<()> {
        self.check_supported()?;
        if self.state == OpState::Finalized {
            return Err(Error::logic(format!("{} already finalized", self.name)));
        }
        let missing: Vec<&str> = operands
            .iter()
            .filter(|(_, bound)| !bound)
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(Error::logic(format!(
                "{} {} not set before finalization",
                self.name,
                missing.join("/")
            )));
        }
        Ok(())
    }

    pub fn mark_finalized(&mut self) {
        self.state = OpState::Finalized;
    }

    /// run() is only valid once finalized.
    pub fn check_finalized(&self) -> Result<()> {
        if self.state != OpState::Finalized {
            return Err(Error::logic(format!("{} not finalized", self.name)));
        }
        Ok(())
    }
}

/// Bind a tensor operand after checking the lifecycle and its descriptor.
pub fn bind_tensor(
    lifecycle: &Lifecycle,
    operand: &str,
    expected: &TensorDesc,
    tensor: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>> {
    lifecycle.check_configurable()?;
    check_operand(lifecycle.name(), operand, expected, tensor.as_ref())?;
    Ok(tensor)
}

/// Bind an operand that finalize() does not require.
///
/// Unlike [`bind_tensor`], a first binding is accepted after finalization;
/// only replacing an already bound tensor is rejected.
pub fn bind_optional_tensor(
    lifecycle: &Lifecycle,
    operand: &str,
    expected: &TensorDesc,
    bound: bool,
    tensor: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>> {
    if bound {
        lifecycle.check_configurable()?;
    }
    check_operand(lifecycle.name(), operand, expected, tensor.as_ref())?;
    Ok(tensor)
}

/// Bind an image operand after checking the lifecycle.
pub fn bind_image(lifecycle: &Lifecycle, image: Arc<Image>) -> Result<Arc<Image>> {
    lifecycle.check_configurable()?;
    Ok(image)
}

/// Common interface of every operator.
pub trait Op: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> OpState;

    /// Whether the device can execute this operator. Never fails.
    fn is_supported(&self) -> bool {
        self.state() != OpState::Unsupported
    }

    /// Scratch memory the operator wants, a pure function of its descriptor.
    /// Only meaningful for supported operators.
    fn scratch_byte_size(&self) -> Result<usize> {
        Ok(0)
    }

    /// Bind shared scratch memory. A scratch smaller than
    /// `scratch_byte_size()` restricts the algorithms that can be chosen.
    fn set_scratch(&mut self, _scratch: Arc<dyn Tensor>) -> Result<()> {
        Ok(())
    }

    /// Build the native primitive (may search for the fastest algorithm).
    fn finalize(&mut self) -> Result<()>;

    /// Enqueue one execution on the device queue.
    fn run(&self) -> Result<()>;
}

/// Convolution with bias and fused activation.
pub trait Conv: Op {
    fn desc(&self) -> &ConvDesc;
    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()>;
    fn set_weight(&mut self, weight: Arc<dyn Tensor>) -> Result<()>;
    fn set_bias(&mut self, bias: Arc<dyn Tensor>) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()>;
}

/// 2x2 max pooling.
pub trait Pool: Op {
    fn desc(&self) -> &PoolDesc;
    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()>;
}

/// 2x nearest-neighbour upsampling.
pub trait Upsample: Op {
    fn desc(&self) -> &UpsampleDesc;
    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()>;
}

/// Exposure estimation of a color image.
pub trait Autoexposure: Op {
    fn src_desc(&self) -> &ImageDesc;
    fn set_src(&mut self, src: Arc<Image>) -> Result<()>;

    /// The estimated exposure. Only valid after the device has been waited on
    /// following run().
    fn result(&self) -> Result<f32>;
}

/// Image(s) to network tensor conversion.
pub trait InputProcess: Op {
    fn desc(&self) -> &InputProcessDesc;

    /// Bind the input images. At least one must be given, all must have the
    /// same size, and their channels must fit the destination tensor.
    fn set_src(
        &mut self,
        color: Option<Arc<Image>>,
        albedo: Option<Arc<Image>>,
        normal: Option<Arc<Image>>,
    ) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()>;

    /// Tiles may change between runs, also after finalization.
    fn set_tile(&mut self, tile: Tile) -> Result<()>;
    fn set_input_scale(&mut self, scale: f32);
}

/// Network tensor to image conversion.
pub trait OutputProcess: Op {
    fn desc(&self) -> &OutputProcessDesc;
    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<Image>) -> Result<()>;
    fn set_tile(&mut self, tile: Tile) -> Result<()>;
    fn set_input_scale(&mut self, scale: f32);
}

/// Copy between two images of the same size (formats may differ).
pub trait ImageCopy: Op {
    fn set_src(&mut self, src: Arc<Image>) -> Result<()>;
    fn set_dst(&mut self, dst: Arc<Image>) -> Result<()>;
}

/// The images bound to an input processing operator, in channel order.
#[derive(Debug, Clone, Default)]
pub struct InputImages {
    pub color: Option<Arc<Image>>,
    pub albedo: Option<Arc<Image>>,
    pub normal: Option<Arc<Image>>,
}

impl InputImages {
    pub fn new(
        desc: &InputProcessDesc,
        color: Option<Arc<Image>>,
        albedo: Option<Arc<Image>>,
        normal: Option<Arc<Image>>,
    ) -> Result<Self> {
        let images = InputImages {
            color,
            albedo,
            normal,
        };
        let Some(first) = images.iter().next() else {
            return Err(Error::invalid_argument(
                "input processing needs at least one input image",
            ));
        };
        if images.iter().any(|img| !img.same_size(first)) {
            return Err(Error::invalid_argument(
                "input images must all have the same size",
            ));
        }
        let channels = 3 * images.iter().count();
        if channels > desc.dst.c() {
            return Err(Error::invalid_argument(format!(
                "{channels} input channels do not fit destination {}",
                desc.dst
            )));
        }
        Ok(images)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Image>> {
        [&self.color, &self.albedo, &self.normal]
            .into_iter()
            .flatten()
    }

    /// `(height, width)` shared by all images.
    pub fn size(&self) -> (usize, usize) {
        self.iter()
            .next()
            .map_or((0, 0), |img| (img.height(), img.width()))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn update_ptrs(&self) -> Result<()> {
        self.iter().try_for_each(|img| img.update_ptr())
    }
}

/// Check that a tile fits both the image and the tensor it maps between.
pub fn check_tile(
    op: &str,
    tile: &Tile,
    image: (usize, usize),
    tensor: (usize, usize),
) -> Result<()> {
    let (ih, iw) = image;
    let (th, tw) = tensor;
    if tile.h_src + tile.h > ih
        || tile.w_src + tile.w > iw
        || tile.h_dst + tile.h > th
        || tile.w_dst + tile.w > tw
    {
        return Err(Error::invalid_argument(format!(
            "{op} tile {tile:?} does not fit image {ih}x{iw} / tensor {th}x{tw}"
        )));
    }
    Ok(())
}
