use crate::error::{Error, Result};
use crate::image::ImageDesc;
use crate::layout::TensorLayout;
use crate::tensor_desc::TensorDesc;
use crate::transfer::TransferFunction;

// Operator descriptors
//
// A descriptor fixes everything about an operator that determines its
// native primitive: operand shapes/layouts/types and the fused activation.
// Descriptors are immutable; binding concrete tensors happens later on the
// operator instance, and every bound tensor must match the descriptor.
//
// Constructors only validate structure (ranks, channel agreement). Whether a
// backend can execute a given layout/type combination is reported by the
// operator's is_supported(), never by the descriptor.

/// Activation fused after the primary computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    #[default]
    None,
    ReLU,
}

/// 2-D convolution with "same" padding and unit stride, plus bias and
/// optional activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvDesc {
    pub src: TensorDesc,
    pub weight: TensorDesc,
    pub bias: TensorDesc,
    pub activation: Activation,
    dst: TensorDesc,
}

impl ConvDesc {
    pub fn new(
        src: TensorDesc,
        weight: TensorDesc,
        bias: TensorDesc,
        activation: Activation,
    ) -> Result<Self> {
        if !src.layout().is_activation() {
            return Err(Error::invalid_argument(format!(
                "convolution source must be an activation tensor, got {src}"
            )));
        }
        if !weight.layout().is_weight() {
            return Err(Error::invalid_argument(format!(
                "convolution weight must use a weight layout, got {weight}"
            )));
        }
        if weight.i() != src.c() {
            return Err(Error::invalid_argument(format!(
                "convolution weight expects {} input channels, source has {}",
                weight.i(),
                src.c()
            )));
        }
        if weight.kh() % 2 == 0 || weight.kw() % 2 == 0 {
            return Err(Error::invalid_argument(format!(
                "convolution kernel {}x{} must have odd sizes",
                weight.kh(),
                weight.kw()
            )));
        }
        if bias.layout() != TensorLayout::X || bias.dims() != [weight.o()] {
            return Err(Error::invalid_argument(format!(
                "convolution bias must be a vector of {} values, got {bias}",
                weight.o()
            )));
        }
        let mut dims = src.dims().to_vec();
        let c_axis = dims.len() - 3;
        dims[c_axis] = weight.o();
        let dst = src.with_dims(dims)?;
        Ok(ConvDesc {
            src,
            weight,
            bias,
            activation,
            dst,
        })
    }

    /// Descriptor of the output tensor (same layout/type as the source).
    pub fn dst(&self) -> &TensorDesc {
        &self.dst
    }

    /// Zero padding on each side, `[top/bottom, left/right]`.
    pub fn padding(&self) -> [usize; 2] {
        [self.weight.kh() / 2, self.weight.kw() / 2]
    }
}

fn check_spatial(kind: &str, src: &TensorDesc) -> Result<()> {
    if !src.layout().is_activation() {
        return Err(Error::invalid_argument(format!(
            "{kind} source must be an activation tensor, got {src}"
        )));
    }
    Ok(())
}

fn resized(src: &TensorDesc, h: usize, w: usize) -> Result<TensorDesc> {
    let mut dims = src.dims().to_vec();
    let n = dims.len();
    dims[n - 2] = h;
    dims[n - 1] = w;
    src.with_dims(dims)
}

/// 2x2 max pooling with stride 2.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolDesc {
    pub src: TensorDesc,
    dst: TensorDesc,
}

impl PoolDesc {
    pub fn new(src: TensorDesc) -> Result<Self> {
        check_spatial("pooling", &src)?;
        if src.h() < 2 || src.w() < 2 {
            return Err(Error::invalid_argument(format!(
                "pooling source {src} is smaller than the 2x2 window"
            )));
        }
        let dst = resized(&src, src.h() / 2, src.w() / 2)?;
        Ok(PoolDesc { src, dst })
    }

    pub fn dst(&self) -> &TensorDesc {
        &self.dst
    }
}

/// 2x nearest-neighbour upsampling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpsampleDesc {
    pub src: TensorDesc,
    dst: TensorDesc,
}

impl UpsampleDesc {
    pub fn new(src: TensorDesc) -> Result<Self> {
        check_spatial("upsampling", &src)?;
        let dst = resized(&src, src.h() * 2, src.w() * 2)?;
        Ok(UpsampleDesc { src, dst })
    }

    pub fn dst(&self) -> &TensorDesc {
        &self.dst
    }
}

/// Conversion of input images (color, albedo, normal) into a network tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct InputProcessDesc {
    pub dst: TensorDesc,
    pub transfer: TransferFunction,
    pub hdr: bool,
    /// Normals are kept in [-1, 1] instead of being remapped to [0, 1].
    pub snorm: bool,
}

impl InputProcessDesc {
    pub fn new(dst: TensorDesc, transfer: TransferFunction, hdr: bool, snorm: bool) -> Result<Self> {
        check_spatial("input processing", &dst)?;
        if dst.n() != 1 {
            return Err(Error::invalid_argument(format!(
                "input processing writes a single image, got {dst}"
            )));
        }
        if dst.c() < 3 {
            return Err(Error::invalid_argument(format!(
                "input processing needs at least 3 channels, got {dst}"
            )));
        }
        Ok(InputProcessDesc {
            dst,
            transfer,
            hdr,
            snorm,
        })
    }
}

/// Conversion of the network output tensor back into an image.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputProcessDesc {
    pub src: TensorDesc,
    pub transfer: TransferFunction,
    pub hdr: bool,
    pub snorm: bool,
}

impl OutputProcessDesc {
    pub fn new(src: TensorDesc, transfer: TransferFunction, hdr: bool, snorm: bool) -> Result<Self> {
        check_spatial("output processing", &src)?;
        if src.n() != 1 || src.c() < 3 {
            return Err(Error::invalid_argument(format!(
                "output processing reads 3 channels of a single image, got {src}"
            )));
        }
        Ok(OutputProcessDesc {
            src,
            transfer,
            hdr,
            snorm,
        })
    }
}

/// Autoexposure only needs the source image geometry.
pub type AutoexposureDesc = ImageDesc;
