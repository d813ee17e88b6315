// Transfer functions — mapping image values into the network's input range
//
// The network is trained on values encoded by a transfer function:
//
//   Linear — identity (LDR inputs already in [0, 1])
//   Srgb   — the sRGB curve, for LDR inputs given in linear space
//   Pu     — perceptually uniform encoding for HDR, normalised so that the
//            half float maximum maps to 1
//   Log    — log(1 + y), normalised the same way
//
// input_scale multiplies the color before encoding (e.g. the autoexposure
// result) and divides the decoded output.

/// Largest finite half-precision value; HDR colors are clamped to it.
pub const HDR_MAX: f32 = 65504.0;

/// Encoding applied to color before it enters the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Linear,
    Srgb,
    Pu,
    Log,
}

const PU_A: f32 = 1.412_837_6e3;
const PU_B: f32 = 1.645_931_7;
const PU_C: f32 = 4.313_849_8e-1;
const PU_D: f32 = -2.941_396_1e-3;
const PU_E: f32 = 1.926_532_5e-1;
const PU_F: f32 = 6.260_261e-3;
const PU_G: f32 = 9.986_201_5e-1;
const PU_Y0: f32 = 1.579_457_6e-6;
const PU_Y1: f32 = 3.220_876_3e-2;
const PU_X0: f32 = 2.231_517e-3;
const PU_X1: f32 = 3.709_747_5e-1;

fn pu_forward(y: f32) -> f32 {
    if y <= PU_Y0 {
        PU_A * y
    } else if y <= PU_Y1 {
        PU_B * y.powf(PU_C) + PU_D
    } else {
        PU_E * (y + PU_F).ln() + PU_G
    }
}

fn pu_inverse(x: f32) -> f32 {
    if x <= PU_X0 {
        x / PU_A
    } else if x <= PU_X1 {
        ((x - PU_D) / PU_B).powf(1.0 / PU_C)
    } else {
        ((x - PU_G) / PU_E).exp() - PU_F
    }
}

fn srgb_forward(y: f32) -> f32 {
    if y <= 0.003_130_8 {
        12.92 * y
    } else {
        1.055 * y.powf(1.0 / 2.4) - 0.055
    }
}

fn srgb_inverse(x: f32) -> f32 {
    if x <= 0.040_45 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// A transfer function together with its input scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferFunction {
    kind: TransferKind,
    input_scale: f32,
    norm_scale: f32,
}

impl TransferFunction {
    pub fn new(kind: TransferKind) -> Self {
        let norm_scale = match kind {
            TransferKind::Pu => 1.0 / pu_forward(HDR_MAX),
            TransferKind::Log => 1.0 / (HDR_MAX + 1.0).ln(),
            _ => 1.0,
        };
        TransferFunction {
            kind,
            input_scale: 1.0,
            norm_scale,
        }
    }

    pub fn with_input_scale(mut self, scale: f32) -> Self {
        self.input_scale = scale;
        self
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn input_scale(&self) -> f32 {
        self.input_scale
    }

    pub fn set_input_scale(&mut self, scale: f32) {
        self.input_scale = scale;
    }

    /// Normalisation factor applied after the forward curve.
    pub fn norm_scale(&self) -> f32 {
        self.norm_scale
    }

    /// Encode a (scaled, clamped) linear value.
    #[inline]
    pub fn forward(&self, y: f32) -> f32 {
        match self.kind {
            TransferKind::Linear => y,
            TransferKind::Srgb => srgb_forward(y),
            TransferKind::Pu => pu_forward(y) * self.norm_scale,
            TransferKind::Log => (y + 1.0).ln() * self.norm_scale,
        }
    }

    /// Decode a network output value back to linear.
    #[inline]
    pub fn inverse(&self, x: f32) -> f32 {
        match self.kind {
            TransferKind::Linear => x,
            TransferKind::Srgb => srgb_inverse(x),
            TransferKind::Pu => pu_inverse(x / self.norm_scale),
            TransferKind::Log => (x / self.norm_scale).exp() - 1.0,
        }
    }
}

/// Region mapping between an image and a (possibly larger) tensor.
///
/// Pixels `[h_src, h_src + h) x [w_src, w_src + w)` of the image correspond to
/// `[h_dst, h_dst + h) x [w_dst, w_dst + w)` of the tensor (and vice versa for
/// output processing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tile {
    pub h_src: usize,
    pub w_src: usize,
    pub h_dst: usize,
    pub w_dst: usize,
    pub h: usize,
    pub w: usize,
}

impl Tile {
    /// The whole `h x w` image mapped onto the tensor origin.
    pub fn full(h: usize, w: usize) -> Self {
        Tile {
            h,
            w,
            ..Default::default()
        }
    }
}
