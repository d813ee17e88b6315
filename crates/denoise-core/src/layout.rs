use std::fmt;

// TensorLayout — how a tensor's logical dims map to flat memory
//
// Activations are channel-planar (chw) or channel-blocked (Chw8c, Chw16c).
// A blocked layout groups B consecutive channels so that one pixel of one
// block is B contiguous values:
//
//   Chw8c offset(c, h, w) = ((c / 8) * H + h) * W * 8 + w * 8 + c % 8
//
// Weights follow the same idea for (output, input) channel pairs:
//
//   OIhw8i8o offset(o, i, kh, kw) =
//       ((((o / 8) * (I / 8) + i / 8) * KH + kh) * KW + kw) * 64 + (i % 8) * 8 + o % 8
//
// Activation tensors may carry a leading batch dim (NCHW); the batch stride
// is always C * H * W. Blocked layouts require the blocked channel counts to
// be multiples of the block size.

/// Memory layout tag of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorLayout {
    /// Flat 1-D vector (bias, scratch bytes).
    X,
    Chw,
    Chw8c,
    Chw16c,
    Oihw,
    OIhw8i8o,
    OIhw16i16o,
}

impl TensorLayout {
    /// Channel block size (1 for planar layouts).
    pub fn block_size(&self) -> usize {
        match self {
            TensorLayout::X | TensorLayout::Chw | TensorLayout::Oihw => 1,
            TensorLayout::Chw8c | TensorLayout::OIhw8i8o => 8,
            TensorLayout::Chw16c | TensorLayout::OIhw16i16o => 16,
        }
    }

    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            TensorLayout::Chw | TensorLayout::Chw8c | TensorLayout::Chw16c
        )
    }

    pub fn is_weight(&self) -> bool {
        matches!(
            self,
            TensorLayout::Oihw | TensorLayout::OIhw8i8o | TensorLayout::OIhw16i16o
        )
    }

    /// Whether a tensor of the given rank can use this layout.
    pub fn accepts_rank(&self, rank: usize) -> bool {
        match self {
            TensorLayout::X => rank == 1,
            TensorLayout::Chw | TensorLayout::Chw8c | TensorLayout::Chw16c => {
                rank == 3 || rank == 4
            }
            TensorLayout::Oihw | TensorLayout::OIhw8i8o | TensorLayout::OIhw16i16o => rank == 4,
        }
    }

    /// The weight layout whose blocking matches this activation layout.
    pub fn matching_weight_layout(&self) -> Option<TensorLayout> {
        match self {
            TensorLayout::Chw => Some(TensorLayout::Oihw),
            TensorLayout::Chw8c => Some(TensorLayout::OIhw8i8o),
            TensorLayout::Chw16c => Some(TensorLayout::OIhw16i16o),
            _ => None,
        }
    }

    /// Element offset of (c, h, w) inside one image of a `[C, H, W]` activation.
    #[inline]
    pub fn chw_offset(&self, dims: [usize; 3], c: usize, h: usize, w: usize) -> usize {
        let [_, hh, ww] = dims;
        match self {
            TensorLayout::Chw8c | TensorLayout::Chw16c => {
                let b = self.block_size();
                ((c / b) * hh + h) * ww * b + w * b + c % b
            }
            _ => (c * hh + h) * ww + w,
        }
    }

    /// Element offset of (o, i, kh, kw) inside an `[O, I, KH, KW]` weight.
    #[inline]
    pub fn oihw_offset(
        &self,
        dims: [usize; 4],
        o: usize,
        i: usize,
        kh: usize,
        kw: usize,
    ) -> usize {
        let [_, ii, khh, kww] = dims;
        match self {
            TensorLayout::OIhw8i8o | TensorLayout::OIhw16i16o => {
                let b = self.block_size();
                ((((o / b) * (ii / b) + i / b) * khh + kh) * kww + kw) * b * b + (i % b) * b + o % b
            }
            _ => ((o * ii + i) * khh + kh) * kww + kw,
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TensorLayout::X => "x",
            TensorLayout::Chw => "chw",
            TensorLayout::Chw8c => "Chw8c",
            TensorLayout::Chw16c => "Chw16c",
            TensorLayout::Oihw => "oihw",
            TensorLayout::OIhw8i8o => "OIhw8i8o",
            TensorLayout::OIhw16i16o => "OIhw16i16o",
        };
        write!(f, "{}", s)
    }
}
