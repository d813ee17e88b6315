use std::fmt;

use crate::dtype::DataType;
use crate::error::{Error, Result};
use crate::layout::TensorLayout;

// TensorDesc — engine-level shape/layout/type of a tensor
//
// A TensorDesc is immutable once built. It is the engine-agnostic half of a
// tensor; each backend mirrors it into its own native descriptor when the
// tensor is bound to memory.
//
// DIMS CONVENTION:
//
//   X                  [N]
//   Chw, Chw8c, Chw16c [C, H, W] or [N, C, H, W]
//   Oihw, OIhw*        [O, I, KH, KW]
//
// The byte size is always num_elements * dtype size. Blocked layouts do not
// pad: the channel counts must already be multiples of the block size.

/// Immutable description of a tensor: dims, layout and element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    dims: Vec<usize>,
    layout: TensorLayout,
    dtype: DataType,
}

impl TensorDesc {
    /// Build a descriptor, validating rank, dims and block alignment.
    pub fn new(dims: Vec<usize>, layout: TensorLayout, dtype: DataType) -> Result<Self> {
        if !layout.accepts_rank(dims.len()) {
            return Err(Error::invalid_argument(format!(
                "layout {layout} does not accept {} dims {:?}",
                dims.len(),
                dims
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::invalid_argument(format!(
                "tensor dims must be non-zero, got {:?}",
                dims
            )));
        }
        let desc = TensorDesc {
            dims,
            layout,
            dtype,
        };
        let b = layout.block_size();
        if layout.is_activation() && desc.c() % b != 0 {
            return Err(Error::invalid_argument(format!(
                "{} channels are not a multiple of the {layout} block size",
                desc.c()
            )));
        }
        if layout.is_weight() && (desc.o() % b != 0 || desc.i() % b != 0) {
            return Err(Error::invalid_argument(format!(
                "weight dims {:?} are not multiples of the {layout} block size",
                desc.dims
            )));
        }
        Ok(desc)
    }

    /// A flat byte vector of the given size (layout X, UInt8).
    pub fn bytes(byte_size: usize) -> Result<Self> {
        TensorDesc::new(vec![byte_size], TensorLayout::X, DataType::UInt8)
    }

    /// Activation descriptor `[C, H, W]`.
    pub fn chw(
        c: usize,
        h: usize,
        w: usize,
        layout: TensorLayout,
        dtype: DataType,
    ) -> Result<Self> {
        TensorDesc::new(vec![c, h, w], layout, dtype)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total size of the tensor data in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype.byte_size()
    }

    // Activation accessors. For rank-3 activations the batch is 1.

    fn chw_base(&self) -> usize {
        if self.dims.len() == 4 {
            1
        } else {
            0
        }
    }

    pub fn n(&self) -> usize {
        if self.layout.is_activation() && self.dims.len() == 4 {
            self.dims[0]
        } else {
            1
        }
    }

    pub fn c(&self) -> usize {
        self.dims[self.chw_base()]
    }

    pub fn h(&self) -> usize {
        self.dims[self.chw_base() + 1]
    }

    pub fn w(&self) -> usize {
        self.dims[self.chw_base() + 2]
    }

    /// `[C, H, W]` of one image.
    pub fn chw_dims(&self) -> [usize; 3] {
        [self.c(), self.h(), self.w()]
    }

    // Weight accessors.

    pub fn o(&self) -> usize {
        self.dims[0]
    }

    pub fn i(&self) -> usize {
        self.dims[1]
    }

    pub fn kh(&self) -> usize {
        self.dims[2]
    }

    pub fn kw(&self) -> usize {
        self.dims[3]
    }

    pub fn oihw_dims(&self) -> [usize; 4] {
        [self.o(), self.i(), self.kh(), self.kw()]
    }

    /// Element offset of an activation element (batch n).
    #[inline]
    pub fn activation_offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        let dims = self.chw_dims();
        n * dims[0] * dims[1] * dims[2] + self.layout.chw_offset(dims, c, h, w)
    }

    /// Element offset of a weight element.
    #[inline]
    pub fn weight_offset(&self, o: usize, i: usize, kh: usize, kw: usize) -> usize {
        self.layout.oihw_offset(self.oihw_dims(), o, i, kh, kw)
    }

    /// Same descriptor with different activation dims (layout/type kept).
    pub fn with_dims(&self, dims: Vec<usize>) -> Result<Self> {
        TensorDesc::new(dims, self.layout, self.dtype)
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{}", self.dims, self.layout, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size() {
        let d = TensorDesc::new(vec![1, 3, 32, 32], TensorLayout::Chw, DataType::Float32).unwrap();
        assert_eq!(d.byte_size(), 3 * 32 * 32 * 4);
        assert_eq!((d.n(), d.c(), d.h(), d.w()), (1, 3, 32, 32));
        let half = TensorDesc::chw(8, 4, 4, TensorLayout::Chw8c, DataType::Float16).unwrap();
        assert_eq!(half.byte_size(), 8 * 16 * 2);
    }

    #[test]
    fn test_rejects_bad_rank() {
        let err = TensorDesc::new(vec![3, 3], TensorLayout::Chw, DataType::Float32).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(TensorDesc::new(vec![3], TensorLayout::Oihw, DataType::Float32).is_err());
    }

    #[test]
    fn test_rejects_zero_dim() {
        assert!(TensorDesc::new(vec![0], TensorLayout::X, DataType::Float32).is_err());
    }

    #[test]
    fn test_rejects_unaligned_block() {
        assert!(TensorDesc::chw(12, 4, 4, TensorLayout::Chw8c, DataType::Float32).is_err());
        assert!(TensorDesc::chw(16, 4, 4, TensorLayout::Chw16c, DataType::Float32).is_ok());
        assert!(TensorDesc::new(
            vec![8, 3, 3, 3],
            TensorLayout::OIhw8i8o,
            DataType::Float32
        )
        .is_err());
    }

    #[test]
    fn test_weight_accessors() {
        let w = TensorDesc::new(vec![16, 8, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
        assert_eq!(w.oihw_dims(), [16, 8, 3, 3]);
        assert_eq!(w.weight_offset(1, 0, 0, 0), 8 * 9);
    }

    #[test]
    fn test_batch_offset() {
        let d = TensorDesc::new(vec![2, 3, 4, 4], TensorLayout::Chw, DataType::Float32).unwrap();
        assert_eq!(d.activation_offset(1, 0, 0, 0), 48);
        assert_eq!(d.activation_offset(0, 2, 3, 3), 47);
    }
}
