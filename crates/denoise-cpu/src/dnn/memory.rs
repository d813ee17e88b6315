use std::sync::atomic::{AtomicPtr, Ordering};

use denoise_core::{DataType, Error, Result, TensorDesc, TensorLayout};

// Native memory descriptors of the CPU primitive layer
//
// A MemoryDesc is what the primitives understand: activations are always
// 4-D (N, C, H, W) in one of the nChw formats, weights are 4-D (O, I, KH, KW),
// and flat byte vectors use format X. Only f32 activations/weights are
// supported; a TensorDesc that cannot be expressed yields an error and the
// tensor that asked for it stays without a native descriptor.

/// Physical format of a native memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    X,
    Nchw,
    NChw8c,
    NChw16c,
    Oihw,
    OIhw8i8o,
    OIhw16i16o,
}

impl Format {
    fn from_layout(layout: TensorLayout) -> Format {
        match layout {
            TensorLayout::X => Format::X,
            TensorLayout::Chw => Format::Nchw,
            TensorLayout::Chw8c => Format::NChw8c,
            TensorLayout::Chw16c => Format::NChw16c,
            TensorLayout::Oihw => Format::Oihw,
            TensorLayout::OIhw8i8o => Format::OIhw8i8o,
            TensorLayout::OIhw16i16o => Format::OIhw16i16o,
        }
    }

    pub fn layout(&self) -> TensorLayout {
        match self {
            Format::X => TensorLayout::X,
            Format::Nchw => TensorLayout::Chw,
            Format::NChw8c => TensorLayout::Chw8c,
            Format::NChw16c => TensorLayout::Chw16c,
            Format::Oihw => TensorLayout::Oihw,
            Format::OIhw8i8o => TensorLayout::OIhw8i8o,
            Format::OIhw16i16o => TensorLayout::OIhw16i16o,
        }
    }
}

/// Native descriptor: normalised dims, format and element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    format: Format,
    dtype: DataType,
}

impl MemoryDesc {
    /// Translate an engine descriptor.
    pub fn new(desc: &TensorDesc) -> Result<Self> {
        let format = Format::from_layout(desc.layout());
        match (format, desc.dtype()) {
            (_, DataType::Float32) | (Format::X, DataType::UInt8) => {}
            (_, dtype) => {
                return Err(Error::invalid_argument(format!(
                    "cpu primitives do not support {dtype} {} tensors",
                    desc.layout()
                )))
            }
        }
        let dims = if desc.layout().is_activation() {
            let [c, h, w] = desc.chw_dims();
            vec![desc.n(), c, h, w]
        } else {
            desc.dims().to_vec()
        };
        Ok(MemoryDesc {
            dims,
            format,
            dtype: desc.dtype(),
        })
    }

    /// A flat byte vector.
    pub fn bytes(byte_size: usize) -> Self {
        MemoryDesc {
            dims: vec![byte_size],
            format: Format::X,
            dtype: DataType::UInt8,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn byte_size(&self) -> usize {
        self.dims.iter().product::<usize>() * self.dtype.byte_size()
    }

    /// `[N, C, H, W]` of an activation.
    pub fn nchw(&self) -> [usize; 4] {
        match self.dims[..] {
            [n, c, h, w] => [n, c, h, w],
            _ => [1, self.dims.iter().product(), 1, 1],
        }
    }

    /// Element offset of an activation element.
    #[inline]
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        let [_, cc, hh, ww] = self.nchw();
        n * cc * hh * ww + self.format.layout().chw_offset([cc, hh, ww], c, h, w)
    }

    /// Element offset of a weight element.
    #[inline]
    pub fn weight_offset(&self, o: usize, i: usize, kh: usize, kw: usize) -> usize {
        let dims = self.nchw();
        self.format.layout().oihw_offset(dims, o, i, kh, kw)
    }

    /// The engine descriptor of a tensor that holds this memory as raw bytes.
    pub fn byte_tensor_desc(&self) -> Result<TensorDesc> {
        TensorDesc::bytes(self.byte_size())
    }
}

/// A native memory object: an optional descriptor plus the data handle.
///
/// The handle is rebound whenever the owning tensor refreshes its pointer.
#[derive(Debug)]
pub struct Memory {
    desc: Option<MemoryDesc>,
    handle: AtomicPtr<u8>,
}

impl Memory {
    pub fn new(desc: Option<MemoryDesc>, handle: *mut u8) -> Self {
        Memory {
            desc,
            handle: AtomicPtr::new(handle),
        }
    }

    pub fn desc(&self) -> Option<&MemoryDesc> {
        self.desc.as_ref()
    }

    pub fn handle(&self) -> *mut u8 {
        self.handle.load(Ordering::Acquire)
    }

    pub fn set_handle(&self, ptr: *mut u8) {
        self.handle.store(ptr, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_is_normalised_to_4d() {
        let td = TensorDesc::chw(16, 4, 5, TensorLayout::Chw8c, DataType::Float32).unwrap();
        let md = MemoryDesc::new(&td).unwrap();
        assert_eq!(md.dims(), &[1, 16, 4, 5]);
        assert_eq!(md.format(), Format::NChw8c);
        assert_eq!(md.byte_size(), td.byte_size());
        assert_eq!(md.offset(0, 9, 2, 3), td.activation_offset(0, 9, 2, 3));
    }

    #[test]
    fn test_half_is_unsupported() {
        let td = TensorDesc::chw(8, 2, 2, TensorLayout::Chw, DataType::Float16).unwrap();
        assert!(MemoryDesc::new(&td).is_err());
        let bytes = TensorDesc::bytes(10).unwrap();
        assert_eq!(MemoryDesc::new(&bytes).unwrap(), MemoryDesc::bytes(10));
    }

    #[test]
    fn test_weight_offsets_match_engine() {
        let td = TensorDesc::new(vec![16, 8, 3, 3], TensorLayout::OIhw8i8o, DataType::Float32)
            .unwrap();
        let md = MemoryDesc::new(&td).unwrap();
        assert_eq!(md.weight_offset(9, 3, 1, 2), td.weight_offset(9, 3, 1, 2));
    }

    #[test]
    fn test_memory_rebinds_handle() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let m = Memory::new(None, a.as_mut_ptr());
        assert!(m.desc().is_none());
        m.set_handle(b.as_mut_ptr());
        assert_eq!(m.handle(), b.as_mut_ptr());
    }
}
