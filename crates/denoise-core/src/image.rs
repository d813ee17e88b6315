use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use half::f16;

use crate::buffer::Buffer;
use crate::dtype::DataType;
use crate::error::{Error, Result};
use crate::memory::MemoryBinding;

// Image — interleaved pixel data exchanged with the outside world
//
// Tensors are the engine's internal format; images are what the caller hands
// in (color, albedo, normal) and gets back (the filtered output). The input
// and output processing operators convert between the two, and the
// autoexposure and image copy operators read/write images directly.
//
// An image binds memory exactly like a tensor view: the same region check at
// construction (InvalidArgument) and on update_ptr() (Range).

/// Pixel format of an image: channel count and channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Half,
    Half2,
    Half3,
    Half4,
}

impl ImageFormat {
    pub fn num_channels(&self) -> usize {
        match self {
            ImageFormat::Float | ImageFormat::Half => 1,
            ImageFormat::Float2 | ImageFormat::Half2 => 2,
            ImageFormat::Float3 | ImageFormat::Half3 => 3,
            ImageFormat::Float4 | ImageFormat::Half4 => 4,
        }
    }

    pub fn channel_type(&self) -> DataType {
        match self {
            ImageFormat::Float | ImageFormat::Float2 | ImageFormat::Float3 | ImageFormat::Float4 => {
                DataType::Float32
            }
            _ => DataType::Float16,
        }
    }

    /// Size of one packed pixel in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_channels() * self.channel_type().byte_size()
    }
}

/// Shape and addressing of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub format: ImageFormat,
    pub width: usize,
    pub height: usize,
    pub byte_pixel_stride: usize,
    pub byte_row_stride: usize,
}

impl ImageDesc {
    /// A tightly packed image.
    pub fn new(format: ImageFormat, width: usize, height: usize) -> Self {
        let byte_pixel_stride = format.byte_size();
        ImageDesc {
            format,
            width,
            height,
            byte_pixel_stride,
            byte_row_stride: byte_pixel_stride * width,
        }
    }

    /// An image with explicit strides (0 means packed).
    pub fn with_strides(
        format: ImageFormat,
        width: usize,
        height: usize,
        byte_pixel_stride: usize,
        byte_row_stride: usize,
    ) -> Result<Self> {
        let pixel = if byte_pixel_stride == 0 {
            format.byte_size()
        } else {
            byte_pixel_stride
        };
        if pixel < format.byte_size() {
            return Err(Error::invalid_argument(format!(
                "pixel stride {pixel} is smaller than the {:?} pixel size",
                format
            )));
        }
        let row = if byte_row_stride == 0 {
            pixel * width
        } else {
            byte_row_stride
        };
        if row < pixel * width {
            return Err(Error::invalid_argument(format!(
                "row stride {row} is smaller than {width} pixels of {pixel} bytes"
            )));
        }
        Ok(ImageDesc {
            format,
            width,
            height,
            byte_pixel_stride: pixel,
            byte_row_stride: row,
        })
    }

    /// Bytes spanned from the first to the end of the last pixel.
    pub fn byte_size(&self) -> usize {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        (self.height - 1) * self.byte_row_stride
            + (self.width - 1) * self.byte_pixel_stride
            + self.format.byte_size()
    }

    #[inline]
    pub fn byte_offset(&self, h: usize, w: usize) -> usize {
        h * self.byte_row_stride + w * self.byte_pixel_stride
    }
}

/// An image bound to memory.
pub struct Image {
    desc: ImageDesc,
    binding: MemoryBinding,
    ptr: AtomicPtr<u8>,
}

impl Image {
    /// View an image at `byte_offset` inside `buffer`.
    pub fn from_buffer(buffer: Arc<Buffer>, desc: ImageDesc, byte_offset: usize) -> Result<Self> {
        let binding = MemoryBinding::view(buffer, byte_offset, desc.byte_size())?;
        let ptr = binding.current_ptr();
        Ok(Image {
            desc,
            binding,
            ptr: AtomicPtr::new(ptr),
        })
    }

    /// Wrap caller memory.
    pub fn from_ptr(ptr: *mut u8, desc: ImageDesc) -> Self {
        Image {
            desc,
            binding: MemoryBinding::external(ptr),
            ptr: AtomicPtr::new(ptr),
        }
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn width(&self) -> usize {
        self.desc.width
    }

    pub fn height(&self) -> usize {
        self.desc.height
    }

    pub fn format(&self) -> ImageFormat {
        self.desc.format
    }

    pub fn binding(&self) -> &MemoryBinding {
        &self.binding
    }

    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.binding.buffer()
    }

    /// Currently bound data pointer.
    pub fn data(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    /// Refresh the bound pointer from the backing buffer.
    pub fn update_ptr(&self) -> Result<()> {
        let ptr = self.binding.refresh(self.desc.byte_size())?;
        self.ptr.store(ptr, Ordering::Release);
        Ok(())
    }

    /// Whether two images have the same dimensions.
    pub fn same_size(&self, other: &Image) -> bool {
        self.desc.width == other.desc.width && self.desc.height == other.desc.height
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("desc", &self.desc)
            .field("ptr", &self.data())
            .finish()
    }
}

// Host pixel access
//
// Used by host kernels. Channels beyond the image format read as zero and are
// dropped on store.

/// Load up to three channels of pixel (h, w).
///
/// # Safety
///
/// `ptr` must point to host-accessible memory laid out as `desc` and (h, w)
/// must be inside the image.
#[inline]
pub unsafe fn load_pixel3(ptr: *const u8, desc: &ImageDesc, h: usize, w: usize) -> [f32; 3] {
    let p = ptr.add(desc.byte_offset(h, w));
    let n = desc.format.num_channels().min(3);
    let mut v = [0.0f32; 3];
    match desc.format.channel_type() {
        DataType::Float16 => {
            let p = p as *const f16;
            for (c, x) in v.iter_mut().enumerate().take(n) {
                *x = p.add(c).read_unaligned().to_f32();
            }
        }
        _ => {
            let p = p as *const f32;
            for (c, x) in v.iter_mut().enumerate().take(n) {
                *x = p.add(c).read_unaligned();
            }
        }
    }
    v
}

/// Store up to three channels of pixel (h, w).
///
/// # Safety
///
/// Same as [`load_pixel3`], and the memory must be writable.
#[inline]
pub unsafe fn store_pixel3(ptr: *mut u8, desc: &ImageDesc, h: usize, w: usize, v: [f32; 3]) {
    let p = ptr.add(desc.byte_offset(h, w));
    let n = desc.format.num_channels().min(3);
    match desc.format.channel_type() {
        DataType::Float16 => {
            let p = p as *mut f16;
            for (c, x) in v.iter().enumerate().take(n) {
                p.add(c).write_unaligned(f16::from_f32(*x));
            }
        }
        _ => {
            let p = p as *mut f32;
            for (c, x) in v.iter().enumerate().take(n) {
                p.add(c).write_unaligned(*x);
            }
        }
    }
}

/// Load channel `c` of pixel (h, w).
///
/// # Safety
///
/// Same as [`load_pixel3`], and `c` must be below the channel count.
#[inline]
pub unsafe fn load_channel(ptr: *const u8, desc: &ImageDesc, h: usize, w: usize, c: usize) -> f32 {
    let p = ptr.add(desc.byte_offset(h, w));
    match desc.format.channel_type() {
        DataType::Float16 => (p as *const f16).add(c).read_unaligned().to_f32(),
        _ => (p as *const f32).add(c).read_unaligned(),
    }
}

/// Store channel `c` of pixel (h, w).
///
/// # Safety
///
/// Same as [`load_channel`], and the memory must be writable.
#[inline]
pub unsafe fn store_channel(ptr: *mut u8, desc: &ImageDesc, h: usize, w: usize, c: usize, v: f32) {
    let p = ptr.add(desc.byte_offset(h, w));
    match desc.format.channel_type() {
        DataType::Float16 => (p as *mut f16).add(c).write_unaligned(f16::from_f32(v)),
        _ => (p as *mut f32).add(c).write_unaligned(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::TestAllocator;
    use crate::storage::Storage;

    #[test]
    fn test_packed_byte_size() {
        let d = ImageDesc::new(ImageFormat::Float3, 4, 2);
        assert_eq!(d.byte_pixel_stride, 12);
        assert_eq!(d.byte_row_stride, 48);
        assert_eq!(d.byte_size(), 96);
        assert_eq!(ImageDesc::new(ImageFormat::Half4, 0, 3).byte_size(), 0);
    }

    #[test]
    fn test_strided_byte_size_excludes_trailing_padding() {
        let d = ImageDesc::with_strides(ImageFormat::Float3, 2, 2, 16, 64).unwrap();
        assert_eq!(d.byte_size(), 64 + 16 + 12);
        assert!(ImageDesc::with_strides(ImageFormat::Float3, 2, 2, 8, 0).is_err());
        assert!(ImageDesc::with_strides(ImageFormat::Float3, 4, 2, 0, 40).is_err());
    }

    #[test]
    fn test_image_view_bounds() {
        let buf = Arc::new(
            Buffer::new(Arc::new(TestAllocator::default()), 100, Storage::Host).unwrap(),
        );
        let d = ImageDesc::new(ImageFormat::Float3, 4, 2);
        assert!(Image::from_buffer(buf.clone(), d, 4).is_ok());
        assert!(matches!(
            Image::from_buffer(buf.clone(), d, 8),
            Err(Error::InvalidArgument(_))
        ));
        let img = Image::from_buffer(buf.clone(), d, 0).unwrap();
        buf.realloc(50).unwrap();
        assert!(matches!(img.update_ptr(), Err(Error::Range(_))));
    }

    #[test]
    fn test_pixel_round_trip_half() {
        let d = ImageDesc::new(ImageFormat::Half3, 2, 1);
        let mut mem = vec![0u8; d.byte_size()];
        unsafe {
            store_pixel3(mem.as_mut_ptr(), &d, 0, 1, [0.5, 1.0, 2.0]);
            assert_eq!(load_pixel3(mem.as_ptr(), &d, 0, 1), [0.5, 1.0, 2.0]);
            assert_eq!(load_pixel3(mem.as_ptr(), &d, 0, 0), [0.0; 3]);
        }
    }

    #[test]
    fn test_single_channel_reads_zero_for_missing() {
        let d = ImageDesc::new(ImageFormat::Float, 1, 1);
        let mut mem = 3.0f32.to_ne_bytes().to_vec();
        unsafe {
            assert_eq!(load_pixel3(mem.as_ptr(), &d, 0, 0), [3.0, 0.0, 0.0]);
            store_pixel3(mem.as_mut_ptr(), &d, 0, 0, [7.0, 8.0, 9.0]);
        }
        assert_eq!(f32::from_ne_bytes([mem[0], mem[1], mem[2], mem[3]]), 7.0);
    }
}
