// CUDA Kernel Source Code — Compiled to PTX at runtime via NVRTC
//
// The element kernels that cuDNN does not provide: upsampling, the image
// conversion operators, image copy and the autoexposure bin reduction. They
// are compiled once when a CudaDevice is created and cached in the engine.
//
// DESIGN DECISIONS:
// - Tensors are planar NCHW (the only layout the CUDA device accepts), so a
//   tensor element is addressed as ((c * H) + h) * W + w
// - Images are addressed through byte strides; channels are f32 or f16
// - F16 kernels promote to f32 for computation, then demote back
// - Launch geometry: the last WorkDim dimension maps to x, then y, then z
// - Argument structs are passed by value and mirrored by #[repr(C)] types
//   below; the two definitions must stay in sync

use denoise_core::{DataType, ImageDesc, Tile, TransferFunction, TransferKind};

/// Name under which the compiled module is registered.
pub const MODULE_NAME: &str = "denoise_kernels";

/// Every kernel entry point in [`KERNEL_SOURCE`].
pub const KERNEL_NAMES: &[&str] = &[
    "upsample_f32",
    "upsample_f16",
    "input_process_f32",
    "input_process_f16",
    "output_process_f32",
    "output_process_f16",
    "image_copy",
    "autoexposure_bins",
];

/// All kernel source code in one compilation unit.
pub const KERNEL_SOURCE: &str = r#"

//  F16 CONVERSION HELPERS
//
// F16 <-> F32 uses inline PTX (cvt.f32.f16 / cvt.rn.f16.f32). F16 data is
// stored as unsigned short on device.

__device__ __forceinline__ float f16_to_f32(unsigned short h) {
    float f;
    asm("{ cvt.f32.f16 %0, %1; }" : "=f"(f) : "h"(h));
    return f;
}

__device__ __forceinline__ unsigned short f32_to_f16(float f) {
    unsigned short h;
    asm("{ cvt.rn.f16.f32 %0, %1; }" : "=h"(h) : "f"(f));
    return h;
}

__device__ __forceinline__ float ld(const float* p, unsigned long long i) { return p[i]; }
__device__ __forceinline__ float ld(const unsigned short* p, unsigned long long i) { return f16_to_f32(p[i]); }
__device__ __forceinline__ void st(float* p, unsigned long long i, float v) { p[i] = v; }
__device__ __forceinline__ void st(unsigned short* p, unsigned long long i, float v) { p[i] = f32_to_f16(v); }

//  ARGUMENTS

struct ImageArg {
    unsigned long long ptr;
    unsigned long long row_stride;
    unsigned long long pixel_stride;
    unsigned int height;
    unsigned int width;
    unsigned int channels;
    unsigned int half;
};

struct TileArg {
    unsigned int h_src;
    unsigned int w_src;
    unsigned int h_dst;
    unsigned int w_dst;
    unsigned int h;
    unsigned int w;
};

struct TransferArg {
    unsigned int kind;
    float input_scale;
    float norm_scale;
    unsigned int hdr;
    unsigned int snorm;
};

__device__ __forceinline__ float load_image(const ImageArg& img, unsigned int h, unsigned int w, unsigned int c) {
    const char* p = (const char*)img.ptr + h * img.row_stride + w * img.pixel_stride;
    if (img.half) return f16_to_f32(((const unsigned short*)p)[c]);
    return ((const float*)p)[c];
}

__device__ __forceinline__ void store_image(const ImageArg& img, unsigned int h, unsigned int w, unsigned int c, float v) {
    char* p = (char*)img.ptr + h * img.row_stride + w * img.pixel_stride;
    if (img.half) ((unsigned short*)p)[c] = f32_to_f16(v);
    else ((float*)p)[c] = v;
}

__device__ __forceinline__ unsigned long long tensor_index(unsigned int c, unsigned int h, unsigned int w, unsigned int H, unsigned int W) {
    return ((unsigned long long)c * H + h) * W + w;
}

//  TRANSFER FUNCTIONS

#define HDR_MAX 65504.0f

#define PU_A  1.4128376e3f
#define PU_B  1.6459317f
#define PU_C  4.3138498e-1f
#define PU_D  -2.9413961e-3f
#define PU_E  1.9265325e-1f
#define PU_F  6.260261e-3f
#define PU_G  9.9862015e-1f
#define PU_Y0 1.5794576e-6f
#define PU_Y1 3.2208763e-2f
#define PU_X0 2.231517e-3f
#define PU_X1 3.7097475e-1f

__device__ float pu_forward(float y) {
    if (y <= PU_Y0) return PU_A * y;
    if (y <= PU_Y1) return PU_B * powf(y, PU_C) + PU_D;
    return PU_E * logf(y + PU_F) + PU_G;
}

__device__ float pu_inverse(float x) {
    if (x <= PU_X0) return x / PU_A;
    if (x <= PU_X1) return powf((x - PU_D) / PU_B, 1.0f / PU_C);
    return expf((x - PU_G) / PU_E) - PU_F;
}

__device__ float srgb_forward(float y) {
    return y <= 0.0031308f ? 12.92f * y : 1.055f * powf(y, 1.0f / 2.4f) - 0.055f;
}

__device__ float srgb_inverse(float x) {
    return x <= 0.04045f ? x / 12.92f : powf((x + 0.055f) / 1.055f, 2.4f);
}

// kind: 0 linear, 1 srgb, 2 pu, 3 log
__device__ float tf_forward(const TransferArg& tf, float y) {
    switch (tf.kind) {
    case 1: return srgb_forward(y);
    case 2: return pu_forward(y) * tf.norm_scale;
    case 3: return logf(y + 1.0f) * tf.norm_scale;
    default: return y;
    }
}

__device__ float tf_inverse(const TransferArg& tf, float x) {
    switch (tf.kind) {
    case 1: return srgb_inverse(x);
    case 2: return pu_inverse(x / tf.norm_scale);
    case 3: return expf(x / tf.norm_scale) - 1.0f;
    default: return x;
    }
}

__device__ __forceinline__ float clampf(float v, float lo, float hi) {
    return fminf(fmaxf(v, lo), hi);
}

//  UPSAMPLE (grid over source [N*C, H, W])

template <typename T>
__device__ void upsample(const T* src, T* dst, unsigned int nc, unsigned int H, unsigned int W) {
    unsigned int w = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int h = blockIdx.y * blockDim.y + threadIdx.y;
    unsigned int c = blockIdx.z * blockDim.z + threadIdx.z;
    if (c >= nc || h >= H || w >= W) return;
    T v = src[tensor_index(c, h, w, H, W)];
    unsigned int W2 = W * 2;
    unsigned long long o = tensor_index(c, h * 2, w * 2, H * 2, W2);
    dst[o] = v;
    dst[o + 1] = v;
    dst[o + W2] = v;
    dst[o + W2 + 1] = v;
}

extern "C" __global__ void upsample_f32(const float* src, float* dst, unsigned int nc, unsigned int H, unsigned int W) {
    upsample(src, dst, nc, H, W);
}

extern "C" __global__ void upsample_f16(const unsigned short* src, unsigned short* dst, unsigned int nc, unsigned int H, unsigned int W) {
    upsample(src, dst, nc, H, W);
}

//  INPUT PROCESS (grid over destination [H, W])

__device__ float encode_color(const TransferArg& tf, float v) {
    if (isnan(v)) v = 0.0f;
    v *= tf.input_scale;
    v = tf.hdr ? clampf(v, 0.0f, HDR_MAX) : clampf(v, 0.0f, 1.0f);
    return tf_forward(tf, v);
}

__device__ float encode_albedo(float v) {
    if (isnan(v)) v = 0.0f;
    return clampf(v, 0.0f, 1.0f);
}

__device__ float encode_normal(const TransferArg& tf, float v) {
    if (isnan(v)) v = 0.0f;
    v = clampf(v, -1.0f, 1.0f);
    return tf.snorm ? v : v * 0.5f + 0.5f;
}

__device__ __forceinline__ float load3(const ImageArg& img, unsigned int h, unsigned int w, unsigned int k) {
    return k < img.channels ? load_image(img, h, w, k) : 0.0f;
}

template <typename T>
__device__ void input_process(T* dst, unsigned int C, unsigned int H, unsigned int W,
                              ImageArg color, ImageArg albedo, ImageArg normal,
                              TileArg tile, TransferArg tf) {
    unsigned int w = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int h = blockIdx.y * blockDim.y + threadIdx.y;
    if (h >= H || w >= W) return;

    unsigned int c = 0;
    bool inside = h >= tile.h_dst && h < tile.h_dst + tile.h &&
                  w >= tile.w_dst && w < tile.w_dst + tile.w;
    if (inside) {
        unsigned int hs = h - tile.h_dst + tile.h_src;
        unsigned int ws = w - tile.w_dst + tile.w_src;
        if (color.ptr) {
            for (unsigned int k = 0; k < 3; ++k, ++c)
                st(dst, tensor_index(c, h, w, H, W), encode_color(tf, load3(color, hs, ws, k)));
        }
        if (albedo.ptr) {
            for (unsigned int k = 0; k < 3; ++k, ++c)
                st(dst, tensor_index(c, h, w, H, W), encode_albedo(load3(albedo, hs, ws, k)));
        }
        if (normal.ptr) {
            for (unsigned int k = 0; k < 3; ++k, ++c)
                st(dst, tensor_index(c, h, w, H, W), encode_normal(tf, load3(normal, hs, ws, k)));
        }
    }
    for (; c < C; ++c)
        st(dst, tensor_index(c, h, w, H, W), 0.0f);
}

extern "C" __global__ void input_process_f32(float* dst, unsigned int C, unsigned int H, unsigned int W,
                                             ImageArg color, ImageArg albedo, ImageArg normal,
                                             TileArg tile, TransferArg tf) {
    input_process(dst, C, H, W, color, albedo, normal, tile, tf);
}

extern "C" __global__ void input_process_f16(unsigned short* dst, unsigned int C, unsigned int H, unsigned int W,
                                             ImageArg color, ImageArg albedo, ImageArg normal,
                                             TileArg tile, TransferArg tf) {
    input_process(dst, C, H, W, color, albedo, normal, tile, tf);
}

//  OUTPUT PROCESS (grid over the tile [h, w])

template <typename T>
__device__ void output_process(const T* src, unsigned int H, unsigned int W,
                               ImageArg dst, TileArg tile, TransferArg tf) {
    unsigned int w = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int h = blockIdx.y * blockDim.y + threadIdx.y;
    if (h >= tile.h || w >= tile.w) return;

    unsigned int hs = tile.h_src + h;
    unsigned int ws = tile.w_src + w;
    for (unsigned int k = 0; k < 3; ++k) {
        float v = ld(src, tensor_index(k, hs, ws, H, W));
        v = isnan(v) ? 0.0f : fmaxf(v, 0.0f);
        v = tf_inverse(tf, v) / tf.input_scale;
        if (!tf.hdr) v = fminf(v, 1.0f);
        if (tf.snorm) v = clampf(v * 2.0f - 1.0f, -1.0f, 1.0f);
        if (k < dst.channels) store_image(dst, tile.h_dst + h, tile.w_dst + w, k, v);
    }
}

extern "C" __global__ void output_process_f32(const float* src, unsigned int H, unsigned int W,
                                              ImageArg dst, TileArg tile, TransferArg tf) {
    output_process(src, H, W, dst, tile, tf);
}

extern "C" __global__ void output_process_f16(const unsigned short* src, unsigned int H, unsigned int W,
                                              ImageArg dst, TileArg tile, TransferArg tf) {
    output_process(src, H, W, dst, tile, tf);
}

//  IMAGE COPY (grid over [H, W])

extern "C" __global__ void image_copy(ImageArg src, ImageArg dst) {
    unsigned int w = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int h = blockIdx.y * blockDim.y + threadIdx.y;
    if (h >= dst.height || w >= dst.width) return;
    for (unsigned int c = 0; c < dst.channels; ++c) {
        float v = c < src.channels ? load_image(src, h, w, c) : 0.0f;
        store_image(dst, h, w, c, v);
    }
}

//  AUTOEXPOSURE (grid over bins [nh, nw])
//
// Each work item averages the luminance of one bin; the exposure itself is
// reduced on the host.

extern "C" __global__ void autoexposure_bins(ImageArg src, float* bins, unsigned int nh, unsigned int nw) {
    unsigned int bw = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int bh = blockIdx.y * blockDim.y + threadIdx.y;
    if (bh >= nh || bw >= nw) return;

    unsigned int h0 = (unsigned int)((unsigned long long)bh * src.height / nh);
    unsigned int h1 = (unsigned int)((unsigned long long)(bh + 1) * src.height / nh);
    unsigned int w0 = (unsigned int)((unsigned long long)bw * src.width / nw);
    unsigned int w1 = (unsigned int)((unsigned long long)(bw + 1) * src.width / nw);

    float sum = 0.0f;
    for (unsigned int h = h0; h < h1; ++h) {
        for (unsigned int w = w0; w < w1; ++w) {
            float r = load3(src, h, w, 0);
            float g = load3(src, h, w, 1);
            float b = load3(src, h, w, 2);
            sum += 0.212671f * r + 0.715160f * g + 0.072169f * b;
        }
    }
    bins[bh * nw + bw] = sum / (float)((h1 - h0) * (w1 - w0));
}
"#;

// HOST-SIDE ARGUMENT MIRRORS

/// `ImageArg` in the kernel source. A null `ptr` marks an unbound image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageArg {
    pub ptr: u64,
    pub row_stride: u64,
    pub pixel_stride: u64,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub half: u32,
}

impl ImageArg {
    pub fn new(ptr: *mut u8, desc: &ImageDesc) -> Self {
        ImageArg {
            ptr: ptr as u64,
            row_stride: desc.byte_row_stride as u64,
            pixel_stride: desc.byte_pixel_stride as u64,
            height: desc.height as u32,
            width: desc.width as u32,
            channels: desc.format.num_channels() as u32,
            half: (desc.format.channel_type() == DataType::Float16) as u32,
        }
    }

    /// An unbound image slot.
    pub fn none() -> Self {
        ImageArg::default()
    }
}

/// `TileArg` in the kernel source.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileArg {
    pub h_src: u32,
    pub w_src: u32,
    pub h_dst: u32,
    pub w_dst: u32,
    pub h: u32,
    pub w: u32,
}

impl From<Tile> for TileArg {
    fn from(t: Tile) -> Self {
        TileArg {
            h_src: t.h_src as u32,
            w_src: t.w_src as u32,
            h_dst: t.h_dst as u32,
            w_dst: t.w_dst as u32,
            h: t.h as u32,
            w: t.w as u32,
        }
    }
}

/// `TransferArg` in the kernel source.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferArg {
    pub kind: u32,
    pub input_scale: f32,
    pub norm_scale: f32,
    pub hdr: u32,
    pub snorm: u32,
}

impl TransferArg {
    pub fn new(tf: &TransferFunction, hdr: bool, snorm: bool) -> Self {
        let kind = match tf.kind() {
            TransferKind::Linear => 0,
            TransferKind::Srgb => 1,
            TransferKind::Pu => 2,
            TransferKind::Log => 3,
        };
        TransferArg {
            kind,
            input_scale: tf.input_scale(),
            norm_scale: tf.norm_scale(),
            hdr: hdr as u32,
            snorm: snorm as u32,
        }
    }
}

/// Kernel name for an element type, e.g. `upsample_f16`.
pub fn typed_kernel(base: &str, dtype: DataType) -> String {
    match dtype {
        DataType::Float16 => format!("{base}_f16"),
        _ => format!("{base}_f32"),
    }
}
