// cuDNN — convolution, bias, activation and pooling primitives
//
// Loaded at runtime like the driver. The backend only uses the legacy 4-D
// descriptor API with NCHW tensors, which every cuDNN from 8 onwards offers.
//
// OWNERSHIP:
//
//   Cudnn        the loaded library, shared as Arc<Cudnn>
//   Handle       one cudnnHandle_t bound to the device stream
//   Descriptor   any descriptor object; destroyed on drop
//
// cuDNN handles are not thread safe, so the engine keeps its Handle behind a
// mutex. Descriptors are immutable once set and may be shared freely.

use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, OnceLock};

use libloading::Library;

use denoise_core::{DataType, Error, Result, TensorDesc, TensorLayout};

use crate::driver::{load_library, load_symbol};

pub type CudnnStatus = i32;
type Raw = *mut c_void;

pub const CUDNN_STATUS_SUCCESS: CudnnStatus = 0;

pub const CUDNN_DATA_FLOAT: i32 = 0;
pub const CUDNN_DATA_HALF: i32 = 2;
pub const CUDNN_TENSOR_NCHW: i32 = 0;
pub const CUDNN_CROSS_CORRELATION: i32 = 1;
pub const CUDNN_ACTIVATION_RELU: i32 = 1;
pub const CUDNN_POOLING_MAX: i32 = 0;
pub const CUDNN_NOT_PROPAGATE_NAN: i32 = 0;
pub const CUDNN_DEFAULT_MATH: i32 = 0;
pub const CUDNN_TENSOR_OP_MATH_ALLOW_CONVERSION: i32 = 2;

/// Forward convolution algorithms known to cuDNN 8/9.
pub const CONV_FWD_ALGO_IMPLICIT_GEMM: i32 = 0;
pub const CONV_FWD_ALGO_IMPLICIT_PRECOMP_GEMM: i32 = 1;
pub const CONV_FWD_ALGO_COUNT: i32 = 8;

/// `cudnnConvolutionFwdAlgoPerf_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvFwdAlgoPerf {
    pub algo: i32,
    pub status: CudnnStatus,
    pub time: f32,
    pub memory: usize,
    pub determinism: i32,
    pub math_type: i32,
    pub reserved: [i32; 3],
}

type CreateFn = unsafe extern "C" fn(out: *mut Raw) -> CudnnStatus;
type DestroyFn = unsafe extern "C" fn(raw: Raw) -> CudnnStatus;
type SetStreamFn = unsafe extern "C" fn(handle: Raw, stream: Raw) -> CudnnStatus;
type GetErrorStringFn = unsafe extern "C" fn(status: CudnnStatus) -> *const c_char;
type GetVersionFn = unsafe extern "C" fn() -> usize;
type SetTensor4dFn = unsafe extern "C" fn(
    desc: Raw,
    format: i32,
    dtype: i32,
    n: i32,
    c: i32,
    h: i32,
    w: i32,
) -> CudnnStatus;
type SetFilter4dFn = unsafe extern "C" fn(
    desc: Raw,
    dtype: i32,
    format: i32,
    k: i32,
    c: i32,
    h: i32,
    w: i32,
) -> CudnnStatus;
type SetConvolution2dFn = unsafe extern "C" fn(
    desc: Raw,
    pad_h: i32,
    pad_w: i32,
    u: i32,
    v: i32,
    dilation_h: i32,
    dilation_w: i32,
    mode: i32,
    compute_type: i32,
) -> CudnnStatus;
type SetConvolutionMathTypeFn = unsafe extern "C" fn(desc: Raw, math_type: i32) -> CudnnStatus;
type SetActivationFn =
    unsafe extern "C" fn(desc: Raw, mode: i32, nan_opt: i32, coef: f64) -> CudnnStatus;
type SetPooling2dFn = unsafe extern "C" fn(
    desc: Raw,
    mode: i32,
    nan_opt: i32,
    window_h: i32,
    window_w: i32,
    pad_h: i32,
    pad_w: i32,
    stride_h: i32,
    stride_w: i32,
) -> CudnnStatus;
type GetConvFwdWorkspaceSizeFn = unsafe extern "C" fn(
    handle: Raw,
    x_desc: Raw,
    w_desc: Raw,
    conv_desc: Raw,
    y_desc: Raw,
    algo: i32,
    size: *mut usize,
) -> CudnnStatus;
type GetConvFwdAlgoMaxCountFn = unsafe extern "C" fn(handle: Raw, count: *mut i32) -> CudnnStatus;
type FindConvFwdAlgoExFn = unsafe extern "C" fn(
    handle: Raw,
    x_desc: Raw,
    x: *const c_void,
    w_desc: Raw,
    w: *const c_void,
    conv_desc: Raw,
    y_desc: Raw,
    y: *mut c_void,
    requested: i32,
    returned: *mut i32,
    results: *mut ConvFwdAlgoPerf,
    workspace: *mut c_void,
    workspace_size: usize,
) -> CudnnStatus;
type ConvolutionForwardFn = unsafe extern "C" fn(
    handle: Raw,
    alpha: *const c_void,
    x_desc: Raw,
    x: *const c_void,
    w_desc: Raw,
    w: *const c_void,
    conv_desc: Raw,
    algo: i32,
    workspace: *mut c_void,
    workspace_size: usize,
    beta: *const c_void,
    y_desc: Raw,
    y: *mut c_void,
) -> CudnnStatus;
type AddTensorFn = unsafe extern "C" fn(
    handle: Raw,
    alpha: *const c_void,
    a_desc: Raw,
    a: *const c_void,
    beta: *const c_void,
    c_desc: Raw,
    c: *mut c_void,
) -> CudnnStatus;
type UnaryForwardFn = unsafe extern "C" fn(
    handle: Raw,
    op_desc: Raw,
    alpha: *const c_void,
    x_desc: Raw,
    x: *const c_void,
    beta: *const c_void,
    y_desc: Raw,
    y: *mut c_void,
) -> CudnnStatus;

struct CudnnFns {
    create: CreateFn,
    destroy: DestroyFn,
    set_stream: SetStreamFn,
    get_error_string: GetErrorStringFn,
    get_version: GetVersionFn,
    create_tensor: CreateFn,
    set_tensor_4d: SetTensor4dFn,
    destroy_tensor: DestroyFn,
    create_filter: CreateFn,
    set_filter_4d: SetFilter4dFn,
    destroy_filter: DestroyFn,
    create_convolution: CreateFn,
    set_convolution_2d: SetConvolution2dFn,
    set_convolution_math_type: SetConvolutionMathTypeFn,
    destroy_convolution: DestroyFn,
    create_activation: CreateFn,
    set_activation: SetActivationFn,
    destroy_activation: DestroyFn,
    create_pooling: CreateFn,
    set_pooling_2d: SetPooling2dFn,
    destroy_pooling: DestroyFn,
    get_conv_fwd_workspace_size: GetConvFwdWorkspaceSizeFn,
    get_conv_fwd_algo_max_count: GetConvFwdAlgoMaxCountFn,
    find_conv_fwd_algo_ex: FindConvFwdAlgoExFn,
    convolution_forward: ConvolutionForwardFn,
    add_tensor: AddTensorFn,
    activation_forward: UnaryForwardFn,
    pooling_forward: UnaryForwardFn,
}

/// The loaded cuDNN library.
pub struct Cudnn {
    _lib: Library,
    fns: CudnnFns,
}

static CUDNN: OnceLock<std::result::Result<Arc<Cudnn>, String>> = OnceLock::new();

/// The process-wide cuDNN library, loaded on first use.
pub fn cudnn() -> Result<Arc<Cudnn>> {
    let init = CUDNN.get_or_init(|| match Cudnn::load() {
        Ok(lib) => Ok(Arc::new(lib)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(lib) => Ok(Arc::clone(lib)),
        Err(msg) => Err(Error::UnsupportedHardware(format!("cuDNN unavailable: {msg}"))),
    }
}

impl Cudnn {
    fn load() -> Result<Self> {
        let lib = load_library(
            "cuDNN",
            &["libcudnn.so.9", "libcudnn.so.8", "libcudnn.so", "cudnn64_9.dll", "cudnn64_8.dll"],
        )?;
        let fns = CudnnFns {
            create: load_symbol(&lib, b"cudnnCreate\0")?,
            destroy: load_symbol(&lib, b"cudnnDestroy\0")?,
            set_stream: load_symbol(&lib, b"cudnnSetStream\0")?,
            get_error_string: load_symbol(&lib, b"cudnnGetErrorString\0")?,
            get_version: load_symbol(&lib, b"cudnnGetVersion\0")?,
            create_tensor: load_symbol(&lib, b"cudnnCreateTensorDescriptor\0")?,
            set_tensor_4d: load_symbol(&lib, b"cudnnSetTensor4dDescriptor\0")?,
            destroy_tensor: load_symbol(&lib, b"cudnnDestroyTensorDescriptor\0")?,
            create_filter: load_symbol(&lib, b"cudnnCreateFilterDescriptor\0")?,
            set_filter_4d: load_symbol(&lib, b"cudnnSetFilter4dDescriptor\0")?,
            destroy_filter: load_symbol(&lib, b"cudnnDestroyFilterDescriptor\0")?,
            create_convolution: load_symbol(&lib, b"cudnnCreateConvolutionDescriptor\0")?,
            set_convolution_2d: load_symbol(&lib, b"cudnnSetConvolution2dDescriptor\0")?,
            set_convolution_math_type: load_symbol(&lib, b"cudnnSetConvolutionMathType\0")?,
            destroy_convolution: load_symbol(&lib, b"cudnnDestroyConvolutionDescriptor\0")?,
            create_activation: load_symbol(&lib, b"cudnnCreateActivationDescriptor\0")?,
            set_activation: load_symbol(&lib, b"cudnnSetActivationDescriptor\0")?,
            destroy_activation: load_symbol(&lib, b"cudnnDestroyActivationDescriptor\0")?,
            create_pooling: load_symbol(&lib, b"cudnnCreatePoolingDescriptor\0")?,
            set_pooling_2d: load_symbol(&lib, b"cudnnSetPooling2dDescriptor\0")?,
            destroy_pooling: load_symbol(&lib, b"cudnnDestroyPoolingDescriptor\0")?,
            get_conv_fwd_workspace_size: load_symbol(
                &lib,
                b"cudnnGetConvolutionForwardWorkspaceSize\0",
            )?,
            get_conv_fwd_algo_max_count: load_symbol(
                &lib,
                b"cudnnGetConvolutionForwardAlgorithmMaxCount\0",
            )?,
            find_conv_fwd_algo_ex: load_symbol(&lib, b"cudnnFindConvolutionForwardAlgorithmEx\0")?,
            convolution_forward: load_symbol(&lib, b"cudnnConvolutionForward\0")?,
            add_tensor: load_symbol(&lib, b"cudnnAddTensor\0")?,
            activation_forward: load_symbol(&lib, b"cudnnActivationForward\0")?,
            pooling_forward: load_symbol(&lib, b"cudnnPoolingForward\0")?,
        };
        Ok(Cudnn { _lib: lib, fns })
    }

    pub fn version(&self) -> usize {
        // SAFETY: no arguments.
        unsafe { (self.fns.get_version)() }
    }

    /// Turn a cuDNN status into a Result.
    pub fn check(&self, status: CudnnStatus, call: &'static str) -> Result<()> {
        if status == CUDNN_STATUS_SUCCESS {
            return Ok(());
        }
        // SAFETY: returns a pointer to a static string.
        let p = unsafe { (self.fns.get_error_string)(status) };
        let message = if p.is_null() {
            "unknown error".to_string()
        } else {
            // SAFETY: non-null static NUL-terminated string.
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        };
        Err(Error::backend("cudnn", call, status as i64, message))
    }

    fn create(
        self: &Arc<Self>,
        kind: DescriptorKind,
        create: CreateFn,
        destroy: DestroyFn,
    ) -> Result<Descriptor> {
        let mut raw: Raw = std::ptr::null_mut();
        // SAFETY: valid out pointer.
        self.check(unsafe { create(&mut raw) }, kind.create_call())?;
        Ok(Descriptor {
            lib: self.clone(),
            raw: raw as usize,
            kind,
            destroy,
        })
    }

    /// A handle whose work is ordered on `stream`.
    pub fn new_handle(self: &Arc<Self>, stream: usize) -> Result<Handle> {
        let mut raw: Raw = std::ptr::null_mut();
        // SAFETY: valid out pointer; a context is current on this thread.
        self.check(unsafe { (self.fns.create)(&mut raw) }, "cudnnCreate")?;
        let handle = Handle {
            lib: self.clone(),
            raw: raw as usize,
        };
        // SAFETY: both handles are live.
        self.check(
            unsafe { (self.fns.set_stream)(raw, stream as Raw) },
            "cudnnSetStream",
        )?;
        Ok(handle)
    }

    /// An NCHW tensor descriptor of `dims` (a missing batch dim reads as 1).
    pub fn tensor_4d(self: &Arc<Self>, dims: [usize; 4], dtype: DataType) -> Result<Descriptor> {
        let desc = self.create(
            DescriptorKind::Tensor,
            self.fns.create_tensor,
            self.fns.destroy_tensor,
        )?;
        let [n, c, h, w] = to_i32(dims)?;
        // SAFETY: desc is a live tensor descriptor.
        self.check(
            unsafe {
                (self.fns.set_tensor_4d)(desc.raw(), CUDNN_TENSOR_NCHW, data_type(dtype)?, n, c, h, w)
            },
            "cudnnSetTensor4dDescriptor",
        )?;
        Ok(desc)
    }

    pub fn filter_4d(self: &Arc<Self>, dims: [usize; 4], dtype: DataType) -> Result<Descriptor> {
        let desc = self.create(
            DescriptorKind::Filter,
            self.fns.create_filter,
            self.fns.destroy_filter,
        )?;
        let [o, i, kh, kw] = to_i32(dims)?;
        // SAFETY: desc is a live filter descriptor.
        self.check(
            unsafe {
                (self.fns.set_filter_4d)(desc.raw(), data_type(dtype)?, CUDNN_TENSOR_NCHW, o, i, kh, kw)
            },
            "cudnnSetFilter4dDescriptor",
        )?;
        Ok(desc)
    }

    /// Unit-stride cross-correlation with the given padding, computed in f32.
    pub fn convolution_2d(self: &Arc<Self>, padding: [usize; 2], allow_tensor_ops: bool) -> Result<Descriptor> {
        let desc = self.create(
            DescriptorKind::Convolution,
            self.fns.create_convolution,
            self.fns.destroy_convolution,
        )?;
        let [ph, pw] = [padding[0] as i32, padding[1] as i32];
        // SAFETY: desc is a live convolution descriptor.
        self.check(
            unsafe {
                (self.fns.set_convolution_2d)(
                    desc.raw(),
                    ph,
                    pw,
                    1,
                    1,
                    1,
                    1,
                    CUDNN_CROSS_CORRELATION,
                    CUDNN_DATA_FLOAT,
                )
            },
            "cudnnSetConvolution2dDescriptor",
        )?;
        let math = if allow_tensor_ops {
            CUDNN_TENSOR_OP_MATH_ALLOW_CONVERSION
        } else {
            CUDNN_DEFAULT_MATH
        };
        // SAFETY: as above.
        self.check(
            unsafe { (self.fns.set_convolution_math_type)(desc.raw(), math) },
            "cudnnSetConvolutionMathType",
        )?;
        Ok(desc)
    }

    pub fn relu(self: &Arc<Self>) -> Result<Descriptor> {
        let desc = self.create(
            DescriptorKind::Activation,
            self.fns.create_activation,
            self.fns.destroy_activation,
        )?;
        // SAFETY: desc is a live activation descriptor.
        self.check(
            unsafe {
                (self.fns.set_activation)(desc.raw(), CUDNN_ACTIVATION_RELU, CUDNN_NOT_PROPAGATE_NAN, 0.0)
            },
            "cudnnSetActivationDescriptor",
        )?;
        Ok(desc)
    }

    /// 2x2 max pooling with stride 2.
    pub fn max_pool_2x2(self: &Arc<Self>) -> Result<Descriptor> {
        let desc = self.create(
            DescriptorKind::Pooling,
            self.fns.create_pooling,
            self.fns.destroy_pooling,
        )?;
        // SAFETY: desc is a live pooling descriptor.
        self.check(
            unsafe {
                (self.fns.set_pooling_2d)(
                    desc.raw(),
                    CUDNN_POOLING_MAX,
                    CUDNN_NOT_PROPAGATE_NAN,
                    2,
                    2,
                    0,
                    0,
                    2,
                    2,
                )
            },
            "cudnnSetPooling2dDescriptor",
        )?;
        Ok(desc)
    }
}

/// Which kind of cuDNN object a [`Descriptor`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Tensor,
    Filter,
    Convolution,
    Activation,
    Pooling,
}

impl DescriptorKind {
    fn create_call(self) -> &'static str {
        match self {
            DescriptorKind::Tensor => "cudnnCreateTensorDescriptor",
            DescriptorKind::Filter => "cudnnCreateFilterDescriptor",
            DescriptorKind::Convolution => "cudnnCreateConvolutionDescriptor",
            DescriptorKind::Activation => "cudnnCreateActivationDescriptor",
            DescriptorKind::Pooling => "cudnnCreatePoolingDescriptor",
        }
    }
}

/// An owned cuDNN descriptor.
pub struct Descriptor {
    lib: Arc<Cudnn>,
    raw: usize,
    kind: DescriptorKind,
    destroy: DestroyFn,
}

impl Descriptor {
    fn raw(&self) -> Raw {
        self.raw as Raw
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        // SAFETY: raw was created by the matching create function.
        let status = unsafe { (self.destroy)(self.raw()) };
        if let Err(err) = self.lib.check(status, "cudnnDestroy*Descriptor") {
            tracing::warn!(target: "denoise::cuda", kind = ?self.kind, error = %err, "failed to destroy cudnn descriptor");
        }
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:?}, {:#x})", self.kind, self.raw)
    }
}

/// Descriptors of one convolution problem.
pub struct ConvProblem<'a> {
    pub src: &'a Descriptor,
    pub weight: &'a Descriptor,
    pub conv: &'a Descriptor,
    pub dst: &'a Descriptor,
}

/// A cuDNN handle bound to one stream.
pub struct Handle {
    lib: Arc<Cudnn>,
    raw: usize,
}

impl Handle {
    fn raw(&self) -> Raw {
        self.raw as Raw
    }

    fn check(&self, status: CudnnStatus, call: &'static str) -> Result<()> {
        self.lib.check(status, call)
    }

    /// Workspace needed by `algo`, or None if the algorithm cannot run the
    /// problem.
    pub fn conv_workspace_size(&self, p: &ConvProblem<'_>, algo: i32) -> Option<usize> {
        let mut size = 0usize;
        // SAFETY: all descriptors are live.
        let status = unsafe {
            (self.lib.fns.get_conv_fwd_workspace_size)(
                self.raw(),
                p.src.raw(),
                p.weight.raw(),
                p.conv.raw(),
                p.dst.raw(),
                algo,
                &mut size,
            )
        };
        (status == CUDNN_STATUS_SUCCESS).then_some(size)
    }

    /// Largest workspace over every algorithm that supports the problem.
    pub fn max_conv_workspace_size(&self, p: &ConvProblem<'_>) -> usize {
        (0..CONV_FWD_ALGO_COUNT)
            .filter_map(|algo| self.conv_workspace_size(p, algo))
            .max()
            .unwrap_or(0)
    }

    /// Benchmark the algorithms on real operands and return the results,
    /// fastest first, limited to those that succeeded.
    ///
    /// # Safety
    /// The pointers must address device memory matching the descriptors and
    /// `workspace` must hold `workspace_size` bytes.
    pub unsafe fn find_conv_algorithms(
        &self,
        p: &ConvProblem<'_>,
        src: *const c_void,
        weight: *const c_void,
        dst: *mut c_void,
        workspace: *mut c_void,
        workspace_size: usize,
    ) -> Result<Vec<ConvFwdAlgoPerf>> {
        let mut max = 0i32;
        self.check(
            (self.lib.fns.get_conv_fwd_algo_max_count)(self.raw(), &mut max),
            "cudnnGetConvolutionForwardAlgorithmMaxCount",
        )?;
        let mut results = vec![ConvFwdAlgoPerf::default(); max.max(1) as usize];
        let mut returned = 0i32;
        self.check(
            (self.lib.fns.find_conv_fwd_algo_ex)(
                self.raw(),
                p.src.raw(),
                src,
                p.weight.raw(),
                weight,
                p.conv.raw(),
                p.dst.raw(),
                dst,
                results.len() as i32,
                &mut returned,
                results.as_mut_ptr(),
                workspace,
                workspace_size,
            ),
            "cudnnFindConvolutionForwardAlgorithmEx",
        )?;
        results.truncate(returned.max(0) as usize);
        results.retain(|r| r.status == CUDNN_STATUS_SUCCESS && r.memory <= workspace_size);
        Ok(results)
    }

    /// y = conv(x, w)
    ///
    /// # Safety
    /// As for [`Handle::find_conv_algorithms`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn convolution_forward(
        &self,
        p: &ConvProblem<'_>,
        algo: i32,
        src: *const c_void,
        weight: *const c_void,
        dst: *mut c_void,
        workspace: *mut c_void,
        workspace_size: usize,
    ) -> Result<()> {
        let (alpha, beta) = (1.0f32, 0.0f32);
        self.check(
            (self.lib.fns.convolution_forward)(
                self.raw(),
                &alpha as *const f32 as *const c_void,
                p.src.raw(),
                src,
                p.weight.raw(),
                weight,
                p.conv.raw(),
                algo,
                workspace,
                workspace_size,
                &beta as *const f32 as *const c_void,
                p.dst.raw(),
                dst,
            ),
            "cudnnConvolutionForward",
        )
    }

    /// c += a, broadcasting a over the dimensions where it has size 1.
    ///
    /// # Safety
    /// The pointers must address device memory matching the descriptors.
    pub unsafe fn add_tensor(
        &self,
        a_desc: &Descriptor,
        a: *const c_void,
        c_desc: &Descriptor,
        c: *mut c_void,
    ) -> Result<()> {
        let (alpha, beta) = (1.0f32, 1.0f32);
        self.check(
            (self.lib.fns.add_tensor)(
                self.raw(),
                &alpha as *const f32 as *const c_void,
                a_desc.raw(),
                a,
                &beta as *const f32 as *const c_void,
                c_desc.raw(),
                c,
            ),
            "cudnnAddTensor",
        )
    }

    /// In-place activation of `x`.
    ///
    /// # Safety
    /// `x` must address device memory matching `x_desc`.
    pub unsafe fn activation_forward(
        &self,
        activation: &Descriptor,
        x_desc: &Descriptor,
        x: *mut c_void,
    ) -> Result<()> {
        let (alpha, beta) = (1.0f32, 0.0f32);
        self.check(
            (self.lib.fns.activation_forward)(
                self.raw(),
                activation.raw(),
                &alpha as *const f32 as *const c_void,
                x_desc.raw(),
                x,
                &beta as *const f32 as *const c_void,
                x_desc.raw(),
                x,
            ),
            "cudnnActivationForward",
        )
    }

    /// # Safety
    /// The pointers must address device memory matching the descriptors.
    pub unsafe fn pooling_forward(
        &self,
        pooling: &Descriptor,
        x_desc: &Descriptor,
        x: *const c_void,
        y_desc: &Descriptor,
        y: *mut c_void,
    ) -> Result<()> {
        let (alpha, beta) = (1.0f32, 0.0f32);
        self.check(
            (self.lib.fns.pooling_forward)(
                self.raw(),
                pooling.raw(),
                &alpha as *const f32 as *const c_void,
                x_desc.raw(),
                x,
                &beta as *const f32 as *const c_void,
                y_desc.raw(),
                y,
            ),
            "cudnnPoolingForward",
        )
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // SAFETY: raw was created by cudnnCreate.
        let status = unsafe { (self.lib.fns.destroy)(self.raw()) };
        if let Err(err) = self.lib.check(status, "cudnnDestroy") {
            tracing::warn!(target: "denoise::cuda", error = %err, "failed to destroy cudnn handle");
        }
    }
}

// SAFETY: the handle is only used under the engine mutex; descriptors are
// immutable after creation.
unsafe impl Send for Handle {}
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

fn data_type(dtype: DataType) -> Result<i32> {
    match dtype {
        DataType::Float32 => Ok(CUDNN_DATA_FLOAT),
        DataType::Float16 => Ok(CUDNN_DATA_HALF),
        other => Err(Error::invalid_argument(format!(
            "cudnn has no {other} tensor support"
        ))),
    }
}

fn to_i32(dims: [usize; 4]) -> Result<[i32; 4]> {
    let mut out = [0i32; 4];
    for (o, d) in out.iter_mut().zip(dims) {
        *o = i32::try_from(d)
            .map_err(|_| Error::invalid_argument(format!("dimension {d} exceeds cudnn limits")))?;
    }
    Ok(out)
}

/// NCHW dims of an activation tensor cuDNN can describe: planar layout,
/// f32 or f16 elements.
pub fn activation_dims(desc: &TensorDesc) -> Option<[usize; 4]> {
    let native = desc.layout() == TensorLayout::Chw
        && matches!(desc.dtype(), DataType::Float32 | DataType::Float16);
    native.then(|| [desc.n(), desc.c(), desc.h(), desc.w()])
}
