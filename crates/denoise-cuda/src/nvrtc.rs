// NVRTC — runtime compilation of the element kernels to PTX
//
// The kernel source is compiled once per device for the device's compute
// capability; the resulting PTX is loaded with cuModuleLoadData, which
// JIT-compiles it for the exact GPU.

use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, OnceLock};

use libloading::Library;

use denoise_core::{Error, Result};

use crate::driver::{load_library, load_symbol};

type NvrtcResult = i32;
type NvrtcProgram = *mut std::ffi::c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;
const NVRTC_ERROR_COMPILATION: NvrtcResult = 6;

type CreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const c_char,
    name: *const c_char,
    num_headers: i32,
    headers: *const *const c_char,
    include_names: *const *const c_char,
) -> NvrtcResult;
type CompileProgramFn =
    unsafe extern "C" fn(prog: NvrtcProgram, num_options: i32, options: *const *const c_char) -> NvrtcResult;
type GetSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type GetDataFn = unsafe extern "C" fn(prog: NvrtcProgram, data: *mut c_char) -> NvrtcResult;
type DestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;
type GetErrorStringFn = unsafe extern "C" fn(result: NvrtcResult) -> *const c_char;

struct NvrtcFns {
    create_program: CreateProgramFn,
    compile_program: CompileProgramFn,
    get_program_log_size: GetSizeFn,
    get_program_log: GetDataFn,
    get_ptx_size: GetSizeFn,
    get_ptx: GetDataFn,
    destroy_program: DestroyProgramFn,
    get_error_string: GetErrorStringFn,
}

/// The loaded NVRTC library.
pub struct Nvrtc {
    _lib: Library,
    fns: NvrtcFns,
}

static NVRTC: OnceLock<std::result::Result<Arc<Nvrtc>, String>> = OnceLock::new();

pub fn nvrtc() -> Result<Arc<Nvrtc>> {
    let init = NVRTC.get_or_init(|| match Nvrtc::load() {
        Ok(lib) => Ok(Arc::new(lib)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(lib) => Ok(Arc::clone(lib)),
        Err(msg) => Err(Error::UnsupportedHardware(format!("NVRTC unavailable: {msg}"))),
    }
}

/// Owns an nvrtcProgram for the duration of one compilation.
struct Program<'a> {
    lib: &'a Nvrtc,
    raw: NvrtcProgram,
}

impl Drop for Program<'_> {
    fn drop(&mut self) {
        // SAFETY: raw was created by nvrtcCreateProgram.
        let status = unsafe { (self.lib.fns.destroy_program)(&mut self.raw) };
        if status != NVRTC_SUCCESS {
            tracing::warn!(target: "denoise::cuda", status, "failed to destroy nvrtc program");
        }
    }
}

impl Nvrtc {
    fn load() -> Result<Self> {
        let lib = load_library(
            "NVRTC",
            &[
                "libnvrtc.so.12",
                "libnvrtc.so.11.2",
                "libnvrtc.so",
                "nvrtc64_120_0.dll",
                "nvrtc64_112_0.dll",
            ],
        )?;
        let fns = NvrtcFns {
            create_program: load_symbol(&lib, b"nvrtcCreateProgram\0")?,
            compile_program: load_symbol(&lib, b"nvrtcCompileProgram\0")?,
            get_program_log_size: load_symbol(&lib, b"nvrtcGetProgramLogSize\0")?,
            get_program_log: load_symbol(&lib, b"nvrtcGetProgramLog\0")?,
            get_ptx_size: load_symbol(&lib, b"nvrtcGetPTXSize\0")?,
            get_ptx: load_symbol(&lib, b"nvrtcGetPTX\0")?,
            destroy_program: load_symbol(&lib, b"nvrtcDestroyProgram\0")?,
            get_error_string: load_symbol(&lib, b"nvrtcGetErrorString\0")?,
        };
        Ok(Nvrtc { _lib: lib, fns })
    }

    fn check(&self, status: NvrtcResult, call: &'static str) -> Result<()> {
        if status == NVRTC_SUCCESS {
            return Ok(());
        }
        // SAFETY: returns a static string.
        let p = unsafe { (self.fns.get_error_string)(status) };
        let message = if p.is_null() {
            "unknown error".to_string()
        } else {
            // SAFETY: non-null static NUL-terminated string.
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        };
        Err(Error::backend("nvrtc", call, status as i64, message))
    }

    /// Compile `source` to PTX for compute capability `(major, minor)`.
    pub fn compile_ptx(&self, source: &str, name: &str, capability: (i32, i32)) -> Result<String> {
        let src = CString::new(source).map_err(|_| Error::msg("kernel source contains a NUL byte"))?;
        let name = CString::new(name).map_err(|_| Error::msg("program name contains a NUL byte"))?;
        let options: Vec<CString> = compile_options(capability)
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::msg("compile option contains a NUL byte"))?;
        let option_ptrs: Vec<*const c_char> = options.iter().map(|o| o.as_ptr()).collect();

        let mut raw: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: NUL-terminated strings, no headers.
        self.check(
            unsafe {
                (self.fns.create_program)(
                    &mut raw,
                    src.as_ptr(),
                    name.as_ptr(),
                    0,
                    std::ptr::null(),
                    std::ptr::null(),
                )
            },
            "nvrtcCreateProgram",
        )?;
        let program = Program { lib: self, raw };

        // SAFETY: option pointers outlive the call.
        let status = unsafe {
            (self.fns.compile_program)(program.raw, option_ptrs.len() as i32, option_ptrs.as_ptr())
        };
        if status == NVRTC_ERROR_COMPILATION {
            let log = self.program_log(&program).unwrap_or_default();
            return Err(Error::backend("nvrtc", "nvrtcCompileProgram", status as i64, log));
        }
        self.check(status, "nvrtcCompileProgram")?;

        let mut size = 0usize;
        // SAFETY: valid program and out pointer.
        self.check(
            unsafe { (self.fns.get_ptx_size)(program.raw, &mut size) },
            "nvrtcGetPTXSize",
        )?;
        let mut ptx = vec![0u8; size];
        // SAFETY: the buffer holds `size` bytes.
        self.check(
            unsafe { (self.fns.get_ptx)(program.raw, ptx.as_mut_ptr() as *mut c_char) },
            "nvrtcGetPTX",
        )?;
        Ok(c_buffer_to_string(ptx))
    }

    fn program_log(&self, program: &Program<'_>) -> Result<String> {
        let mut size = 0usize;
        // SAFETY: valid program and out pointer.
        self.check(
            unsafe { (self.fns.get_program_log_size)(program.raw, &mut size) },
            "nvrtcGetProgramLogSize",
        )?;
        let mut log = vec![0u8; size];
        // SAFETY: the buffer holds `size` bytes.
        self.check(
            unsafe { (self.fns.get_program_log)(program.raw, log.as_mut_ptr() as *mut c_char) },
            "nvrtcGetProgramLog",
        )?;
        Ok(c_buffer_to_string(log))
    }
}

fn compile_options(capability: (i32, i32)) -> Vec<String> {
    let (major, minor) = capability;
    vec![
        format!("--gpu-architecture=compute_{major}{minor}"),
        "--std=c++14".to_string(),
    ]
}

fn c_buffer_to_string(mut bytes: Vec<u8>) -> String {
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
