use std::fmt;

use crate::storage::Storage;

/// Public error codes, stable across backends.
///
/// Every [`Error`] maps onto exactly one code so that a C-style front end can
/// report failures without knowing the Rust error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    Unknown = 1,
    InvalidArgument = 2,
    InvalidOperation = 3,
    OutOfMemory = 4,
    UnsupportedHardware = 5,
    Cancelled = 6,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::None => "none",
            ErrorCode::Unknown => "unknown",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::InvalidOperation => "invalid operation",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::UnsupportedHardware => "unsupported hardware",
            ErrorCode::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// All errors that can occur within the denoise backends.
///
/// The variants follow the failure taxonomy of the device layer:
/// malformed construction input, caller contract violations, pointer
/// invariants broken after construction, resource exhaustion and native
/// backend status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed construction input (e.g. a buffer region out of range).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller broke the operator/device contract (finalize twice, run
    /// before finalize, operands missing).
    #[error("logic error: {0}")]
    Logic(String),

    /// A tensor or image view no longer fits its buffer after a pointer refresh.
    #[error("out of range: {0}")]
    Range(String),

    /// An allocation failed. Never retried internally.
    #[error("out of memory: failed to allocate {bytes} bytes of {storage} memory")]
    OutOfMemory { bytes: usize, storage: Storage },

    /// A native backend call returned a non-success status.
    #[error("{backend} call {call} failed with status {code}: {message}")]
    Backend {
        backend: &'static str,
        call: &'static str,
        code: i64,
        message: String,
    },

    /// The backend runtime or hardware is not available.
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid_argument(s: impl Into<String>) -> Self {
        Error::InvalidArgument(s.into())
    }

    pub fn logic(s: impl Into<String>) -> Self {
        Error::Logic(s.into())
    }

    pub fn range(s: impl Into<String>) -> Self {
        Error::Range(s.into())
    }

    pub fn backend(
        backend: &'static str,
        call: &'static str,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            backend,
            call,
            code,
            message: message.into(),
        }
    }

    /// The public code this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Logic(_) | Error::Range(_) => ErrorCode::InvalidOperation,
            Error::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Error::UnsupportedHardware(_) => ErrorCode::UnsupportedHardware,
            Error::Backend { .. } | Error::Msg(_) => ErrorCode::Unknown,
        }
    }
}

/// Convenience Result type used throughout the denoise crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error of the given kind.
///
/// Usage: `bail!(Logic, "convolution already finalized")`
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::Error::$kind(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_with_logic() -> Result<()> {
        bail!(Logic, "operator {} not finalized", "conv");
    }

    #[test]
    fn test_bail_builds_variant() {
        let err = fails_with_logic().unwrap_err();
        assert!(matches!(err, Error::Logic(ref m) if m == "operator conv not finalized"));
        assert_eq!(err.code(), ErrorCode::InvalidOperation);
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            Error::invalid_argument("x").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(Error::range("x").code(), ErrorCode::InvalidOperation);
        assert_eq!(
            Error::OutOfMemory {
                bytes: 16,
                storage: Storage::Device
            }
            .code(),
            ErrorCode::OutOfMemory
        );
        let e = Error::backend("cuDNN", "cudnnConvolutionForward", 3, "bad param");
        assert_eq!(e.code(), ErrorCode::Unknown);
        assert!(e.to_string().contains("cudnnConvolutionForward"));
    }
}
