// Device selection — pick and open an execution backend
//
//   Default  the best available backend: CUDA when compiled in and usable,
//            otherwise the CPU
//   Cpu      the host backend
//   Cuda     the NVIDIA backend; an error when it is not compiled in or
//            the GPU stack cannot be opened
//
// The kind is usually taken from DENOISE_DEVICE ("default", "cpu", "cuda").

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use denoise_core::{Device, DeviceConfig, Error, Result};
use denoise_cpu::CpuDevice;

/// Environment variable naming the backend.
pub const ENV_DEVICE: &str = "DENOISE_DEVICE";

/// Which backend [`new_device`] opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    #[default]
    Default,
    Cpu,
    Cuda,
}

impl DeviceKind {
    /// The kind named by `DENOISE_DEVICE`, or `Default` when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ENV_DEVICE) {
            Ok(v) if !v.trim().is_empty() => v.parse(),
            _ => Ok(DeviceKind::Default),
        }
    }

    /// Whether this backend was compiled into the crate.
    pub fn is_compiled(self) -> bool {
        match self {
            DeviceKind::Default | DeviceKind::Cpu => true,
            DeviceKind::Cuda => cfg!(feature = "cuda"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "auto" => Ok(DeviceKind::Default),
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" | "gpu" => Ok(DeviceKind::Cuda),
            other => Err(Error::invalid_argument(format!("unknown device type {other:?}"))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Default => "default",
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
        })
    }
}

/// Open a device of the given kind.
pub fn new_device(kind: DeviceKind, config: DeviceConfig) -> Result<Arc<dyn Device>> {
    match kind {
        DeviceKind::Cpu => Ok(Arc::new(CpuDevice::new(config)?)),
        DeviceKind::Cuda => new_cuda_device(config),
        DeviceKind::Default => match new_cuda_device(config.clone()) {
            Ok(device) => Ok(device),
            Err(e) => {
                tracing::info!(target: "denoise", reason = %e, "cuda unavailable, using the cpu device");
                Ok(Arc::new(CpuDevice::new(config)?))
            }
        },
    }
}

/// Open the device named by `DENOISE_DEVICE` with the `DENOISE_*` config.
pub fn new_device_from_env() -> Result<Arc<dyn Device>> {
    new_device(DeviceKind::from_env()?, DeviceConfig::from_env()?)
}

#[cfg(feature = "cuda")]
fn new_cuda_device(config: DeviceConfig) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(denoise_cuda::CudaDevice::new(config)?))
}

#[cfg(not(feature = "cuda"))]
fn new_cuda_device(_config: DeviceConfig) -> Result<Arc<dyn Device>> {
    Err(Error::UnsupportedHardware(
        "denoise was built without the cuda feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for kind in [DeviceKind::Default, DeviceKind::Cpu, DeviceKind::Cuda] {
            assert_eq!(kind.to_string().parse::<DeviceKind>().unwrap(), kind);
        }
        assert_eq!(" GPU ".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda);
        assert!(matches!("tpu".parse::<DeviceKind>(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_default_falls_back_to_cpu() {
        let device = new_device(DeviceKind::Default, DeviceConfig::default().num_threads(1)).unwrap();
        if !cfg!(feature = "cuda") {
            assert_eq!(device.name(), "cpu");
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_without_feature_is_unsupported() {
        let err = new_device(DeviceKind::Cuda, DeviceConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedHardware(_)));
        assert!(!DeviceKind::Cuda.is_compiled());
    }
}
