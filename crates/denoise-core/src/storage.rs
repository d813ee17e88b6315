use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// Storage — where an allocation lives
//
//   Host    — ordinary host memory, never accessible from an accelerator
//   Device  — accelerator-only memory (on the CPU backend this is host memory)
//   Managed — host-device shared memory, migrated on demand by the driver
//
// Undefined is only ever produced when classifying a pointer that does not
// belong to any known allocation; allocating with it is an error.

/// Storage class of a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    Undefined,
    Host,
    Device,
    Managed,
}

impl Storage {
    /// Whether the calling host thread may dereference memory of this class.
    pub fn is_host_accessible(&self) -> bool {
        matches!(self, Storage::Host | Storage::Managed)
    }

    /// Whether device kernels may dereference memory of this class.
    pub fn is_device_accessible(&self) -> bool {
        matches!(self, Storage::Device | Storage::Managed)
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Storage::Undefined => "undefined",
            Storage::Host => "host",
            Storage::Device => "device",
            Storage::Managed => "managed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Storage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Storage::Host),
            "device" => Ok(Storage::Device),
            "managed" => Ok(Storage::Managed),
            other => Err(Error::invalid_argument(format!(
                "unknown storage class '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessibility() {
        assert!(Storage::Host.is_host_accessible());
        assert!(!Storage::Host.is_device_accessible());
        assert!(Storage::Managed.is_host_accessible());
        assert!(Storage::Managed.is_device_accessible());
        assert!(!Storage::Device.is_host_accessible());
        assert!(!Storage::Undefined.is_device_accessible());
    }

    #[test]
    fn test_parse() {
        assert_eq!("Device".parse::<Storage>().unwrap(), Storage::Device);
        assert!("undefined".parse::<Storage>().is_err());
    }
}
