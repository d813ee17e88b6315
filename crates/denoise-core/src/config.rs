use std::str::FromStr;

use crate::error::{Error, Result};

// Device configuration
//
// Settings a device reads once, at construction. Values can be set with the
// builder methods or taken from the environment:
//
//   DENOISE_NUM_THREADS     worker threads of the CPU device (0 = all cores)
//   DENOISE_VERBOSE         verbosity level (0 = warnings only)
//   DENOISE_DEVICE_ORDINAL  GPU index for GPU devices

pub const ENV_NUM_THREADS: &str = "DENOISE_NUM_THREADS";
pub const ENV_VERBOSE: &str = "DENOISE_VERBOSE";
pub const ENV_DEVICE_ORDINAL: &str = "DENOISE_DEVICE_ORDINAL";

/// Construction settings of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of kernel threads. 0 = one per available core.
    pub num_threads: usize,
    /// Verbosity; devices log their properties at info level when >= 1.
    pub verbose: u32,
    /// Index of the GPU to use.
    pub device_ordinal: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            verbose: 0,
            device_ordinal: 0,
        }
    }
}

impl DeviceConfig {
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }
    pub fn verbose(mut self, v: u32) -> Self {
        self.verbose = v;
        self
    }
    pub fn device_ordinal(mut self, ordinal: usize) -> Self {
        self.device_ordinal = ordinal;
        self
    }

    /// Defaults overridden by the `DENOISE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, ENV_NUM_THREADS)? {
            config.num_threads = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_VERBOSE)? {
            config.verbose = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_DEVICE_ORDINAL)? {
            config.device_ordinal = v;
        }
        Ok(config)
    }

    /// The thread count to actually use.
    pub fn effective_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_argument(format!("{key}={raw:?} is not a valid number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_builder() {
        let c = DeviceConfig::default().num_threads(4).verbose(2).device_ordinal(1);
        assert_eq!(c.num_threads, 4);
        assert_eq!(c.verbose, 2);
        assert_eq!(c.device_ordinal, 1);
        assert_eq!(c.effective_threads(), 4);
    }

    #[test]
    fn test_from_lookup() {
        let c = DeviceConfig::from_lookup(lookup(&[
            (ENV_NUM_THREADS, "3"),
            (ENV_VERBOSE, " 1 "),
            (ENV_DEVICE_ORDINAL, ""),
        ]))
        .unwrap();
        assert_eq!(c, DeviceConfig::default().num_threads(3).verbose(1));
    }

    #[test]
    fn test_bad_value_is_invalid_argument() {
        let err = DeviceConfig::from_lookup(lookup(&[(ENV_VERBOSE, "loud")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_all_cores_is_at_least_one() {
        assert!(DeviceConfig::default().effective_threads() >= 1);
    }
}
