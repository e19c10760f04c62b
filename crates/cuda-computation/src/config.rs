//! Runtime configuration.
//!
//! Provides type-safe configuration with validation, loadable from the
//! environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `CUDA_COMPUTATION_BACKEND` | `cuda` or `host` | `cuda` with the `cuda` feature, else `host` |
//! | `CUDA_COMPUTATION_DEVICE` | device ordinal | `0` |
//! | `CUDA_COMPUTATION_HOST_MEMORY` | host device memory in bytes | 1 GiB |
//! | `CUDA_COMPUTATION_HOST_DEVICES` | number of host devices | `1` |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CudaError, Result};
use crate::host::{HostRuntime, DEFAULT_HOST_MEMORY};
use crate::runtime::DeviceRuntime;

pub const BACKEND_VAR: &str = "CUDA_COMPUTATION_BACKEND";
pub const DEVICE_VAR: &str = "CUDA_COMPUTATION_DEVICE";
pub const HOST_MEMORY_VAR: &str = "CUDA_COMPUTATION_HOST_MEMORY";
pub const HOST_DEVICES_VAR: &str = "CUDA_COMPUTATION_HOST_DEVICES";

/// Which runtime backs device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The CUDA driver (requires the `cuda` feature).
    Cuda,
    /// A software device in host memory.
    Host,
}

impl FromStr for Backend {
    type Err = CudaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Backend::Cuda),
            "host" | "cpu" => Ok(Backend::Host),
            other => Err(CudaError::InvalidConfig(format!(
                "unknown backend {other:?}, expected \"cuda\" or \"host\""
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cuda => f.write_str("cuda"),
            Backend::Host => f.write_str("host"),
        }
    }
}

/// Configuration of the runtime a [`CudaContext`](crate::CudaContext) is built on.
///
/// # Example
///
/// ```
/// use cuda_computation::{Backend, RuntimeConfig};
///
/// let config = RuntimeConfig {
///     backend: Backend::Host,
///     ..RuntimeConfig::default()
/// };
/// assert_eq!(config.device, 0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub backend: Backend,
    /// Ordinal of the device to select.
    pub device: usize,
    /// Memory of each host device, in bytes.
    pub host_memory: usize,
    /// Number of host devices.
    pub host_devices: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "cuda") {
                Backend::Cuda
            } else {
                Backend::Host
            },
            device: 0,
            host_memory: DEFAULT_HOST_MEMORY,
            host_devices: 1,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CudaError::InvalidConfig(format!("{key}: cannot parse {raw:?}"))),
    }
}

impl RuntimeConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from `lookup`, which maps variable names to values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let backend = match lookup(BACKEND_VAR) {
            Some(raw) => raw.parse()?,
            None => defaults.backend,
        };
        let config = Self {
            backend,
            device: parse_var(DEVICE_VAR, lookup(DEVICE_VAR), defaults.device)?,
            host_memory: parse_var(
                HOST_MEMORY_VAR,
                lookup(HOST_MEMORY_VAR),
                defaults.host_memory,
            )?,
            host_devices: parse_var(
                HOST_DEVICES_VAR,
                lookup(HOST_DEVICES_VAR),
                defaults.host_devices,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the CUDA backend is requested without the `cuda` feature
    /// - a host device would have no memory
    /// - no host devices are configured
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Cuda && !cfg!(feature = "cuda") {
            return Err(CudaError::InvalidConfig(
                "the cuda backend requires the `cuda` feature".to_string(),
            ));
        }
        if self.backend == Backend::Host {
            if self.host_memory == 0 {
                return Err(CudaError::InvalidConfig(
                    "host device memory must be positive".to_string(),
                ));
            }
            if self.host_devices == 0 {
                return Err(CudaError::InvalidConfig(
                    "at least one host device is required".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the runtime this configuration describes.
    pub fn build_runtime(&self) -> Result<Arc<dyn DeviceRuntime>> {
        match self.backend {
            Backend::Host => Ok(Arc::new(HostRuntime::with_devices(
                self.host_devices,
                self.host_memory,
            ))),
            #[cfg(feature = "cuda")]
            Backend::Cuda => Ok(Arc::new(crate::driver::DriverRuntime::new())),
            #[cfg(not(feature = "cuda"))]
            Backend::Cuda => Err(CudaError::InvalidConfig(
                "the cuda backend requires the `cuda` feature".to_string(),
            )),
        }
    }
}
