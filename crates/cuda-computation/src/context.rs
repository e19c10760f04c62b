//! CUDA context: device selection, reset, synchronization and kernel launch.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{check, ComputationResult, Result};
use crate::host::HostRuntime;
use crate::memory::{DeviceBuffer, DeviceElement};
use crate::runtime::{DeviceRuntime, Kernel, KernelArgs};

/// A selected device on a runtime.
///
/// Selection is ambient state of the runtime: buffers allocated through the
/// context, or directly on its runtime, land on the selected device.
pub struct CudaContext {
    runtime: Arc<dyn DeviceRuntime>,
    ordinal: usize,
}

impl CudaContext {
    /// Create a context from the environment configuration.
    pub fn new() -> Result<Self> {
        Self::from_config(&RuntimeConfig::from_env()?)
    }

    /// Create a context as described by `config`.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Self::select(config.build_runtime()?, config.device)
    }

    /// Select device `ordinal` on `runtime`.
    ///
    /// # Errors
    ///
    /// * `CudaError::Failed` with `SetDeviceFailed` - the runtime rejected the ordinal
    pub fn select(runtime: Arc<dyn DeviceRuntime>, ordinal: usize) -> Result<Self> {
        check(runtime.set_device(ordinal), ComputationResult::SetDeviceFailed)?;
        log::info!("selected {} device {ordinal}", runtime.name());
        Ok(Self { runtime, ordinal })
    }

    /// Select device 0 on a fresh [`HostRuntime`] with `capacity` bytes.
    ///
    /// Returns the runtime as well, for inspecting allocations.
    pub fn host(capacity: usize) -> Result<(Arc<HostRuntime>, Self)> {
        let host = Arc::new(HostRuntime::new(capacity));
        let ctx = Self::select(host.clone(), 0)?;
        Ok((host, ctx))
    }

    /// Get the underlying runtime.
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Get the selected device ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn device_name(&self) -> String {
        format!("{} device {}", self.runtime.name(), self.ordinal)
    }

    /// Reset the device.
    ///
    /// Every allocation on the device is released. Buffers still alive keep
    /// their stale addresses; their own release then fails and is only logged.
    pub fn reset(&self) -> Result<()> {
        check(
            self.runtime.device_reset(),
            ComputationResult::DeviceResetFailed,
        )?;
        log::info!("reset {}", self.device_name());
        Ok(())
    }

    /// Block until all submitted work on the device has completed.
    pub fn synchronize(&self) -> Result<()> {
        check(
            self.runtime.synchronize(),
            ComputationResult::DeviceSynchronizeFailed,
        )
    }

    /// Launch `kernel`.
    ///
    /// # Safety
    ///
    /// Every address in `args` must cover `args.len` elements of the kernel's
    /// element type on this context's runtime.
    pub unsafe fn launch(&self, kernel: Kernel, args: &KernelArgs) -> Result<()> {
        log::debug!("launching {} over {} elements", kernel.name(), args.len);
        check(
            self.runtime.launch(kernel, args),
            ComputationResult::KernelFailed,
        )
    }

    /// Allocate an uninitialized buffer of `len` elements.
    pub fn alloc<T: DeviceElement>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        DeviceBuffer::new(Arc::clone(&self.runtime), len)
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn upload<T: DeviceElement>(&self, data: &[T]) -> Result<DeviceBuffer<T>> {
        DeviceBuffer::from_host(Arc::clone(&self.runtime), data)
    }
}
