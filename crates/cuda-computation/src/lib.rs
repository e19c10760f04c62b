//! RAII device memory for CUDA computations.
//!
//! This crate owns device allocations through [`DeviceBuffer`], maps every
//! failing native call to the [`ComputationResult`] category of its call site,
//! and runs element-wise vector kernels on a selected device.
//!
//! Native calls go through the [`DeviceRuntime`] trait. [`HostRuntime`] is a
//! software device that is always available; with the `cuda` feature,
//! `DriverRuntime` drives a real GPU through the CUDA driver API.
//!
//! # Quick Start
//!
//! ```ignore
//! use cuda_computation::vector_add_gpu;
//!
//! // Simple one-shot API (uses cached global context)
//! let a = vec![1.0f32; 1 << 20];
//! let b = vec![2.0f32; 1 << 20];
//! let c = vector_add_gpu(&a, &b)?;
//! ```
//!
//! # Persistent Context
//!
//! For explicit context management:
//!
//! ```ignore
//! use cuda_computation::{launch_vector_add, CudaContext};
//!
//! let ctx = CudaContext::new()?;
//!
//! let a_gpu = ctx.upload(&a)?;
//! let b_gpu = ctx.upload(&b)?;
//! let mut c_gpu = ctx.alloc::<f32>(a.len())?;
//!
//! launch_vector_add(&ctx, &a_gpu, &b_gpu, &mut c_gpu)?;
//!
//! let c = c_gpu.to_host()?;
//! // All three buffers are released here.
//! ```
//!
//! # Configuration
//!
//! [`CudaContext::new`] and the global context read [`RuntimeConfig`] from
//! the environment (`CUDA_COMPUTATION_BACKEND`, `CUDA_COMPUTATION_DEVICE`,
//! ...). Without the `cuda` feature the host backend is the default.

mod config;
mod context;
#[cfg(feature = "cuda")]
mod driver;
mod error;
mod host;
mod kernels;
mod memory;
mod runtime;

use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Global context for convenience functions.
/// Lazily initialized on first use, persists for process lifetime.
static GLOBAL_CONTEXT: OnceCell<CudaContext> = OnceCell::new();

/// Mutex to ensure only one thread initializes the context.
static INIT_MUTEX: Mutex<()> = Mutex::new(());

/// One-shot computations on the global context run one at a time.
static COMPUTATION_LOCK: Mutex<()> = Mutex::new(());

/// Get or initialize the global context.
///
/// This function is thread-safe and will only initialize the context once.
/// Subsequent calls return the cached context.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or device selection fails.
/// A failed initialization is retried on the next call.
pub fn get_global_context() -> Result<&'static CudaContext> {
    // Fast path: already initialized
    if let Some(ctx) = GLOBAL_CONTEXT.get() {
        return Ok(ctx);
    }

    let _lock = INIT_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);

    // Double-check after acquiring lock
    GLOBAL_CONTEXT.get_or_try_init(CudaContext::new)
}

fn computation_guard() -> MutexGuard<'static, ()> {
    COMPUTATION_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub use config::{
    Backend, RuntimeConfig, BACKEND_VAR, DEVICE_VAR, HOST_DEVICES_VAR, HOST_MEMORY_VAR,
};
pub use context::CudaContext;
#[cfg(feature = "cuda")]
pub use driver::DriverRuntime;
pub use error::{check, ComputationResult, CudaError, NativeResult, OrFail, Result, Status};
pub use host::{HostRuntime, HostStats, Operation, DEFAULT_HOST_MEMORY};
pub use kernels::{launch_vector_add, VectorKernel};
pub use memory::{DeviceBuffer, DeviceElement, SharedDeviceBuffer};
pub use runtime::{DevicePtr, DeviceRuntime, Kernel, KernelArgs, NULL_DEVICE_PTR};

/// One-shot element-wise addition on the global context.
///
/// Uploads both inputs, adds them on the device and downloads the sum. Every
/// device buffer is released before this returns, on success or failure.
///
/// # Example
///
/// ```ignore
/// use cuda_computation::vector_add_gpu;
///
/// let c = vector_add_gpu(&[1.0f64, 2.0], &[3.0, 4.0])?;
/// assert_eq!(c, vec![4.0, 6.0]);
/// ```
pub fn vector_add_gpu<T: VectorKernel>(left: &[T], right: &[T]) -> Result<Vec<T>> {
    if left.len() != right.len() {
        return Err(CudaError::DimensionMismatch(format!(
            "vector addition of {} and {} elements",
            left.len(),
            right.len()
        )));
    }
    if left.is_empty() {
        return Ok(Vec::new());
    }

    let ctx = get_global_context()?;
    let _guard = computation_guard();

    let a_gpu = ctx.upload(left)?;
    let b_gpu = ctx.upload(right)?;
    let c_gpu = vector_add_gpu_with_ctx(ctx, &a_gpu, &b_gpu)?;

    c_gpu.to_host()
}

/// Element-wise addition of two device buffers into a new one.
///
/// Use this function when the operands already live on the device.
pub fn vector_add_gpu_with_ctx<T: VectorKernel>(
    ctx: &CudaContext,
    left: &DeviceBuffer<T>,
    right: &DeviceBuffer<T>,
) -> Result<DeviceBuffer<T>> {
    let mut out = ctx.alloc(left.len())?;
    launch_vector_add(ctx, left, right, &mut out)?;
    Ok(out)
}

/// Initialize the global context and run every kernel once.
///
/// With the `cuda` feature this pays the NVRTC compilation up front instead
/// of on the first computation.
pub fn warmup() -> Result<()> {
    let ctx = get_global_context()?;
    let _guard = computation_guard();

    let single = ctx.upload(&[0.0f32])?;
    vector_add_gpu_with_ctx(ctx, &single, &single)?;
    let double = ctx.upload(&[0.0f64])?;
    vector_add_gpu_with_ctx(ctx, &double, &double)?;

    log::info!("warmed up {}", ctx.device_name());
    Ok(())
}
