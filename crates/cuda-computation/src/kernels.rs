//! Vector kernel trait and implementations.

use std::ops::Add;

use crate::context::CudaContext;
use crate::error::{CudaError, Result};
use crate::memory::{validate_runtime, DeviceBuffer, DeviceElement};
use crate::runtime::{Kernel, KernelArgs};

/// Element types with an element-wise addition kernel.
pub trait VectorKernel: DeviceElement + Add<Output = Self> {
    /// Kernel computing `out[i] = left[i] + right[i]`.
    const ADD_KERNEL: Kernel;
}

macro_rules! impl_vector_kernel {
    ($($t:ty => $kernel:expr),* $(,)?) => {
        $(
            impl VectorKernel for $t {
                const ADD_KERNEL: Kernel = $kernel;
            }
        )*
    };
}

impl_vector_kernel!(
    f32 => Kernel::VectorAddF32,
    f64 => Kernel::VectorAddF64,
);

/// Launch `out = left + right` and wait for it to complete.
///
/// All three buffers must come from the context's runtime.
pub fn launch_vector_add<T: VectorKernel>(
    ctx: &CudaContext,
    left: &DeviceBuffer<T>,
    right: &DeviceBuffer<T>,
    out: &mut DeviceBuffer<T>,
) -> Result<()> {
    if left.len() != right.len() || out.len() != left.len() {
        return Err(CudaError::DimensionMismatch(format!(
            "vector addition of {} and {} elements into {}",
            left.len(),
            right.len(),
            out.len()
        )));
    }

    for buffer in [left, right, &*out] {
        validate_runtime(ctx.runtime(), buffer.runtime(), "vector addition")?;
    }

    let args = KernelArgs {
        left: left.device_ptr(),
        right: right.device_ptr(),
        out: out.device_ptr(),
        len: out.len(),
    };

    // SAFETY: all three buffers live on ctx's runtime and hold args.len elements
    // of T, the kernel's element type.
    unsafe { ctx.launch(T::ADD_KERNEL, &args)? };
    ctx.synchronize()
}
