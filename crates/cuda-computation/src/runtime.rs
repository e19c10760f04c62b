//! The native device-runtime call surface.

use crate::error::{NativeResult, Status};

/// Raw device address. `0` is the null address.
pub type DevicePtr = u64;

/// The null device address.
pub const NULL_DEVICE_PTR: DevicePtr = 0;

/// Kernels the runtimes know how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    VectorAddF32,
    VectorAddF64,
}

impl Kernel {
    pub const ALL: [Kernel; 2] = [Kernel::VectorAddF32, Kernel::VectorAddF64];

    /// Kernel function name in the compiled module.
    pub fn name(self) -> &'static str {
        match self {
            Kernel::VectorAddF32 => "single_precision_vector_addition",
            Kernel::VectorAddF64 => "double_precision_vector_addition",
        }
    }

    /// Size in bytes of one element the kernel operates on.
    pub fn element_size(self) -> usize {
        match self {
            Kernel::VectorAddF32 => std::mem::size_of::<f32>(),
            Kernel::VectorAddF64 => std::mem::size_of::<f64>(),
        }
    }
}

/// Arguments of an element-wise binary kernel: `out[i] = left[i] op right[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelArgs {
    pub left: DevicePtr,
    pub right: DevicePtr,
    pub out: DevicePtr,
    pub len: usize,
}

/// A device runtime: the set of native calls device buffers are built on.
///
/// Every method reports a native [`Status`]; callers turn it into a typed
/// failure with [`check`](crate::check). Device selection is ambient state of
/// the runtime: once [`set_device`](DeviceRuntime::set_device) succeeds, all
/// later calls target that device.
pub trait DeviceRuntime: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Select the device subsequent calls target.
    fn set_device(&self, ordinal: usize) -> Status;

    /// Reset the selected device, releasing every allocation made on it.
    fn device_reset(&self) -> Status;

    /// Allocate `bytes` bytes of device memory.
    ///
    /// The `Err` arm never carries a success status.
    fn malloc(&self, bytes: usize) -> NativeResult<DevicePtr>;

    /// Release an allocation made by [`malloc`](DeviceRuntime::malloc).
    ///
    /// # Safety
    ///
    /// `ptr` must not be used again after this call, by anyone.
    unsafe fn free(&self, ptr: DevicePtr) -> Status;

    /// Copy host bytes to device memory.
    ///
    /// # Safety
    ///
    /// `dst` must address at least `src.len()` bytes of live device memory.
    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Status;

    /// Copy device memory to host bytes.
    ///
    /// # Safety
    ///
    /// `src` must address at least `dst.len()` bytes of live device memory.
    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Status;

    /// Copy `bytes` bytes between two device regions.
    ///
    /// # Safety
    ///
    /// Both addresses must cover `bytes` bytes of live device memory.
    unsafe fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Status;

    /// Launch a kernel.
    ///
    /// # Safety
    ///
    /// Every address in `args` must cover `args.len` elements of the kernel's
    /// element type.
    unsafe fn launch(&self, kernel: Kernel, args: &KernelArgs) -> Status;

    /// Block until all submitted device work has completed.
    fn synchronize(&self) -> Status;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_names_are_distinct() {
        let names: std::collections::HashSet<_> = Kernel::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), Kernel::ALL.len());
    }

    #[test]
    fn test_kernel_element_sizes() {
        for kernel in Kernel::ALL {
            assert!(kernel.element_size() == 4 || kernel.element_size() == 8);
        }
        assert_eq!(NULL_DEVICE_PTR, 0);
    }
}
