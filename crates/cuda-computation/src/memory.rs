//! GPU memory management.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::error::{check, ComputationResult, CudaError, OrFail, Result, Status};
use crate::runtime::{DevicePtr, DeviceRuntime, NULL_DEVICE_PTR};

/// Fixed-size numeric types that can live in device memory.
pub trait DeviceElement: bytemuck::Pod + Send + Sync + 'static {}

macro_rules! impl_device_element {
    ($($t:ty),* $(,)?) => {
        $(impl DeviceElement for $t {})*
    };
}

impl_device_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Fail unless `a` and `b` are the same runtime object.
pub(crate) fn validate_runtime(
    a: &Arc<dyn DeviceRuntime>,
    b: &Arc<dyn DeviceRuntime>,
    what: &str,
) -> Result<()> {
    // Compare data addresses only; vtable pointers may differ for one object.
    if Arc::as_ptr(a) as *const () != Arc::as_ptr(b) as *const () {
        return Err(CudaError::RuntimeMismatch(format!(
            "{what}: buffer belongs to another {} runtime",
            b.name()
        )));
    }
    Ok(())
}

fn validate_len(expected: usize, actual: usize, what: &str) -> Result<()> {
    if expected != actual {
        return Err(CudaError::DimensionMismatch(format!(
            "{what}: expected {expected} elements, got {actual}"
        )));
    }
    Ok(())
}

/// A buffer of `len` elements of `T` in device memory.
///
/// The buffer owns its allocation: it is allocated once on construction and
/// released once when dropped. It cannot be cloned. Use [`into_shared`] when
/// several owners need the same region; the release then happens when the
/// last owner goes away.
///
/// Copying the handle would release the allocation twice, so it does not
/// compile:
///
/// ```compile_fail
/// use cuda_computation::{DeviceBuffer, HostRuntime};
/// use std::sync::Arc;
///
/// let a = DeviceBuffer::<f32>::new(Arc::new(HostRuntime::new(1024)), 4).unwrap();
/// let b = a.clone();
/// ```
///
/// [`into_shared`]: DeviceBuffer::into_shared
pub struct DeviceBuffer<T: DeviceElement> {
    runtime: Arc<dyn DeviceRuntime>,
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<T>,
}

/// A device buffer with several owners.
pub type SharedDeviceBuffer<T> = Arc<DeviceBuffer<T>>;

impl<T: DeviceElement> DeviceBuffer<T> {
    /// Allocate an uninitialized buffer of `len` elements.
    ///
    /// # Errors
    ///
    /// * `CudaError::EmptyBuffer` - `len` is zero; nothing is allocated
    /// * `CudaError::Failed` with `MallocFailed` - the allocation failed or its
    ///   size overflows `usize`
    pub fn new(runtime: Arc<dyn DeviceRuntime>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CudaError::EmptyBuffer);
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| {
                Status::MEMORY_ALLOCATION.with_message(format!(
                    "{len} elements of {} bytes overflow the address space",
                    std::mem::size_of::<T>()
                ))
            })
            .or_fail(ComputationResult::MallocFailed)?;

        let ptr = runtime
            .malloc(bytes)
            .or_fail(ComputationResult::MallocFailed)?;
        log::debug!(
            "allocated {bytes} bytes at {ptr:#x} on {} runtime",
            runtime.name()
        );

        Ok(Self {
            runtime,
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_host(runtime: Arc<dyn DeviceRuntime>, data: &[T]) -> Result<Self> {
        let mut buffer = Self::new(runtime, data.len())?;
        buffer.copy_from_host(data)?;
        Ok(buffer)
    }

    /// Adopt an allocation made elsewhere.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `runtime.malloc` and hold at least `len` elements of `T`
    /// - nothing else may release `ptr`; the returned buffer releases it on drop
    /// - `ptr` may be null only if `len` is zero
    pub unsafe fn from_raw(runtime: Arc<dyn DeviceRuntime>, ptr: DevicePtr, len: usize) -> Self {
        Self {
            runtime,
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Give up ownership without releasing; the caller becomes responsible for
    /// freeing the returned address.
    pub fn into_raw(self) -> (DevicePtr, usize) {
        let buffer = ManuallyDrop::new(self);
        (buffer.ptr, buffer.len)
    }

    /// Move the allocation out, leaving this buffer null and empty.
    ///
    /// Dropping the emptied buffer releases nothing.
    pub fn take(&mut self) -> Self {
        let ptr = std::mem::replace(&mut self.ptr, NULL_DEVICE_PTR);
        let len = std::mem::take(&mut self.len);
        Self {
            runtime: Arc::clone(&self.runtime),
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Share the buffer between several owners.
    pub fn into_shared(self) -> SharedDeviceBuffer<T> {
        Arc::new(self)
    }

    /// Copy `data` from the host into the buffer.
    pub fn copy_from_host(&mut self, data: &[T]) -> Result<()> {
        validate_len(self.len, data.len(), "host to device copy")?;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: ptr holds len elements and data has exactly len elements.
        let status = unsafe {
            self.runtime
                .memcpy_htod(self.ptr, bytemuck::cast_slice(data))
        };
        check(status, ComputationResult::MemcpyFailed)
    }

    /// Copy the buffer into `out` on the host.
    pub fn copy_to_host(&self, out: &mut [T]) -> Result<()> {
        validate_len(self.len, out.len(), "device to host copy")?;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: ptr holds len elements and out has exactly len elements.
        let status = unsafe {
            self.runtime
                .memcpy_dtoh(bytemuck::cast_slice_mut(out), self.ptr)
        };
        check(status, ComputationResult::MemcpyFailed)
    }

    /// Copy the buffer back to a new host vector.
    pub fn to_host(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.copy_to_host(&mut out)?;
        Ok(out)
    }

    /// Copy another device buffer of the same length into this one.
    ///
    /// Both buffers must come from the same runtime. Copies of zero elements
    /// succeed without a native call.
    pub fn copy_from_device(&mut self, other: &DeviceBuffer<T>) -> Result<()> {
        validate_runtime(&self.runtime, &other.runtime, "device to device copy")?;
        validate_len(self.len, other.len, "device to device copy")?;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: both buffers live on this runtime and hold len elements.
        let status = unsafe {
            self.runtime
                .memcpy_dtod(self.ptr, other.ptr, self.size_in_bytes())
        };
        check(status, ComputationResult::MemcpyFailed)
    }

    /// Raw device address, for kernel launches.
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the allocation has been moved out with [`take`](Self::take).
    pub fn is_null(&self) -> bool {
        self.ptr == NULL_DEVICE_PTR
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// The runtime the buffer was allocated on.
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }
}

impl<T: DeviceElement> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if self.is_null() {
            return;
        }

        // SAFETY: the buffer owns ptr and nothing can use it after drop.
        let status = unsafe { self.runtime.free(self.ptr) };
        if status.is_success() {
            log::debug!("released {:#x} on {} runtime", self.ptr, self.runtime.name());
        } else {
            // Drop must not fail; the allocation may leak.
            log::warn!(
                "release of {:#x} ({} bytes) on {} runtime failed: {status}",
                self.ptr,
                self.size_in_bytes(),
                self.runtime.name()
            );
        }
    }
}

impl<T: DeviceElement> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("runtime", &self.runtime.name())
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .field("element", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostRuntime, Operation};

    fn host(capacity: usize) -> (Arc<HostRuntime>, Arc<dyn DeviceRuntime>) {
        let host = Arc::new(HostRuntime::new(capacity));
        let runtime: Arc<dyn DeviceRuntime> = host.clone();
        (host, runtime)
    }

    fn assert_exact_allocation<T: DeviceElement>(len: usize) {
        let (host, runtime) = host(1 << 20);
        let buffer = DeviceBuffer::<T>::new(runtime, len).unwrap();
        assert!(!buffer.is_null());
        assert_eq!(buffer.len(), len);
        assert_eq!(buffer.size_in_bytes(), len * std::mem::size_of::<T>());
        assert_eq!(
            host.allocation_size(buffer.device_ptr()),
            Some(len * std::mem::size_of::<T>())
        );
    }

    #[test]
    fn test_allocation_is_exact() {
        for len in [1, 1024] {
            assert_exact_allocation::<u8>(len);
            assert_exact_allocation::<f32>(len);
            assert_exact_allocation::<f64>(len);
        }
    }

    #[test]
    fn test_1024_f32_on_device_with_room() {
        let (host, runtime) = host(1 << 20);
        let buffer = DeviceBuffer::<f32>::new(runtime, 1024).unwrap();
        assert_ne!(buffer.device_ptr(), NULL_DEVICE_PTR);
        assert_eq!(host.bytes_in_use(), 4096);
    }

    #[test]
    fn test_allocation_beyond_device_memory() {
        let (host, runtime) = host(4096);
        let err = DeviceBuffer::<f32>::new(runtime, 1025).unwrap_err();
        assert_eq!(err.failure(), Some(ComputationResult::MallocFailed));
        assert_eq!(
            err.status().map(Status::code),
            Some(Status::MEMORY_ALLOCATION.code())
        );
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn test_allocation_size_overflow() {
        let (host, runtime) = host(4096);
        let err = DeviceBuffer::<u64>::new(runtime, usize::MAX).unwrap_err();
        assert_eq!(err.failure(), Some(ComputationResult::MallocFailed));
        assert_eq!(host.stats().allocations, 0);
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let (host, runtime) = host(4096);
        let err = DeviceBuffer::<f32>::new(runtime, 0).unwrap_err();
        assert!(matches!(err, CudaError::EmptyBuffer));
        assert_eq!(host.stats().allocations, 0);
    }

    #[test]
    fn test_injected_malloc_failure() {
        let (host, runtime) = host(4096);
        host.inject_fault(Operation::Malloc, Status::INVALID_VALUE);
        let err = DeviceBuffer::<i32>::new(runtime, 4).unwrap_err();
        assert_eq!(err.failure(), Some(ComputationResult::MallocFailed));
        assert_eq!(err.status(), Some(&Status::INVALID_VALUE));
    }

    #[test]
    fn test_drop_releases_once() {
        let (host, runtime) = host(4096);
        {
            let _buffer = DeviceBuffer::<f32>::new(runtime, 16).unwrap();
            assert_eq!(host.live_allocations(), 1);
        }
        assert_eq!(host.live_allocations(), 0);
        assert_eq!(host.stats().releases, 1);
        assert_eq!(host.stats().failed_releases, 0);
    }

    #[test]
    fn test_drop_swallows_release_failure() {
        let (host, runtime) = host(4096);
        let buffer = DeviceBuffer::<f32>::new(runtime, 16).unwrap();
        host.inject_fault(Operation::Free, Status::LAUNCH_FAILURE);
        drop(buffer);
        assert_eq!(host.stats().failed_releases, 1);
        assert_eq!(host.stats().releases, 0);
    }

    #[test]
    fn test_take_leaves_null_source() {
        let (host, runtime) = host(4096);
        let mut source = DeviceBuffer::<f32>::new(runtime, 8).unwrap();
        let ptr = source.device_ptr();

        let target = source.take();
        assert_eq!(target.device_ptr(), ptr);
        assert_eq!(target.len(), 8);
        assert!(source.is_null());
        assert!(source.is_empty());

        drop(source);
        assert_eq!(host.stats().releases, 0);
        assert_eq!(host.live_allocations(), 1);

        drop(target);
        assert_eq!(host.stats().releases, 1);
        assert_eq!(host.stats().failed_releases, 0);
    }

    #[test]
    fn test_shared_buffer_releases_once() {
        let (host, runtime) = host(4096);
        let shared = DeviceBuffer::<f64>::new(runtime, 8).unwrap().into_shared();
        let alias = Arc::clone(&shared);
        assert_eq!(alias.device_ptr(), shared.device_ptr());

        drop(shared);
        assert_eq!(host.live_allocations(), 1);
        drop(alias);
        assert_eq!(host.stats().releases, 1);
        assert_eq!(host.stats().failed_releases, 0);
    }

    #[test]
    fn test_raw_round_trip_keeps_allocation() {
        let (host, runtime) = host(4096);
        let buffer = DeviceBuffer::<u32>::new(Arc::clone(&runtime), 4).unwrap();
        let (ptr, len) = buffer.into_raw();
        assert_eq!(host.live_allocations(), 1);

        let adopted = unsafe { DeviceBuffer::<u32>::from_raw(runtime, ptr, len) };
        drop(adopted);
        assert_eq!(host.live_allocations(), 0);
        assert_eq!(host.stats().releases, 1);
    }

    #[test]
    fn test_host_copies() {
        let (_host, runtime) = host(4096);
        let data: Vec<i32> = (0..32).collect();
        let a = DeviceBuffer::from_host(Arc::clone(&runtime), &data).unwrap();
        assert_eq!(a.to_host().unwrap(), data);

        let mut b = DeviceBuffer::<i32>::new(runtime, 32).unwrap();
        b.copy_from_device(&a).unwrap();
        let mut out = vec![0; 32];
        b.copy_to_host(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_length_mismatch() {
        let (host, runtime) = host(4096);
        let mut buffer = DeviceBuffer::<f32>::new(Arc::clone(&runtime), 4).unwrap();
        let err = buffer.copy_from_host(&[1.0; 5]).unwrap_err();
        assert!(matches!(err, CudaError::DimensionMismatch(_)));

        let other = DeviceBuffer::<f32>::new(runtime, 3).unwrap();
        assert!(matches!(
            buffer.copy_from_device(&other),
            Err(CudaError::DimensionMismatch(_))
        ));
        let mut out = [0.0f32; 3];
        assert!(buffer.copy_to_host(&mut out).is_err());
        assert_eq!(host.live_allocations(), 2);
    }

    #[test]
    fn test_copy_failure_category() {
        let (host, runtime) = host(4096);
        let mut buffer = DeviceBuffer::<f32>::new(runtime, 4).unwrap();
        host.inject_fault(Operation::Memcpy, Status::ILLEGAL_ADDRESS);
        let err = buffer.copy_from_host(&[1.0; 4]).unwrap_err();
        assert_eq!(err.failure(), Some(ComputationResult::MemcpyFailed));
    }

    #[test]
    fn test_release_after_reset_is_swallowed() {
        let (host, runtime) = host(4096);
        let buffer = DeviceBuffer::<u8>::new(Arc::clone(&runtime), 64).unwrap();
        assert!(runtime.device_reset().is_success());
        drop(buffer);
        assert_eq!(host.stats().failed_releases, 1);
    }

    #[test]
    fn test_buffer_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceBuffer<f32>>();
        assert_send_sync::<SharedDeviceBuffer<u8>>();
    }

    #[test]
    fn test_copy_between_runtimes_is_rejected() {
        let (first, rt1) = host(4096);
        let (second, rt2) = host(4096);
        let a = DeviceBuffer::from_host(rt1, &[1u32, 2, 3, 4]).unwrap();
        let mut b = DeviceBuffer::<u32>::new(rt2, 4).unwrap();

        // Both runtimes hand out the same first address.
        assert_eq!(a.device_ptr(), b.device_ptr());

        second.inject_fault(Operation::Memcpy, Status::INVALID_VALUE);
        let err = b.copy_from_device(&a).unwrap_err();
        assert!(matches!(err, CudaError::RuntimeMismatch(_)), "{err}");
        assert_eq!(first.live_allocations(), 1);

        // No native copy was attempted: the injected fault is still pending.
        assert!(b.copy_from_host(&[0; 4]).is_err());
        assert_eq!(b.to_host().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_copy_on_same_runtime_through_distinct_handles() {
        let (_host, runtime) = host(4096);
        let a = DeviceBuffer::from_host(Arc::clone(&runtime), &[5u16, 6]).unwrap();
        let mut b = DeviceBuffer::<u16>::new(Arc::clone(&runtime), 2).unwrap();
        b.copy_from_device(&a).unwrap();
        assert_eq!(b.to_host().unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_zero_length_copies_skip_native_call() {
        let (host, runtime) = host(4096);
        let mut source = DeviceBuffer::<f32>::new(Arc::clone(&runtime), 4).unwrap();
        let mut moved = source.take();
        let mut empty = DeviceBuffer::<f32>::new(runtime, 2).unwrap();
        let _moved_empty = empty.take();

        host.inject_fault(Operation::Memcpy, Status::ILLEGAL_ADDRESS);
        assert_eq!(source.to_host().unwrap(), Vec::<f32>::new());
        source.copy_from_host(&[]).unwrap();
        source.copy_from_device(&empty).unwrap();

        // The fault is still pending for the first real copy.
        let err = moved.copy_from_host(&[1.0; 4]).unwrap_err();
        assert_eq!(err.failure(), Some(ComputationResult::MemcpyFailed));
    }

    #[test]
    fn test_debug_output() {
        let (_host, runtime) = host(4096);
        let buffer = DeviceBuffer::<f32>::new(runtime, 2).unwrap();
        let debug = format!("{buffer:?}");
        assert!(debug.contains("host"), "{debug}");
        assert!(debug.contains("len: 2"), "{debug}");
    }
}
