//! A software device that runs in host memory.
//!
//! `HostRuntime` implements [`DeviceRuntime`] without a GPU. It hands out
//! aligned fake device addresses backed by host allocations, enforces a memory
//! budget, executes the vector kernels on the CPU and keeps release accounting.
//! One-shot fault injection makes every native failure path reachable.

use std::collections::{BTreeMap, HashMap};
use std::ops::Add;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytemuck::Pod;

use crate::error::{NativeResult, Status};
use crate::runtime::{DevicePtr, DeviceRuntime, Kernel, KernelArgs, NULL_DEVICE_PTR};

/// Default memory budget of a host device (1 GiB).
pub const DEFAULT_HOST_MEMORY: usize = 1 << 30;

const BASE_ADDRESS: DevicePtr = 0x7f00_0000_0000;
const ALIGNMENT: DevicePtr = 256;

/// A native call that can be made to fail with [`HostRuntime::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SetDevice,
    DeviceReset,
    Malloc,
    Free,
    Memcpy,
    Launch,
    Synchronize,
}

/// Counters kept by a [`HostRuntime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub allocations: usize,
    pub releases: usize,
    pub failed_releases: usize,
    pub launches: usize,
}

struct HostState {
    selected: usize,
    regions: BTreeMap<DevicePtr, Vec<u8>>,
    in_use: usize,
    next_address: DevicePtr,
    faults: HashMap<Operation, Status>,
    stats: HostStats,
}

impl HostState {
    fn new() -> Self {
        Self {
            selected: 0,
            regions: BTreeMap::new(),
            in_use: 0,
            next_address: BASE_ADDRESS,
            faults: HashMap::new(),
            stats: HostStats::default(),
        }
    }

    /// Locate `bytes` bytes at `ptr` inside one live region.
    fn locate(&self, ptr: DevicePtr, bytes: usize) -> Option<(DevicePtr, usize)> {
        let (&base, data) = self.regions.range(..=ptr).next_back()?;
        let offset = usize::try_from(ptr - base).ok()?;
        let end = offset.checked_add(bytes)?;
        (end <= data.len()).then_some((base, offset))
    }

    fn read(&self, ptr: DevicePtr, bytes: usize) -> Option<&[u8]> {
        let (base, offset) = self.locate(ptr, bytes)?;
        self.regions.get(&base).map(|data| &data[offset..offset + bytes])
    }

    fn write(&mut self, ptr: DevicePtr, bytes: usize) -> Option<&mut [u8]> {
        let (base, offset) = self.locate(ptr, bytes)?;
        self.regions
            .get_mut(&base)
            .map(|data| &mut data[offset..offset + bytes])
    }
}

/// A [`DeviceRuntime`] backed by host memory.
pub struct HostRuntime {
    device_count: usize,
    capacity: usize,
    state: Mutex<HostState>,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_MEMORY)
    }
}

impl HostRuntime {
    /// One host device with `capacity` bytes of memory.
    pub fn new(capacity: usize) -> Self {
        Self::with_devices(1, capacity)
    }

    /// `device_count` host devices, each with `capacity` bytes of memory.
    ///
    /// All devices share one address space; selection only changes which
    /// ordinal is reported as current.
    pub fn with_devices(device_count: usize, capacity: usize) -> Self {
        Self {
            device_count,
            capacity,
            state: Mutex::new(HostState::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `operation` report `status`.
    ///
    /// Faults are one-shot: the call after the failing one behaves normally.
    pub fn inject_fault(&self, operation: Operation, status: Status) {
        debug_assert!(!status.is_success(), "injected faults must not succeed");
        self.state().faults.insert(operation, status);
    }

    pub fn stats(&self) -> HostStats {
        self.state().stats
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn selected_device(&self) -> usize {
        self.state().selected
    }

    /// Bytes currently allocated.
    pub fn bytes_in_use(&self) -> usize {
        self.state().in_use
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state().regions.len()
    }

    /// Size of the live allocation starting at `ptr`.
    pub fn allocation_size(&self, ptr: DevicePtr) -> Option<usize> {
        self.state().regions.get(&ptr).map(Vec::len)
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn set_device(&self, ordinal: usize) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::SetDevice) {
            return status;
        }
        if self.device_count == 0 {
            return Status::NO_DEVICE;
        }
        if ordinal >= self.device_count {
            return Status::INVALID_DEVICE.with_message(format!(
                "invalid device ordinal {ordinal}, {} device(s) present",
                self.device_count
            ));
        }
        state.selected = ordinal;
        Status::SUCCESS
    }

    fn device_reset(&self) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::DeviceReset) {
            return status;
        }
        state.regions.clear();
        state.in_use = 0;
        Status::SUCCESS
    }

    fn malloc(&self, bytes: usize) -> NativeResult<DevicePtr> {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Malloc) {
            return Err(status);
        }
        if bytes == 0 {
            return Ok(NULL_DEVICE_PTR);
        }
        let available = self.capacity - state.in_use;
        if bytes > available {
            return Err(Status::MEMORY_ALLOCATION.with_message(format!(
                "out of memory: requested {bytes} bytes, {available} of {} available",
                self.capacity
            )));
        }

        let ptr = state.next_address;
        let span = (bytes as DevicePtr).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.regions.insert(ptr, vec![0; bytes]);
        state.in_use += bytes;
        state.stats.allocations += 1;
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: DevicePtr) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Free) {
            state.stats.failed_releases += 1;
            return status;
        }
        if ptr == NULL_DEVICE_PTR {
            return Status::SUCCESS;
        }
        match state.regions.remove(&ptr) {
            Some(data) => {
                state.in_use -= data.len();
                state.stats.releases += 1;
                Status::SUCCESS
            }
            None => {
                state.stats.failed_releases += 1;
                Status::INVALID_DEVICE_POINTER
            }
        }
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Memcpy) {
            return status;
        }
        match state.write(dst, src.len()) {
            Some(region) => {
                region.copy_from_slice(src);
                Status::SUCCESS
            }
            None => Status::INVALID_VALUE,
        }
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Memcpy) {
            return status;
        }
        match state.read(src, dst.len()) {
            Some(region) => {
                dst.copy_from_slice(region);
                Status::SUCCESS
            }
            None => Status::INVALID_VALUE,
        }
    }

    unsafe fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Memcpy) {
            return status;
        }
        let Some(source) = state.read(src, bytes).map(<[u8]>::to_vec) else {
            return Status::INVALID_VALUE;
        };
        match state.write(dst, bytes) {
            Some(region) => {
                region.copy_from_slice(&source);
                Status::SUCCESS
            }
            None => Status::INVALID_VALUE,
        }
    }

    unsafe fn launch(&self, kernel: Kernel, args: &KernelArgs) -> Status {
        let mut state = self.state();
        if let Some(status) = state.faults.remove(&Operation::Launch) {
            return status;
        }
        let Some(bytes) = args.len.checked_mul(kernel.element_size()) else {
            return Status::INVALID_VALUE;
        };
        let (Some(left), Some(right)) = (
            state.read(args.left, bytes).map(<[u8]>::to_vec),
            state.read(args.right, bytes).map(<[u8]>::to_vec),
        ) else {
            return Status::ILLEGAL_ADDRESS;
        };
        let Some(out) = state.write(args.out, bytes) else {
            return Status::ILLEGAL_ADDRESS;
        };

        match kernel {
            Kernel::VectorAddF32 => add_elements::<f32>(&left, &right, out),
            Kernel::VectorAddF64 => add_elements::<f64>(&left, &right, out),
        }
        state.stats.launches += 1;
        Status::SUCCESS
    }

    fn synchronize(&self) -> Status {
        self.state()
            .faults
            .remove(&Operation::Synchronize)
            .unwrap_or(Status::SUCCESS)
    }
}

fn add_elements<T: Pod + Add<Output = T>>(left: &[u8], right: &[u8], out: &mut [u8]) {
    let size = std::mem::size_of::<T>();
    let pairs = left.chunks_exact(size).zip(right.chunks_exact(size));
    for ((l, r), o) in pairs.zip(out.chunks_exact_mut(size)) {
        let sum = bytemuck::pod_read_unaligned::<T>(l) + bytemuck::pod_read_unaligned::<T>(r);
        o.copy_from_slice(bytemuck::bytes_of(&sum));
    }
}
