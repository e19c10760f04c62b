//! Device runtime over the CUDA driver API.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cudarc::driver::{result, CudaDevice, DriverError, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;

use crate::error::{NativeResult, Status};
use crate::runtime::{DevicePtr, DeviceRuntime, Kernel, KernelArgs};

/// CUDA kernel source code.
const KERNEL_SOURCE: &str = include_str!("../kernels/vector_arithmetic.cu");

const MODULE_NAME: &str = "vector_arithmetic";

/// Kernel function names.
const KERNEL_NAMES: &[&str] = &[
    "single_precision_vector_addition",
    "double_precision_vector_addition",
];

/// CUDA_ERROR_INVALID_PTX
const INVALID_PTX: i32 = 218;
/// CUDA_ERROR_NOT_FOUND
const NOT_FOUND: i32 = 500;

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        Status::new(err.0 as i32, err.to_string())
    }
}

#[derive(Default)]
struct DriverState {
    /// Current device ordinal; survives a reset.
    ordinal: usize,
    device: Option<Arc<CudaDevice>>,
    kernels_loaded: bool,
}

/// A [`DeviceRuntime`] backed by the CUDA driver.
///
/// Selecting a device retains its primary context. Calls made before any
/// selection target device 0, matching the CUDA runtime's implicit choice.
/// A reset releases the context but keeps the selection; the next call
/// retains a fresh context on the same device.
/// Kernels are compiled with NVRTC on the first launch after a selection.
#[derive(Default)]
pub struct DriverRuntime {
    state: Mutex<DriverState>,
}

impl DriverRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CUDA devices visible to the driver.
    pub fn device_count() -> NativeResult<usize> {
        result::init()?;
        let count = result::device::get_count()?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Ordinal of the device calls currently target.
    pub fn selected_device(&self) -> usize {
        self.state().ordinal
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The selected device, bound to the calling thread.
    fn bound(&self, state: &mut DriverState) -> NativeResult<Arc<CudaDevice>> {
        let device = match &state.device {
            Some(device) => Arc::clone(device),
            None => {
                let device = CudaDevice::new(state.ordinal)?;
                state.device = Some(Arc::clone(&device));
                state.kernels_loaded = false;
                device
            }
        };
        device.bind_to_thread()?;
        Ok(device)
    }

    fn load_kernels(device: &Arc<CudaDevice>) -> NativeResult<()> {
        let ptx = compile_ptx(KERNEL_SOURCE).map_err(|err| {
            Status::new(INVALID_PTX, format!("NVRTC compilation failed: {err}"))
        })?;
        device.load_ptx(ptx, MODULE_NAME, KERNEL_NAMES)?;
        Ok(())
    }

    fn run(&self, op: impl FnOnce(&Arc<CudaDevice>) -> NativeResult<()>) -> Status {
        let mut state = self.state();
        match self.bound(&mut state).and_then(|device| op(&device)) {
            Ok(()) => Status::SUCCESS,
            Err(status) => status,
        }
    }
}

impl DeviceRuntime for DriverRuntime {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn set_device(&self, ordinal: usize) -> Status {
        let mut state = self.state();
        match CudaDevice::new(ordinal) {
            Ok(device) => {
                state.ordinal = ordinal;
                state.device = Some(device);
                state.kernels_loaded = false;
                Status::SUCCESS
            }
            Err(err) => err.into(),
        }
    }

    fn device_reset(&self) -> Status {
        let mut state = self.state();
        let Some(device) = state.device.take() else {
            return Status::SUCCESS;
        };
        state.kernels_loaded = false;
        // Dropping the last handle releases the primary context.
        match device.synchronize() {
            Ok(()) => Status::SUCCESS,
            Err(err) => err.into(),
        }
    }

    fn malloc(&self, bytes: usize) -> NativeResult<DevicePtr> {
        let mut state = self.state();
        self.bound(&mut state)?;
        // SAFETY: a context is bound to this thread.
        Ok(unsafe { result::malloc_sync(bytes) }?)
    }

    unsafe fn free(&self, ptr: DevicePtr) -> Status {
        self.run(|_| Ok(result::free_sync(ptr)?))
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Status {
        self.run(|_| Ok(result::memcpy_htod_sync(dst, src)?))
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Status {
        self.run(|_| Ok(result::memcpy_dtoh_sync(dst, src)?))
    }

    unsafe fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Status {
        self.run(|_| Ok(result::memcpy_dtod_sync(dst, src, bytes)?))
    }

    unsafe fn launch(&self, kernel: Kernel, args: &KernelArgs) -> Status {
        let Ok(n) = u32::try_from(args.len) else {
            return Status::INVALID_VALUE
                .with_message(format!("{} elements exceed one launch", args.len));
        };

        let mut state = self.state();
        let device = match self.bound(&mut state) {
            Ok(device) => device,
            Err(status) => return status,
        };
        if !state.kernels_loaded {
            if let Err(status) = Self::load_kernels(&device) {
                return status;
            }
            state.kernels_loaded = true;
        }

        let Some(func) = device.get_func(MODULE_NAME, kernel.name()) else {
            return Status::new(NOT_FOUND, format!("kernel {} not found", kernel.name()));
        };
        let cfg = LaunchConfig::for_num_elems(n);
        let params = (args.left, args.right, args.out, args.len as u64);
        match func.launch(cfg, params) {
            Ok(()) => Status::SUCCESS,
            Err(err) => err.into(),
        }
    }

    fn synchronize(&self) -> Status {
        self.run(|device| Ok(device.synchronize()?))
    }
}
