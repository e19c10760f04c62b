//! Error types for CUDA operations.
//!
//! Every native call goes through [`check`] (or [`OrFail::or_fail`] when the
//! call also produces a value). The category attached to a failure names the
//! call site that failed; it is never derived from the native status.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// Result categories of a GPU computation.
///
/// The discriminants are the values exchanged over the native ABI.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationResult {
    Succeeded = 0,
    SetDeviceFailed = 1,
    DeviceResetFailed = 2,
    MallocFailed = 3,
    MemcpyFailed = 4,
    KernelFailed = 5,
    DeviceSynchronizeFailed = 6,
}

impl ComputationResult {
    /// All categories, in discriminant order.
    pub const ALL: [ComputationResult; 7] = [
        ComputationResult::Succeeded,
        ComputationResult::SetDeviceFailed,
        ComputationResult::DeviceResetFailed,
        ComputationResult::MallocFailed,
        ComputationResult::MemcpyFailed,
        ComputationResult::KernelFailed,
        ComputationResult::DeviceSynchronizeFailed,
    ];

    pub fn is_success(self) -> bool {
        self == ComputationResult::Succeeded
    }

    /// Turn a category reported across the native ABI into a `Result`.
    ///
    /// Used where a precompiled routine returns only the category, with no
    /// native status attached.
    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(CudaError::Reported(self))
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ComputationResult::Succeeded => "succeeded",
            ComputationResult::SetDeviceFailed => "device selection failed",
            ComputationResult::DeviceResetFailed => "device reset failed",
            ComputationResult::MallocFailed => "device allocation failed",
            ComputationResult::MemcpyFailed => "memory copy failed",
            ComputationResult::KernelFailed => "kernel launch failed",
            ComputationResult::DeviceSynchronizeFailed => "device synchronization failed",
        }
    }
}

impl fmt::Display for ComputationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl From<ComputationResult> for u8 {
    fn from(result: ComputationResult) -> Self {
        result as u8
    }
}

impl TryFrom<u8> for ComputationResult {
    type Error = CudaError;

    fn try_from(code: u8) -> Result<Self> {
        ComputationResult::ALL
            .get(usize::from(code))
            .copied()
            .ok_or(CudaError::UnknownResult(code))
    }
}

/// Status reported by a native device-runtime call.
///
/// Carries the numeric code together with its rendering, so a failure can be
/// diagnosed without access to the runtime that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: i32,
    message: Cow<'static, str>,
}

impl Status {
    pub const SUCCESS: Status = Status::from_static(0, "no error");
    pub const INVALID_VALUE: Status = Status::from_static(1, "invalid argument");
    pub const MEMORY_ALLOCATION: Status = Status::from_static(2, "out of memory");
    pub const INVALID_DEVICE_POINTER: Status = Status::from_static(17, "invalid device pointer");
    pub const NO_DEVICE: Status = Status::from_static(100, "no CUDA-capable device is detected");
    pub const INVALID_DEVICE: Status = Status::from_static(101, "invalid device ordinal");
    pub const ILLEGAL_ADDRESS: Status =
        Status::from_static(700, "an illegal memory access was encountered");
    pub const LAUNCH_FAILURE: Status = Status::from_static(719, "unspecified launch failure");

    pub const fn from_static(code: i32, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
        }
    }

    pub fn new(code: i32, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Same code, more specific rendering.
    pub fn with_message(&self, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(self.code, message)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Outcome of a native call that produces a value.
pub type NativeResult<T> = std::result::Result<T, Status>;

/// Errors that can occur during CUDA operations.
#[derive(Debug, Error)]
pub enum CudaError {
    /// A native call reported a non-success status.
    #[error("CUDA computation failed on {failure}: {status}")]
    Failed {
        failure: ComputationResult,
        status: Status,
    },

    /// A precompiled routine reported a failure category without a status.
    #[error("CUDA computation failed on {0}")]
    Reported(ComputationResult),

    /// A result code outside the known categories.
    #[error("Unknown computation result code: {0}")]
    UnknownResult(u8),

    /// Device buffers must hold at least one element.
    #[error("Device buffers must hold at least one element")]
    EmptyBuffer,

    /// Dimension mismatch.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Buffers passed to one operation were allocated on different runtimes.
    #[error("Runtime mismatch: {0}")]
    RuntimeMismatch(String),

    /// Invalid runtime configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CudaError {
    /// The failure category, for errors raised by a native call site.
    pub fn failure(&self) -> Option<ComputationResult> {
        match self {
            CudaError::Failed { failure, .. } | CudaError::Reported(failure) => Some(*failure),
            _ => None,
        }
    }

    /// The native status, when one was reported.
    pub fn status(&self) -> Option<&Status> {
        match self {
            CudaError::Failed { status, .. } => Some(status),
            _ => None,
        }
    }
}

/// Result type for CUDA operations.
pub type Result<T> = std::result::Result<T, CudaError>;

/// Check a native status, failing with `failure` on anything but success.
pub fn check(status: Status, failure: ComputationResult) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    log::debug!("{failure}: {status}");
    Err(CudaError::Failed { failure, status })
}

/// [`check`] for native calls that also return a value.
pub trait OrFail<T> {
    fn or_fail(self, failure: ComputationResult) -> Result<T>;
}

impl<T> OrFail<T> for NativeResult<T> {
    fn or_fail(self, failure: ComputationResult) -> Result<T> {
        self.map_err(|status| {
            log::debug!("{failure}: {status}");
            CudaError::Failed { failure, status }
        })
    }
}
