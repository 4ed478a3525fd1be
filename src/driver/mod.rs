// Capture backends.
//
// A backend is the native primitive a Session drives: open a filtered
// handle, receive and reinject packets on it, tune its queue, close it.
//
// Exports:
//   - CaptureDriver trait, NativeHandle, NativeError
//   - MemoryDriver (every platform)
//   - WinDivertDriver (Windows only)

use std::fmt;

use crate::config::{Layer, OpenFlags, Param};
use crate::metadata::Metadata;

mod memory;
pub use memory::{MemoryDriver, SENT_LOG_LEN};

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WinDivertDriver;

/// Driver error codes (Win32 numbering, shared by every backend).
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = crate::error::ERROR_INVALID_HANDLE;
pub const ERROR_INVALID_PARAMETER: u32 = crate::error::ERROR_INVALID_PARAMETER;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_ALREADY_EXISTS: u32 = 183;
pub const ERROR_NO_DATA: u32 = 232;
pub const ERROR_INVALID_IMAGE_HASH: u32 = 577;
pub const ERROR_DRIVER_FAILED_PRIOR_UNLOAD: u32 = 654;
pub const ERROR_OPERATION_ABORTED: u32 = 995;
pub const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;
pub const ERROR_HOST_UNREACHABLE: u32 = 1232;
pub const ERROR_DRIVER_BLOCKED: u32 = 1275;

/// Opaque handle value issued by a backend's `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub usize);

/// Failure reported by a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub code: u32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error carrying the standard description of `code`.
    pub fn from_code(code: u32) -> Self {
        Self::new(code, describe_native_error(code))
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error {})", self.message, self.code)
    }
}

/// Readable text for the error codes the capture driver documents.
pub fn describe_native_error(code: u32) -> &'static str {
    match code {
        ERROR_FILE_NOT_FOUND => "the driver files could not be found",
        ERROR_ACCESS_DENIED => "access denied; Administrator rights are required",
        ERROR_INVALID_HANDLE => "invalid or closed handle",
        ERROR_INVALID_PARAMETER => "invalid filter, priority, flags or parameter",
        ERROR_INSUFFICIENT_BUFFER => "packet larger than the receive buffer",
        ERROR_ALREADY_EXISTS => "handle is already open",
        ERROR_NO_DATA => "handle has been shut down and the queue is empty",
        ERROR_INVALID_IMAGE_HASH => "driver signature could not be verified",
        ERROR_DRIVER_FAILED_PRIOR_UNLOAD => "an incompatible driver version is loaded",
        ERROR_OPERATION_ABORTED => "operation aborted because the handle was closed",
        ERROR_SERVICE_DOES_NOT_EXIST => "driver service is not installed",
        ERROR_HOST_UNREACHABLE => "injected packet would loop back to its own handle",
        ERROR_DRIVER_BLOCKED => "driver blocked by security software",
        _ => "unknown driver error",
    }
}

/// The native capture primitive behind a Session.
///
/// Implementations must allow one blocking `recv` to run concurrently with
/// `send`, `get_param`, `set_param` and `shutdown` on the same handle.
/// `shutdown` must make any pending `recv` on that handle return an error.
/// Callers never run `close` while another call on the handle is in flight.
pub trait CaptureDriver: Send + Sync {
    /// Short backend name used in log lines.
    fn name(&self) -> &str;

    fn open(
        &self,
        filter: &str,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<NativeHandle, NativeError>;

    /// Stop queueing and sending on `handle` and wake any blocked `recv`.
    /// The handle stays valid until `close`.
    fn shutdown(&self, handle: NativeHandle) -> Result<(), NativeError>;

    fn close(&self, handle: NativeHandle) -> Result<(), NativeError>;

    /// Block until a packet is available and copy at most `buf.len()` bytes
    /// of it into `buf`. Returns the number of bytes written.
    fn recv(&self, handle: NativeHandle, buf: &mut [u8]) -> Result<(usize, Metadata), NativeError>;

    /// Inject `packet` routed according to `meta`. Returns bytes injected.
    fn send(&self, handle: NativeHandle, packet: &[u8], meta: &Metadata)
    -> Result<usize, NativeError>;

    fn get_param(&self, handle: NativeHandle, param: Param) -> Result<u64, NativeError>;

    fn set_param(&self, handle: NativeHandle, param: Param, value: u64) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_code_uses_description() {
        let err = NativeError::from_code(ERROR_ACCESS_DENIED);
        assert_eq!(err.code, 5);
        assert!(err.message.contains("Administrator"));
        assert_eq!(
            err.to_string(),
            "access denied; Administrator rights are required (error 5)"
        );
    }

    #[test]
    fn unknown_codes_have_fallback_text() {
        assert_eq!(describe_native_error(424242), "unknown driver error");
        assert_ne!(describe_native_error(ERROR_DRIVER_BLOCKED), "unknown driver error");
    }

    #[test]
    fn driver_is_object_safe() {
        let driver: Box<dyn CaptureDriver> = Box::new(MemoryDriver::new());
        assert_eq!(driver.name(), "memory");
    }
}
