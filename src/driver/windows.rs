// WinDivert capture backend.
//
// WinDivert.dll is loaded at runtime and its entry points resolved by name,
// so the crate builds without the WinDivert SDK and fails cleanly at open
// time when the DLL (or the WinDivert64.sys driver next to it) is missing.
//
// Requires Administrator privileges to open a handle.

use std::collections::HashMap;
use std::ffi::{CString, c_char, c_void};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use windows_sys::Win32::Foundation::{
    FreeLibrary, GetLastError, HANDLE, HMODULE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use super::{
    CaptureDriver, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_PARAMETER, NativeError, NativeHandle,
};
use crate::config::{Layer, OpenFlags, Param};
use crate::error::{DivertError, Result};
use crate::header;
use crate::metadata::{Direction, Metadata};

// ---------------------------------------------------------------------------
// WINDIVERT_ADDRESS
// ---------------------------------------------------------------------------

const ADDR_OUTBOUND: u32 = 1 << 17;
const ADDR_LOOPBACK: u32 = 1 << 18;
const ADDR_IMPOSTOR: u32 = 1 << 19;
const ADDR_IPV6: u32 = 1 << 20;
const ADDR_IP_CHECKSUM: u32 = 1 << 21;
const ADDR_TCP_CHECKSUM: u32 = 1 << 22;
const ADDR_UDP_CHECKSUM: u32 = 1 << 23;

const WINDIVERT_SHUTDOWN_BOTH: u32 = 0x3;

/// Native address record: timestamp, packed flag bits, and a 64-byte union
/// whose network-layer variant starts with the interface index pair.
#[repr(C)]
#[derive(Clone, Copy)]
struct WinDivertAddress {
    timestamp: i64,
    bits: u32,
    reserved2: u32,
    data: [u32; 16],
}

const _: () = assert!(std::mem::size_of::<WinDivertAddress>() == 80);

impl WinDivertAddress {
    fn zeroed() -> Self {
        Self {
            timestamp: 0,
            bits: 0,
            reserved2: 0,
            data: [0; 16],
        }
    }

    fn to_metadata(self, packet: &[u8]) -> Metadata {
        let direction = if self.bits & ADDR_OUTBOUND != 0 {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        Metadata::new(direction)
            .with_interface(self.data[0], self.data[1])
            .with_loopback(self.bits & ADDR_LOOPBACK != 0)
            .with_impostor(self.bits & ADDR_IMPOSTOR != 0)
            .with_fragment(header::is_fragment(packet))
    }

    fn from_metadata(meta: &Metadata, layer: Layer, packet: &[u8]) -> Self {
        let mut addr = Self::zeroed();
        // Checksums are the caller's job; mark them valid so the stack keeps them.
        addr.bits = (layer.as_raw() as u32 & 0xFF)
            | ADDR_IP_CHECKSUM
            | ADDR_TCP_CHECKSUM
            | ADDR_UDP_CHECKSUM;
        if meta.is_outbound() {
            addr.bits |= ADDR_OUTBOUND;
        }
        if meta.is_loopback() {
            addr.bits |= ADDR_LOOPBACK;
        }
        if meta.is_impostor() {
            addr.bits |= ADDR_IMPOSTOR;
        }
        if packet.first().is_some_and(|b| b >> 4 == 6) {
            addr.bits |= ADDR_IPV6;
        }
        addr.data[0] = meta.if_idx();
        addr.data[1] = meta.sub_if_idx();
        addr
    }
}

// ---------------------------------------------------------------------------
// DLL entry points
// ---------------------------------------------------------------------------

type OpenFn = unsafe extern "C" fn(*const c_char, i32, i16, u64) -> HANDLE;
type RecvFn = unsafe extern "C" fn(HANDLE, *mut c_void, u32, *mut u32, *mut WinDivertAddress) -> i32;
type SendFn =
    unsafe extern "C" fn(HANDLE, *const c_void, u32, *mut u32, *const WinDivertAddress) -> i32;
type ShutdownFn = unsafe extern "C" fn(HANDLE, u32) -> i32;
type CloseFn = unsafe extern "C" fn(HANDLE) -> i32;
type GetParamFn = unsafe extern "C" fn(HANDLE, u32, *mut u64) -> i32;
type SetParamFn = unsafe extern "C" fn(HANDLE, u32, u64) -> i32;

struct Api {
    open: OpenFn,
    recv: RecvFn,
    send: SendFn,
    shutdown: ShutdownFn,
    close: CloseFn,
    get_param: GetParamFn,
    set_param: SetParamFn,
}

/// Resolve `name` in `module` as a function of type `F`.
///
/// # Safety
/// `F` must be the exact function pointer type of the exported symbol.
unsafe fn resolve<F: Copy>(module: HMODULE, name: &'static str) -> Result<F> {
    let cname = format!("{name}\0");
    let proc = unsafe { GetProcAddress(module, cname.as_ptr()) };
    match proc {
        Some(f) => Ok(unsafe { std::mem::transmute_copy::<_, F>(&f) }),
        None => Err(DivertError::Resource {
            op: "load",
            code: unsafe { GetLastError() },
            message: format!("WinDivert.dll does not export {name}"),
        }),
    }
}

/// # Safety
/// `module` must be a loaded WinDivert 2.x DLL.
unsafe fn resolve_api(module: HMODULE) -> Result<Api> {
    unsafe {
        Ok(Api {
            open: resolve(module, "WinDivertOpen")?,
            recv: resolve(module, "WinDivertRecv")?,
            send: resolve(module, "WinDivertSend")?,
            shutdown: resolve(module, "WinDivertShutdown")?,
            close: resolve(module, "WinDivertClose")?,
            get_param: resolve(module, "WinDivertGetParam")?,
            set_param: resolve(module, "WinDivertSetParam")?,
        })
    }
}

fn last_error() -> NativeError {
    NativeError::from_code(unsafe { GetLastError() })
}

fn to_handle(handle: NativeHandle) -> HANDLE {
    handle.0 as HANDLE
}

// ---------------------------------------------------------------------------
// WinDivertDriver
// ---------------------------------------------------------------------------

/// Capture backend backed by the WinDivert kernel driver.
pub struct WinDivertDriver {
    module: HMODULE,
    api: Api,
    layers: Mutex<HashMap<usize, Layer>>,
}

// SAFETY: `HMODULE` is a process-wide module base address that is only
// passed to `FreeLibrary` on drop. The WinDivert entry points are
// documented as thread-safe for concurrent recv/send on one handle.
unsafe impl Send for WinDivertDriver {}
unsafe impl Sync for WinDivertDriver {}

impl WinDivertDriver {
    /// Load WinDivert.dll from the default DLL search path.
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("WinDivert.dll"))
    }

    /// Load the WinDivert DLL at `path` and resolve its entry points.
    pub fn load(path: &Path) -> Result<Self> {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let module = unsafe { LoadLibraryW(wide.as_ptr()) };
        if module.is_null() {
            let err = last_error();
            return Err(DivertError::Resource {
                op: "load",
                code: err.code,
                message: format!("cannot load {}: {}", path.display(), err.message),
            });
        }

        // SAFETY: each type alias matches the WinDivert 2.x prototype.
        let api = match unsafe { resolve_api(module) } {
            Ok(api) => api,
            Err(e) => {
                unsafe { FreeLibrary(module) };
                return Err(e);
            }
        };

        log::info!("Loaded WinDivert from {}", path.display());
        Ok(Self {
            module,
            api,
            layers: Mutex::new(HashMap::new()),
        })
    }

    fn layer_of(&self, handle: NativeHandle) -> Layer {
        self.layers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.0)
            .copied()
            .unwrap_or_default()
    }
}

impl Drop for WinDivertDriver {
    fn drop(&mut self) {
        unsafe { FreeLibrary(self.module) };
    }
}

impl CaptureDriver for WinDivertDriver {
    fn name(&self) -> &str {
        "windivert"
    }

    fn open(
        &self,
        filter: &str,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> std::result::Result<NativeHandle, NativeError> {
        let filter = CString::new(filter)
            .map_err(|_| NativeError::new(ERROR_INVALID_PARAMETER, "filter contains a NUL byte"))?;
        let handle =
            unsafe { (self.api.open)(filter.as_ptr(), layer.as_raw(), priority, flags.bits()) };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }
        let handle = NativeHandle(handle as usize);
        self.layers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.0, layer);
        Ok(handle)
    }

    fn shutdown(&self, handle: NativeHandle) -> std::result::Result<(), NativeError> {
        if unsafe { (self.api.shutdown)(to_handle(handle), WINDIVERT_SHUTDOWN_BOTH) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn close(&self, handle: NativeHandle) -> std::result::Result<(), NativeError> {
        self.layers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if unsafe { (self.api.close)(to_handle(handle)) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn recv(
        &self,
        handle: NativeHandle,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, Metadata), NativeError> {
        let mut addr = WinDivertAddress::zeroed();
        let mut recv_len: u32 = 0;
        let ok = unsafe {
            (self.api.recv)(
                to_handle(handle),
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as u32,
                &mut recv_len,
                &mut addr,
            )
        };
        if ok == 0 {
            let err = last_error();
            // Oversized packets are delivered truncated to the buffer.
            if !(err.code == ERROR_INSUFFICIENT_BUFFER && recv_len > 0) {
                return Err(err);
            }
            log::debug!("WinDivertRecv truncated packet to {recv_len} bytes");
        }
        let n = (recv_len as usize).min(buf.len());
        Ok((n, addr.to_metadata(&buf[..n])))
    }

    fn send(
        &self,
        handle: NativeHandle,
        packet: &[u8],
        meta: &Metadata,
    ) -> std::result::Result<usize, NativeError> {
        let addr = WinDivertAddress::from_metadata(meta, self.layer_of(handle), packet);
        let mut send_len: u32 = 0;
        let ok = unsafe {
            (self.api.send)(
                to_handle(handle),
                packet.as_ptr() as *const c_void,
                packet.len() as u32,
                &mut send_len,
                &addr,
            )
        };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(send_len as usize)
    }

    fn get_param(&self, handle: NativeHandle, param: Param) -> std::result::Result<u64, NativeError> {
        let mut value: u64 = 0;
        if unsafe { (self.api.get_param)(to_handle(handle), param.as_raw(), &mut value) } == 0 {
            return Err(last_error());
        }
        Ok(value)
    }

    fn set_param(
        &self,
        handle: NativeHandle,
        param: Param,
        value: u64,
    ) -> std::result::Result<(), NativeError> {
        if unsafe { (self.api.set_param)(to_handle(handle), param.as_raw(), value) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }
}
