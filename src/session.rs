// Session: one filtered capture handle on a backend, with an explicit
// closed -> open -> closed lifecycle.
//
// All methods take `&self` so a Session can be shared (e.g. behind an
// `Arc`) between a thread blocked in `receive` and one that sends or
// closes. Every backend call runs under the state read lock, so the handle
// it uses cannot be released underneath it. `close` shuts the handle down
// first, which wakes a pending receive, then takes the write lock before
// the native close.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{Param, SessionConfig};
use crate::driver::{CaptureDriver, ERROR_ALREADY_EXISTS, NativeError, NativeHandle};
use crate::error::{DivertError, Result};
use crate::metadata::Metadata;
use crate::packet::Packet;

/// Largest packet a single receive returns; longer packets are truncated.
pub const PACKET_BUFFER_SIZE: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open(NativeHandle),
}

pub struct Session {
    driver: Arc<dyn CaptureDriver>,
    config: SessionConfig,
    state: RwLock<State>,
}

impl Session {
    /// Create a closed session; call [`Session::open`] to start capturing.
    pub fn new(driver: Arc<dyn CaptureDriver>, config: SessionConfig) -> Self {
        Self {
            driver,
            config,
            state: RwLock::new(State::Closed),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.read(), State::Open(_))
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one backend call on the open handle, holding the read lock until
    /// it returns.
    fn with_handle<T>(
        &self,
        op: &'static str,
        call: impl FnOnce(NativeHandle) -> std::result::Result<T, NativeError>,
    ) -> Result<T> {
        let state = self.read();
        let State::Open(handle) = *state else {
            return Err(DivertError::closed(op));
        };
        call(handle).map_err(|e| DivertError::native(op, e))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register the filter with the backend. On failure the session stays
    /// closed.
    pub fn open(&self) -> Result<()> {
        let mut state = self.write();
        if let State::Open(_) = *state {
            return Err(DivertError::Resource {
                op: "open",
                code: ERROR_ALREADY_EXISTS,
                message: "session is already open".to_string(),
            });
        }
        let cfg = &self.config;
        let handle = self
            .driver
            .open(cfg.filter(), cfg.layer(), cfg.priority(), cfg.flags())
            .map_err(|e| DivertError::native("open", e))?;
        *state = State::Open(handle);

        log::info!(
            "Opened {} session: filter={:?} priority={} layer={:?}",
            self.driver.name(),
            cfg.filter(),
            cfg.priority(),
            cfg.layer()
        );
        Ok(())
    }

    /// Release the handle. The session is closed afterwards even when the
    /// backend reports an error; closing a closed session is an error.
    pub fn close(&self) -> Result<()> {
        // 1. Wake calls in flight on other threads.
        {
            let state = self.read();
            let State::Open(handle) = *state else {
                return Err(DivertError::closed("close"));
            };
            if let Err(e) = self.driver.shutdown(handle) {
                log::warn!("Shutdown before close failed: {e}");
            }
        }

        // 2. The write lock waits for those calls to return.
        let previous = std::mem::replace(&mut *self.write(), State::Closed);
        let State::Open(handle) = previous else {
            return Err(DivertError::closed("close"));
        };
        self.driver
            .close(handle)
            .map_err(|e| DivertError::native("close", e))?;
        log::info!("Closed {} session", self.driver.name());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Packet I/O
    // -----------------------------------------------------------------------

    /// Block until a packet matching the filter arrives. Packets longer than
    /// [`PACKET_BUFFER_SIZE`] come back truncated.
    pub fn receive_raw(&self) -> Result<(Vec<u8>, Metadata)> {
        let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
        let (n, meta) = self.with_handle("recv", |h| self.driver.recv(h, &mut buf))?;
        buf.truncate(n);
        log::debug!("recv {n} bytes ({:?})", meta.direction());
        Ok((buf, meta))
    }

    /// Receive and parse a packet, attaching its metadata.
    pub fn receive(&self) -> Result<Packet> {
        let (raw, meta) = self.receive_raw()?;
        Packet::parse_with_meta(raw, Some(meta))
    }

    /// Reinject `raw`, routed according to `meta`. Returns bytes injected.
    pub fn send(&self, raw: &[u8], meta: &Metadata) -> Result<usize> {
        if raw.is_empty() {
            return Err(DivertError::InvalidArgument(
                "cannot send an empty packet".to_string(),
            ));
        }
        let n = self.with_handle("send", |h| self.driver.send(h, raw, meta))?;
        log::debug!("send {n} bytes ({:?})", meta.direction());
        Ok(n)
    }

    /// Reinject a packet using the buffer and metadata it carries.
    pub fn send_packet(&self, packet: &Packet) -> Result<usize> {
        let Some(meta) = packet.meta() else {
            return Err(DivertError::InvalidArgument(
                "packet has no metadata; use send(raw, meta)".to_string(),
            ));
        };
        self.send(packet.raw(), &meta)
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    pub fn get_param(&self, param: Param) -> Result<u64> {
        self.with_handle("get_param", |h| self.driver.get_param(h, param))
    }

    pub fn set_param(&self, param: Param, value: u64) -> Result<()> {
        self.with_handle("set_param", |h| self.driver.set_param(h, param, value))?;
        log::debug!("set {param}={value}");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_open()
            && let Err(e) = self.close()
        {
            log::warn!("Failed to close session on drop: {e}");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("driver", &self.driver.name())
            .field("config", &self.config)
            .field("state", &*self.read())
            .finish()
    }
}
