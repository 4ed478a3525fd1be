// Divert: the initialization context shared by every session.
//
// It owns the capture backend (for WinDivert, the loaded DLL). Sessions
// hold their own reference, so the backend is released once the context
// and all sessions created from it are dropped.

use std::fmt;
use std::sync::Arc;

use crate::checksum;
use crate::config::SessionConfig;
use crate::driver::{CaptureDriver, MemoryDriver};
use crate::error::Result;
use crate::metadata::Metadata;
use crate::packet::Packet;
use crate::session::Session;

#[derive(Clone)]
pub struct Divert {
    driver: Arc<dyn CaptureDriver>,
}

impl Divert {
    pub fn new(driver: Arc<dyn CaptureDriver>) -> Self {
        Self { driver }
    }

    /// Load the WinDivert DLL at `path`.
    #[cfg(target_os = "windows")]
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let driver = crate::driver::WinDivertDriver::load(path)?;
        Ok(Self::new(Arc::new(driver)))
    }

    /// Load WinDivert.dll from the default DLL search path.
    #[cfg(target_os = "windows")]
    pub fn load_default() -> Result<Self> {
        let driver = crate::driver::WinDivertDriver::load_default()?;
        Ok(Self::new(Arc::new(driver)))
    }

    /// Context over a fresh in-process backend, returned alongside it so the
    /// caller can inject traffic.
    pub fn memory() -> (Self, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        (Self::new(driver.clone()), driver)
    }

    pub fn driver(&self) -> &Arc<dyn CaptureDriver> {
        &self.driver
    }

    /// A closed session bound to this context.
    pub fn session(&self, config: SessionConfig) -> Session {
        Session::new(Arc::clone(&self.driver), config)
    }

    /// Construct and open a session.
    pub fn open_session(&self, config: SessionConfig) -> Result<Session> {
        let session = self.session(config);
        session.open()?;
        Ok(session)
    }

    pub fn parse_packet(&self, raw: impl Into<Vec<u8>>, meta: Option<Metadata>) -> Result<Packet> {
        Packet::parse_with_meta(raw, meta)
    }

    pub fn calc_checksums(&self, raw: &[u8]) -> Result<Vec<u8>> {
        checksum::calc_checksums(raw)
    }

    pub fn update_packet_checksums(&self, packet: Packet) -> Packet {
        checksum::update_packet_checksums(packet)
    }
}

impl fmt::Debug for Divert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Divert")
            .field("driver", &self.driver.name())
            .finish()
    }
}
