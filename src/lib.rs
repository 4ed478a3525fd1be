//! Packet capture, modification and reinjection through a filtered divert
//! session.
//!
//! A [`Divert`] context owns a capture backend (the WinDivert driver on
//! Windows, or the in-process [`MemoryDriver`]). Sessions opened from it
//! receive matching packets as [`Packet`]s whose header views alias the
//! packet buffer, so edits through `tcp_hdr_mut()`, `set_dst_port()` and
//! friends land directly in the bytes that are later reinjected.
//!
//! ```no_run
//! use netdivert::{Divert, SessionConfig};
//!
//! # fn main() -> netdivert::Result<()> {
//! let (divert, _driver) = Divert::memory();
//! let session = divert.open_session(SessionConfig::new("tcp.DstPort == 80"))?;
//! let mut packet = session.receive()?;
//! packet.set_dst_port(8080)?;
//! packet.update_checksums();
//! session.send_packet(&packet)?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod cli;
pub mod config;
pub mod divert;
pub mod driver;
pub mod error;
pub mod header;
pub mod metadata;
pub mod output;
pub mod packet;
pub mod replay;
pub mod rewrite;
pub mod session;

pub use checksum::{ChecksumOptions, calc_checksums, update_packet_checksums};
pub use config::{Layer, OpenFlags, Param, SessionConfig};
pub use divert::Divert;
pub use driver::{CaptureDriver, MemoryDriver, NativeError, NativeHandle};
pub use error::{DivertError, Result};
pub use metadata::{Direction, Metadata};
pub use packet::{IpVersion, Packet};
pub use session::{PACKET_BUFFER_SIZE, Session};
