//! IPv4 header view.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |      TOS      |          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      TTL      |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Source Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Destination Address                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options (IHL > 5 only)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use super::{read_u16, set_bit, write_u16};
use crate::error::{DivertError, Result};

pub const IPV4_MIN_HLEN: usize = 20;

pub(crate) const TOS_OFFSET: usize = 1;
pub(crate) const TOTAL_LEN_OFFSET: usize = 2;
pub(crate) const ID_OFFSET: usize = 4;
pub(crate) const FLAGS_FRAG_OFFSET: usize = 6;
pub(crate) const TTL_OFFSET: usize = 8;
pub(crate) const PROTO_OFFSET: usize = 9;
pub(crate) const CHECKSUM_OFFSET: usize = 10;
pub(crate) const SRC_OFFSET: usize = 12;
pub(crate) const DST_OFFSET: usize = 16;

pub(crate) const FLAG_DF: u16 = 0x4000;
pub(crate) const FLAG_MF: u16 = 0x2000;
pub(crate) const FRAG_OFFSET_MASK: u16 = 0x1FFF;

/// A view over an IPv4 header.
///
/// The IHL, protocol, MF flag and fragment offset are read-only: the owning
/// packet computes its layer offsets from them once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv4Header<T> {
    /// Wrap `buffer`, checking that it holds a complete IPv4 header.
    pub fn new_checked(buffer: T) -> Result<Self> {
        let data = buffer.as_ref();
        if data.len() < IPV4_MIN_HLEN {
            return Err(DivertError::truncated("IPv4", IPV4_MIN_HLEN, data.len()));
        }
        if data[0] >> 4 != 4 {
            return Err(DivertError::Malformed(format!(
                "expected IP version 4, found {}",
                data[0] >> 4
            )));
        }
        let hlen = ((data[0] & 0x0F) as usize) * 4;
        if hlen < IPV4_MIN_HLEN {
            return Err(DivertError::Malformed(format!(
                "IPv4 header length {hlen} is below the {IPV4_MIN_HLEN}-byte minimum"
            )));
        }
        if data.len() < hlen {
            return Err(DivertError::truncated("IPv4", hlen, data.len()));
        }
        Ok(Self { buffer })
    }

    pub(crate) fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    fn data(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    pub fn version(&self) -> u8 {
        self.data()[0] >> 4
    }

    /// Header length in 32-bit words.
    pub fn ihl(&self) -> u8 {
        self.data()[0] & 0x0F
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        self.ihl() as usize * 4
    }

    pub fn tos(&self) -> u8 {
        self.data()[TOS_OFFSET]
    }

    pub fn total_len(&self) -> u16 {
        read_u16(self.data(), TOTAL_LEN_OFFSET)
    }

    pub fn identification(&self) -> u16 {
        read_u16(self.data(), ID_OFFSET)
    }

    pub fn dont_fragment(&self) -> bool {
        read_u16(self.data(), FLAGS_FRAG_OFFSET) & FLAG_DF != 0
    }

    pub fn more_fragments(&self) -> bool {
        read_u16(self.data(), FLAGS_FRAG_OFFSET) & FLAG_MF != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        read_u16(self.data(), FLAGS_FRAG_OFFSET) & FRAG_OFFSET_MASK
    }

    pub fn ttl(&self) -> u8 {
        self.data()[TTL_OFFSET]
    }

    pub fn protocol(&self) -> u8 {
        self.data()[PROTO_OFFSET]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data(), CHECKSUM_OFFSET)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let d = self.data();
        Ipv4Addr::new(
            d[SRC_OFFSET],
            d[SRC_OFFSET + 1],
            d[SRC_OFFSET + 2],
            d[SRC_OFFSET + 3],
        )
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let d = self.data();
        Ipv4Addr::new(
            d[DST_OFFSET],
            d[DST_OFFSET + 1],
            d[DST_OFFSET + 2],
            d[DST_OFFSET + 3],
        )
    }

    /// Option bytes between the fixed header and `header_len()`.
    pub fn options(&self) -> &[u8] {
        &self.data()[IPV4_MIN_HLEN..self.header_len()]
    }

    /// The raw header bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data()[..self.header_len()]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<T> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn set_tos(&mut self, tos: u8) {
        self.data_mut()[TOS_OFFSET] = tos;
    }

    pub fn set_total_len(&mut self, len: u16) {
        write_u16(self.data_mut(), TOTAL_LEN_OFFSET, len);
    }

    pub fn set_identification(&mut self, id: u16) {
        write_u16(self.data_mut(), ID_OFFSET, id);
    }

    pub fn set_dont_fragment(&mut self, on: bool) {
        let mut hi = self.data()[FLAGS_FRAG_OFFSET];
        set_bit(&mut hi, (FLAG_DF >> 8) as u8, on);
        self.data_mut()[FLAGS_FRAG_OFFSET] = hi;
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.data_mut()[TTL_OFFSET] = ttl;
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_u16(self.data_mut(), CHECKSUM_OFFSET, checksum);
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.data_mut()[SRC_OFFSET..SRC_OFFSET + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.data_mut()[DST_OFFSET..DST_OFFSET + 4].copy_from_slice(&addr.octets());
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let hlen = self.header_len();
        &mut self.data_mut()[IPV4_MIN_HLEN..hlen]
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Ipv4Header<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4 {} > {} hlen={} len={} id={} ttl={} proto={} checksum={:#06x}",
            self.src_addr(),
            self.dst_addr(),
            self.header_len(),
            self.total_len(),
            self.identification(),
            self.ttl(),
            self.protocol(),
            self.checksum()
        )?;
        if self.dont_fragment() {
            f.write_str(" DF")?;
        }
        if self.more_fragments() {
            f.write_str(" MF")?;
        }
        Ok(())
    }
}
