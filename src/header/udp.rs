// UDP header view: fixed 8 bytes (ports, length, checksum).

use std::fmt;

use super::{read_u16, write_u16};
use crate::error::{DivertError, Result};

pub const UDP_HLEN: usize = 8;

pub(crate) const SRC_PORT_OFFSET: usize = 0;
pub(crate) const DST_PORT_OFFSET: usize = 2;
pub(crate) const LENGTH_OFFSET: usize = 4;
pub(crate) const CHECKSUM_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpHeader<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        let len = buffer.as_ref().len();
        if len < UDP_HLEN {
            return Err(DivertError::truncated("UDP", UDP_HLEN, len));
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

    pub fn src_port(&self) -> u16 {
        read_u16(self.data(), SRC_PORT_OFFSET)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data(), DST_PORT_OFFSET)
    }

    /// Length of header plus payload, as declared on the wire.
    pub fn length(&self) -> u16 {
        read_u16(self.data(), LENGTH_OFFSET)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data(), CHECKSUM_OFFSET)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data()[..UDP_HLEN]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<T> {
    pub fn set_src_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), SRC_PORT_OFFSET, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), DST_PORT_OFFSET, port);
    }

    pub fn set_length(&mut self, len: u16) {
        write_u16(self.buffer.as_mut(), LENGTH_OFFSET, len);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_u16(self.buffer.as_mut(), CHECKSUM_OFFSET, checksum);
    }
}

impl<T: AsRef<[u8]>> fmt::Display for UdpHeader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UDP {} > {} len={} checksum={:#06x}",
            self.src_port(),
            self.dst_port(),
            self.length(),
            self.checksum()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes_fields() {
        let mut buf = [0x30, 0x39, 0x00, 0x35, 0x00, 0x14, 0xAB, 0xCD];
        let hdr = UdpHeader::new_checked(&buf[..]).unwrap();
        assert_eq!(hdr.src_port(), 12345);
        assert_eq!(hdr.dst_port(), 53);
        assert_eq!(hdr.length(), 20);
        assert_eq!(hdr.checksum(), 0xABCD);
        assert_eq!(hdr.to_string(), "UDP 12345 > 53 len=20 checksum=0xabcd");

        let mut hdr = UdpHeader::new_checked(&mut buf[..]).unwrap();
        hdr.set_dst_port(5353);
        hdr.set_length(8);
        assert_eq!(buf, [0x30, 0x39, 0x14, 0xE9, 0x00, 0x08, 0xAB, 0xCD]);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(
            UdpHeader::new_checked(&[0u8; 7][..]),
            Err(DivertError::Parse { needed: 8, have: 7, .. })
        ));
    }
}
