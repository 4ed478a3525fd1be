//! TCP header view.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |     |N|C|E|U|A|P|R|S|F|                               |
//! | Offset| Rsrv|S|W|C|R|C|S|S|Y|I|            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options (data offset > 5)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use super::{read_u16, read_u32, set_bit, write_u16, write_u32};
use crate::error::{DivertError, Result};

pub const TCP_MIN_HLEN: usize = 20;

pub(crate) const SRC_PORT_OFFSET: usize = 0;
pub(crate) const DST_PORT_OFFSET: usize = 2;
pub(crate) const SEQ_OFFSET: usize = 4;
pub(crate) const ACK_OFFSET: usize = 8;
pub(crate) const DATA_OFFSET_OFFSET: usize = 12;
pub(crate) const FLAGS_OFFSET: usize = 13;
pub(crate) const WINDOW_OFFSET: usize = 14;
pub(crate) const CHECKSUM_OFFSET: usize = 16;
pub(crate) const URG_PTR_OFFSET: usize = 18;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;
pub const TCP_FLAG_ECE: u8 = 0x40;
pub const TCP_FLAG_CWR: u8 = 0x80;
// NS lives in the low bit of the data-offset byte.
const TCP_FLAG_NS: u8 = 0x01;

/// Header length in bytes declared by the data-offset nibble of `segment`.
pub(crate) fn declared_len(segment: &[u8]) -> usize {
    ((segment[DATA_OFFSET_OFFSET] >> 4) as usize) * 4
}

/// A view over a TCP header. The data offset is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader<T> {
    buffer: T,
}

macro_rules! flag_accessors {
    ($($get:ident, $set:ident, $mask:expr;)*) => {
        impl<T: AsRef<[u8]>> TcpHeader<T> {
            $(
                pub fn $get(&self) -> bool {
                    self.flags() & $mask != 0
                }
            )*
        }

        impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
            $(
                pub fn $set(&mut self, on: bool) {
                    set_bit(&mut self.data_mut()[FLAGS_OFFSET], $mask, on);
                }
            )*
        }
    };
}

flag_accessors! {
    fin, set_fin, TCP_FLAG_FIN;
    syn, set_syn, TCP_FLAG_SYN;
    rst, set_rst, TCP_FLAG_RST;
    psh, set_psh, TCP_FLAG_PSH;
    ack, set_ack, TCP_FLAG_ACK;
    urg, set_urg, TCP_FLAG_URG;
    ece, set_ece, TCP_FLAG_ECE;
    cwr, set_cwr, TCP_FLAG_CWR;
}

impl<T: AsRef<[u8]>> TcpHeader<T> {
    /// Wrap `buffer`, checking that it holds the full header its data offset
    /// declares.
    pub fn new_checked(buffer: T) -> Result<Self> {
        let data = buffer.as_ref();
        if data.len() < TCP_MIN_HLEN {
            return Err(DivertError::truncated("TCP", TCP_MIN_HLEN, data.len()));
        }
        let hlen = declared_len(data);
        if hlen < TCP_MIN_HLEN {
            return Err(DivertError::Malformed(format!(
                "TCP data offset {hlen} is below the {TCP_MIN_HLEN}-byte minimum"
            )));
        }
        if data.len() < hlen {
            return Err(DivertError::truncated("TCP", hlen, data.len()));
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

    pub fn seq_num(&self) -> u32 {
        read_u32(self.data(), SEQ_OFFSET)
    }

    pub fn ack_num(&self) -> u32 {
        read_u32(self.data(), ACK_OFFSET)
    }

    /// Header length in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        self.data()[DATA_OFFSET_OFFSET] >> 4
    }

    pub fn header_len(&self) -> usize {
        declared_len(self.data())
    }

    /// The eight classic flag bits (CWR..FIN).
    pub fn flags(&self) -> u8 {
        self.data()[FLAGS_OFFSET]
    }

    pub fn ns(&self) -> bool {
        self.data()[DATA_OFFSET_OFFSET] & TCP_FLAG_NS != 0
    }

    pub fn window(&self) -> u16 {
        read_u16(self.data(), WINDOW_OFFSET)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data(), CHECKSUM_OFFSET)
    }

    pub fn urgent_ptr(&self) -> u16 {
        read_u16(self.data(), URG_PTR_OFFSET)
    }

    pub fn options(&self) -> &[u8] {
        &self.data()[TCP_MIN_HLEN..self.header_len()]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data()[..self.header_len()]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn set_src_port(&mut self, port: u16) {
        write_u16(self.data_mut(), SRC_PORT_OFFSET, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        write_u16(self.data_mut(), DST_PORT_OFFSET, port);
    }

    pub fn set_seq_num(&mut self, seq: u32) {
        write_u32(self.data_mut(), SEQ_OFFSET, seq);
    }

    pub fn set_ack_num(&mut self, ack: u32) {
        write_u32(self.data_mut(), ACK_OFFSET, ack);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data_mut()[FLAGS_OFFSET] = flags;
    }

    pub fn set_ns(&mut self, on: bool) {
        set_bit(&mut self.data_mut()[DATA_OFFSET_OFFSET], TCP_FLAG_NS, on);
    }

    pub fn set_window(&mut self, window: u16) {
        write_u16(self.data_mut(), WINDOW_OFFSET, window);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_u16(self.data_mut(), CHECKSUM_OFFSET, checksum);
    }

    pub fn set_urgent_ptr(&mut self, ptr: u16) {
        write_u16(self.data_mut(), URG_PTR_OFFSET, ptr);
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let hlen = self.header_len();
        &mut self.data_mut()[TCP_MIN_HLEN..hlen]
    }
}

impl<T: AsRef<[u8]>> fmt::Display for TcpHeader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, char); 8] = [
            (TCP_FLAG_CWR, 'C'),
            (TCP_FLAG_ECE, 'E'),
            (TCP_FLAG_URG, 'U'),
            (TCP_FLAG_ACK, 'A'),
            (TCP_FLAG_PSH, 'P'),
            (TCP_FLAG_RST, 'R'),
            (TCP_FLAG_SYN, 'S'),
            (TCP_FLAG_FIN, 'F'),
        ];
        let flags: String = NAMES
            .iter()
            .map(|&(mask, c)| if self.flags() & mask != 0 { c } else { '.' })
            .collect();
        write!(
            f,
            "TCP {} > {} [{}] seq={} ack={} win={} hlen={} checksum={:#06x}",
            self.src_port(),
            self.dst_port(),
            flags,
            self.seq_num(),
            self.ack_num(),
            self.window(),
            self.header_len(),
            self.checksum()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syn_with_options() -> Vec<u8> {
        let mut seg = vec![0u8; 32];
        seg[0..2].copy_from_slice(&54321u16.to_be_bytes());
        seg[2..4].copy_from_slice(&23u16.to_be_bytes());
        seg[4..8].copy_from_slice(&0x0102_0304u32.to_be_bytes());
        seg[12] = 0x80; // data offset 8 -> 32 bytes
        seg[13] = TCP_FLAG_SYN;
        seg[14..16].copy_from_slice(&65535u16.to_be_bytes());
        seg[20..32].copy_from_slice(&[
            0x02, 0x04, 0xff, 0xd7, 0x01, 0x03, 0x03, 0x08, 0x01, 0x01, 0x04, 0x02,
        ]);
        seg
    }

    #[test]
    fn reads_syn_segment() {
        let seg = syn_with_options();
        let hdr = TcpHeader::new_checked(&seg[..]).unwrap();
        assert_eq!(hdr.src_port(), 54321);
        assert_eq!(hdr.dst_port(), 23);
        assert_eq!(hdr.seq_num(), 0x0102_0304);
        assert_eq!(hdr.header_len(), 32);
        assert!(hdr.syn());
        assert!(!hdr.ack());
        assert!(!hdr.ns());
        assert_eq!(hdr.window(), 65535);
        assert_eq!(
            hdr.options(),
            &[0x02, 0x04, 0xff, 0xd7, 0x01, 0x03, 0x03, 0x08, 0x01, 0x01, 0x04, 0x02]
        );
    }

    #[test]
    fn flag_setters_touch_single_bits() {
        let mut seg = syn_with_options();
        {
            let mut hdr = TcpHeader::new_checked(&mut seg[..]).unwrap();
            hdr.set_ack(true);
            hdr.set_syn(false);
            hdr.set_ns(true);
            hdr.set_dst_port(80);
        }
        assert_eq!(seg[13], TCP_FLAG_ACK);
        assert_eq!(seg[12], 0x81);
        let hdr = TcpHeader::new_checked(&seg[..]).unwrap();
        assert_eq!(hdr.header_len(), 32);
        assert_eq!(hdr.dst_port(), 80);
        assert_eq!(&seg[2..4], &[0x00, 0x50]);
    }

    #[test]
    fn rejects_bad_data_offset() {
        let mut seg = syn_with_options();
        seg[12] = 0x40;
        assert!(matches!(
            TcpHeader::new_checked(&seg[..]),
            Err(DivertError::Malformed(_))
        ));
        seg[12] = 0xF0;
        assert!(matches!(
            TcpHeader::new_checked(&seg[..]),
            Err(DivertError::Parse { needed: 60, have: 32, .. })
        ));
        assert!(TcpHeader::new_checked(&seg[..10]).is_err());
    }

    #[test]
    fn display_shows_flags() {
        let seg = syn_with_options();
        let hdr = TcpHeader::new_checked(&seg[..]).unwrap();
        assert!(hdr.to_string().starts_with("TCP 54321 > 23 [......S.]"));
    }
}
