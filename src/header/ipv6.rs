// IPv6 base header view (fixed 40 bytes).
//
// Extension headers are not walked: a packet whose next header is an
// extension carries no recognized transport view.

use std::fmt;
use std::net::Ipv6Addr;

use super::{read_u16, read_u32, write_u16, write_u32};
use crate::error::{DivertError, Result};

pub const IPV6_HLEN: usize = 40;

pub(crate) const PAYLOAD_LEN_OFFSET: usize = 4;
pub(crate) const NEXT_HDR_OFFSET: usize = 6;
pub(crate) const HOP_LIMIT_OFFSET: usize = 7;
pub(crate) const SRC_OFFSET: usize = 8;
pub(crate) const DST_OFFSET: usize = 24;

const FLOW_LABEL_MASK: u32 = 0x000F_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv6Header<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        let data = buffer.as_ref();
        if data.len() < IPV6_HLEN {
            return Err(DivertError::truncated("IPv6", IPV6_HLEN, data.len()));
        }
        if data[0] >> 4 != 6 {
            return Err(DivertError::Malformed(format!(
                "expected IP version 6, found {}",
                data[0] >> 4
            )));
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

    pub fn traffic_class(&self) -> u8 {
        let d = self.data();
        (d[0] << 4) | (d[1] >> 4)
    }

    pub fn flow_label(&self) -> u32 {
        read_u32(self.data(), 0) & FLOW_LABEL_MASK
    }

    pub fn payload_len(&self) -> u16 {
        read_u16(self.data(), PAYLOAD_LEN_OFFSET)
    }

    pub fn next_header(&self) -> u8 {
        self.data()[NEXT_HDR_OFFSET]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data()[HOP_LIMIT_OFFSET]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data()[SRC_OFFSET..SRC_OFFSET + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data()[DST_OFFSET..DST_OFFSET + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data()[..IPV6_HLEN]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv6Header<T> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn set_traffic_class(&mut self, tc: u8) {
        let d = self.data_mut();
        d[0] = (d[0] & 0xF0) | (tc >> 4);
        d[1] = (d[1] & 0x0F) | (tc << 4);
    }

    pub fn set_flow_label(&mut self, label: u32) {
        let word = read_u32(self.data(), 0) & !FLOW_LABEL_MASK;
        write_u32(self.data_mut(), 0, word | (label & FLOW_LABEL_MASK));
    }

    pub fn set_payload_len(&mut self, len: u16) {
        write_u16(self.data_mut(), PAYLOAD_LEN_OFFSET, len);
    }

    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.data_mut()[HOP_LIMIT_OFFSET] = hop_limit;
    }

    pub fn set_src_addr(&mut self, addr: Ipv6Addr) {
        self.data_mut()[SRC_OFFSET..SRC_OFFSET + 16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv6Addr) {
        self.data_mut()[DST_OFFSET..DST_OFFSET + 16].copy_from_slice(&addr.octets());
    }
}

impl<T: AsRef<[u8]>> fmt::Display for Ipv6Header<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv6 {} > {} plen={} next={} hlim={} flow={:#x}",
            self.src_addr(),
            self.dst_addr(),
            self.payload_len(),
            self.next_header(),
            self.hop_limit(),
            self.flow_label()
        )
    }
}
