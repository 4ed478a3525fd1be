// ICMP / ICMPv6 header view: type, code, checksum and the 4-byte
// rest-of-header word. Both protocols share the layout.

use std::fmt;

use super::{read_u16, read_u32, write_u16, write_u32};
use crate::error::{DivertError, Result};

pub const ICMP_HLEN: usize = 8;

pub(crate) const TYPE_OFFSET: usize = 0;
pub(crate) const CODE_OFFSET: usize = 1;
pub(crate) const CHECKSUM_OFFSET: usize = 2;
pub(crate) const REST_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> IcmpHeader<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        let len = buffer.as_ref().len();
        if len < ICMP_HLEN {
            return Err(DivertError::truncated("ICMP", ICMP_HLEN, len));
        }
        Ok(Self { buffer })
    }

    pub(crate) fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn msg_type(&self) -> u8 {
        self.buffer.as_ref()[TYPE_OFFSET]
    }

    pub fn code(&self) -> u8 {
        self.buffer.as_ref()[CODE_OFFSET]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), CHECKSUM_OFFSET)
    }

    /// Type-specific word (echo identifier/sequence, MTU, unused...).
    pub fn rest_of_header(&self) -> u32 {
        read_u32(self.buffer.as_ref(), REST_OFFSET)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_ref()[..ICMP_HLEN]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IcmpHeader<T> {
    pub fn set_msg_type(&mut self, msg_type: u8) {
        self.buffer.as_mut()[TYPE_OFFSET] = msg_type;
    }

    pub fn set_code(&mut self, code: u8) {
        self.buffer.as_mut()[CODE_OFFSET] = code;
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_u16(self.buffer.as_mut(), CHECKSUM_OFFSET, checksum);
    }

    pub fn set_rest_of_header(&mut self, rest: u32) {
        write_u32(self.buffer.as_mut(), REST_OFFSET, rest);
    }
}

impl<T: AsRef<[u8]>> fmt::Display for IcmpHeader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ICMP type={} code={} checksum={:#06x} rest={:#010x}",
            self.msg_type(),
            self.code(),
            self.checksum(),
            self.rest_of_header()
        )
    }
}
