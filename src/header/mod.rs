// Header codec: structured views over the IP and transport header bytes of a
// raw packet.
//
// Every view wraps a buffer `T` and reads or writes fields at fixed offsets.
// `T = &[u8]` gives a read-only view, `T = &mut [u8]` a mutable one; both
// alias the same bytes as the owning packet, so there is no separate
// serialization step. All multi-byte fields are big-endian on the wire.

pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::fmt;

use serde::Serialize;

pub use icmp::IcmpHeader;
pub use ipv4::Ipv4Header;
pub use ipv6::Ipv6Header;
pub use tcp::TcpHeader;
pub use udp::UdpHeader;

// ---------------------------------------------------------------------------
// Protocol numbers
// ---------------------------------------------------------------------------

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

// IPv6 extension headers that can sit between the base header and transport.
pub const EXT_HOP_BY_HOP: u8 = 0;
pub const EXT_ROUTING: u8 = 43;
pub const EXT_FRAGMENT: u8 = 44;
pub const EXT_ESP: u8 = 50;
pub const EXT_AUTH: u8 = 51;
pub const EXT_DEST_OPTIONS: u8 = 60;
pub const EXT_MOBILITY: u8 = 135;

/// Returns true if `next_hdr` names an IPv6 extension header.
pub fn is_ipv6_extension(next_hdr: u8) -> bool {
    matches!(
        next_hdr,
        EXT_HOP_BY_HOP
            | EXT_ROUTING
            | EXT_FRAGMENT
            | EXT_ESP
            | EXT_AUTH
            | EXT_DEST_OPTIONS
            | EXT_MOBILITY
    )
}

/// IP protocol carried by a packet (the IPv4 protocol byte or the IPv6 next
/// header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Protocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            PROTO_TCP => Protocol::Tcp,
            PROTO_UDP => Protocol::Udp,
            PROTO_ICMP => Protocol::Icmp,
            PROTO_ICMPV6 => Protocol::Icmpv6,
            other => Protocol::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
            Protocol::Icmp => PROTO_ICMP,
            Protocol::Icmpv6 => PROTO_ICMPV6,
            Protocol::Other(n) => n,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Icmp => f.write_str("ICMP"),
            Protocol::Icmpv6 => f.write_str("ICMPv6"),
            Protocol::Other(n) => write!(f, "protocol {n}"),
        }
    }
}

/// Returns true if the raw IP packet is a fragment: an IPv4 packet with MF
/// set or a non-zero fragment offset, or an IPv6 packet whose next header is
/// the fragment extension header.
pub fn is_fragment(raw: &[u8]) -> bool {
    match raw.first().map(|b| b >> 4) {
        Some(4) if raw.len() >= ipv4::IPV4_MIN_HLEN => {
            let flags_frag = read_u16(raw, ipv4::FLAGS_FRAG_OFFSET);
            flags_frag & (ipv4::FLAG_MF | ipv4::FRAG_OFFSET_MASK) != 0
        }
        Some(6) if raw.len() >= ipv6::IPV6_HLEN => raw[ipv6::NEXT_HDR_OFFSET] == EXT_FRAGMENT,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

#[inline]
pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub(crate) fn set_bit(byte: &mut u8, mask: u8, on: bool) {
    if on {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_numbers_round_trip() {
        for n in [1u8, 6, 17, 58, 47, 132] {
            assert_eq!(Protocol::from_number(n).number(), n);
        }
        assert_eq!(Protocol::from_number(6), Protocol::Tcp);
        assert_eq!(Protocol::from_number(47), Protocol::Other(47));
    }

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::Icmpv6.to_string(), "ICMPv6");
        assert_eq!(Protocol::Other(47).to_string(), "protocol 47");
    }

    #[test]
    fn fragment_detection() {
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        assert!(!is_fragment(&v4));
        v4[6] = 0x20; // MF
        assert!(is_fragment(&v4));
        v4[6] = 0x40; // DF only
        assert!(!is_fragment(&v4));
        v4[7] = 0x10; // offset 16
        assert!(is_fragment(&v4));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[6] = PROTO_TCP;
        assert!(!is_fragment(&v6));
        v6[6] = EXT_FRAGMENT;
        assert!(is_fragment(&v6));

        assert!(!is_fragment(&[]));
    }

    #[test]
    fn byte_helpers() {
        let mut buf = [0u8; 6];
        write_u16(&mut buf, 0, 0xBEEF);
        write_u32(&mut buf, 2, 0x0102_0304);
        assert_eq!(buf, [0xBE, 0xEF, 1, 2, 3, 4]);
        assert_eq!(read_u16(&buf, 0), 0xBEEF);
        assert_eq!(read_u32(&buf, 2), 0x0102_0304);

        let mut b = 0u8;
        set_bit(&mut b, 0x02, true);
        assert_eq!(b, 0x02);
        set_bit(&mut b, 0x02, false);
        assert_eq!(b, 0);
    }
}
