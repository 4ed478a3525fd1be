//! Internet checksum (RFC 1071) over IP headers and transport segments.
//!
//! The data is summed as big-endian 16-bit words (an odd trailing byte is
//! padded with zero), carries are folded back into the low 16 bits, and the
//! result is complemented. TCP, UDP and ICMPv6 additionally sum a
//! pseudo-header of addresses, protocol and segment length.

use std::net::IpAddr;

use crate::error::Result;
use crate::header::{icmp, ipv4, tcp, udp, write_u16, Protocol};
use crate::packet::Packet;

/// Running one's-complement sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, value: u16) {
        self.sum += u64::from(value);
    }

    pub fn add_u32(&mut self, value: u32) {
        self.add_u16((value >> 16) as u16);
        self.add_u16(value as u16);
    }

    /// Add `bytes` as big-endian words, padding an odd tail with zero.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut words = bytes.chunks_exact(2);
        for w in &mut words {
            self.add_u16(u16::from_be_bytes([w[0], w[1]]));
        }
        if let [last] = words.remainder() {
            self.add_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    /// Fold the carries and return the complemented 16-bit checksum.
    pub fn finish(self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Checksum of `data` with no pseudo-header.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(data);
    c.finish()
}

/// Which checksums a recomputation touches. All are enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumOptions {
    pub ip: bool,
    pub icmp: bool,
    pub icmpv6: bool,
    pub tcp: bool,
    pub udp: bool,
}

impl ChecksumOptions {
    pub fn all() -> Self {
        Self {
            ip: true,
            icmp: true,
            icmpv6: true,
            tcp: true,
            udp: true,
        }
    }

    pub fn none() -> Self {
        Self {
            ip: false,
            icmp: false,
            icmpv6: false,
            tcp: false,
            udp: false,
        }
    }
}

impl Default for ChecksumOptions {
    fn default() -> Self {
        Self::all()
    }
}

/// Return a copy of `raw` with every checksum recomputed.
pub fn calc_checksums(raw: &[u8]) -> Result<Vec<u8>> {
    calc_checksums_with(raw, ChecksumOptions::default())
}

pub fn calc_checksums_with(raw: &[u8], options: ChecksumOptions) -> Result<Vec<u8>> {
    let mut packet = Packet::parse(raw.to_vec())?;
    apply(&mut packet, options);
    Ok(packet.into_raw())
}

/// Recompute the checksums of `packet` in place and hand it back, so the
/// call composes with further edits or a send.
pub fn update_packet_checksums(mut packet: Packet) -> Packet {
    packet.update_checksums();
    packet
}

pub(crate) fn apply(packet: &mut Packet, options: ChecksumOptions) {
    let ip_len = packet.ip_header_len();
    let protocol = packet.protocol();
    // A fragment's transport checksum covers the reassembled datagram.
    let has_transport = packet.transport_header_len().is_some() && !packet.is_fragment();
    let is_v4 = packet.is_ipv4();
    let (src, dst) = (packet.src_addr(), packet.dst_addr());
    let buf = packet.buffer_mut();

    if is_v4 && options.ip {
        write_u16(buf, ipv4::CHECKSUM_OFFSET, 0);
        let sum = internet_checksum(&buf[..ip_len]);
        write_u16(buf, ipv4::CHECKSUM_OFFSET, sum);
    }

    if !has_transport {
        return;
    }
    let (offset, pseudo, enabled) = match protocol {
        Protocol::Tcp => (tcp::CHECKSUM_OFFSET, true, options.tcp),
        Protocol::Udp => (udp::CHECKSUM_OFFSET, true, options.udp),
        Protocol::Icmp => (icmp::CHECKSUM_OFFSET, false, options.icmp),
        Protocol::Icmpv6 => (icmp::CHECKSUM_OFFSET, true, options.icmpv6),
        Protocol::Other(_) => return,
    };
    if !enabled {
        return;
    }

    let segment = &mut buf[ip_len..];
    write_u16(segment, offset, 0);
    let mut sum = Checksum::new();
    if pseudo {
        add_pseudo_header(&mut sum, src, dst, protocol.number(), segment.len());
    }
    sum.add_bytes(segment);
    let mut value = sum.finish();
    // A zero UDP checksum means "none"; the computed zero goes out as all ones.
    if protocol == Protocol::Udp && value == 0 {
        value = 0xFFFF;
    }
    write_u16(segment, offset, value);
}

fn add_pseudo_header(sum: &mut Checksum, src: IpAddr, dst: IpAddr, proto: u8, len: usize) {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum.add_bytes(&s.octets());
            sum.add_bytes(&d.octets());
            sum.add_u16(u16::from(proto));
            sum.add_u16(len as u16);
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum.add_bytes(&s.octets());
            sum.add_bytes(&d.octets());
            sum.add_u32(len as u32);
            sum.add_u16(u16::from(proto));
        }
        _ => {}
    }
}
