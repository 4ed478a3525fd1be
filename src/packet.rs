// Packet: an owned raw IP buffer plus the layer offsets resolved at parse
// time.
//
// Header views returned by the accessors borrow sub-slices of the same
// buffer, so every mutation is immediately visible in `raw()`. Offsets are
// computed once in `parse`; the fields they are derived from (IHL, IPv4
// fragment fields, TCP data offset, protocol/next header) are not writable
// through the views.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::checksum::{self, ChecksumOptions};
use crate::error::{DivertError, Result};
use crate::header::icmp::ICMP_HLEN;
use crate::header::ipv6::IPV6_HLEN;
use crate::header::udp::UDP_HLEN;
use crate::header::{self, IcmpHeader, Ipv4Header, Ipv6Header, Protocol, TcpHeader, UdpHeader};
use crate::metadata::Metadata;

#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// A captured (or hand-built) IP packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    raw: Vec<u8>,
    meta: Option<Metadata>,
    version: IpVersion,
    ip_hdr_len: usize,
    protocol: Protocol,
    /// Length of the recognized transport header, `None` when the transport
    /// is unknown, hidden behind IPv6 extension headers, or this is a
    /// non-first IPv4 fragment.
    transport_hdr_len: Option<usize>,
    /// IPv4 MF set or nonzero offset, or an IPv6 fragment header.
    fragment: bool,
}

impl Packet {
    /// Parse a raw IP packet with no capture metadata attached.
    pub fn parse(raw: impl Into<Vec<u8>>) -> Result<Self> {
        Self::parse_with_meta(raw, None)
    }

    /// Parse a raw IP packet and attach the metadata it was received with.
    pub fn parse_with_meta(raw: impl Into<Vec<u8>>, meta: Option<Metadata>) -> Result<Self> {
        let raw = raw.into();
        let Some(&first) = raw.first() else {
            return Err(DivertError::truncated("IP", 1, 0));
        };

        let (version, ip_hdr_len, proto, first_fragment) = match first >> 4 {
            4 => {
                let hdr = Ipv4Header::new_checked(&raw[..])?;
                (
                    IpVersion::V4,
                    hdr.header_len(),
                    hdr.protocol(),
                    hdr.fragment_offset() == 0,
                )
            }
            6 => {
                let hdr = Ipv6Header::new_checked(&raw[..])?;
                (IpVersion::V6, IPV6_HLEN, hdr.next_header(), true)
            }
            v => return Err(DivertError::Malformed(format!("unknown IP version {v}"))),
        };

        let protocol = Protocol::from_number(proto);
        let fragment = header::is_fragment(&raw);
        let transport_hdr_len = if first_fragment {
            transport_header_len(version, protocol, &raw[ip_hdr_len..])?
        } else {
            None
        };

        Ok(Self {
            raw,
            meta,
            version,
            ip_hdr_len,
            protocol,
            transport_hdr_len,
            fragment,
        })
    }

    // -----------------------------------------------------------------------
    // Buffer and layout
    // -----------------------------------------------------------------------

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn ip_version(&self) -> IpVersion {
        self.version
    }

    pub fn is_ipv4(&self) -> bool {
        self.version == IpVersion::V4
    }

    pub fn is_ipv6(&self) -> bool {
        self.version == IpVersion::V6
    }

    /// The IPv4 protocol or IPv6 next-header value.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// True for any piece of a fragmented datagram. A first fragment still
    /// exposes its transport header, but its checksum covers the whole
    /// datagram and is left alone by `update_checksums`.
    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// Length of the IP header; it always starts at offset 0.
    pub fn ip_header_len(&self) -> usize {
        self.ip_hdr_len
    }

    /// Offset of the recognized transport header, if there is one.
    pub fn transport_offset(&self) -> Option<usize> {
        self.transport_hdr_len.map(|_| self.ip_hdr_len)
    }

    pub(crate) fn transport_header_len(&self) -> Option<usize> {
        self.transport_hdr_len
    }

    pub fn payload_offset(&self) -> usize {
        self.ip_hdr_len + self.transport_hdr_len.unwrap_or(0)
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn meta(&self) -> Option<Metadata> {
        self.meta
    }

    pub fn set_meta(&mut self, meta: Option<Metadata>) {
        self.meta = meta;
    }

    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = Some(meta);
        self
    }

    /// True when metadata is attached and marks the packet outbound.
    pub fn is_outbound(&self) -> bool {
        self.meta.is_some_and(|m| m.is_outbound())
    }

    pub fn is_inbound(&self) -> bool {
        self.meta.is_some_and(|m| m.is_inbound())
    }

    pub fn is_loopback(&self) -> bool {
        self.meta.is_some_and(|m| m.is_loopback())
    }

    // -----------------------------------------------------------------------
    // Header views
    // -----------------------------------------------------------------------

    pub fn ipv4_hdr(&self) -> Option<Ipv4Header<&[u8]>> {
        self.is_ipv4()
            .then(|| Ipv4Header::new_unchecked(&self.raw[..self.ip_hdr_len]))
    }

    pub fn ipv4_hdr_mut(&mut self) -> Option<Ipv4Header<&mut [u8]>> {
        if !self.is_ipv4() {
            return None;
        }
        let len = self.ip_hdr_len;
        Some(Ipv4Header::new_unchecked(&mut self.raw[..len]))
    }

    pub fn ipv6_hdr(&self) -> Option<Ipv6Header<&[u8]>> {
        self.is_ipv6()
            .then(|| Ipv6Header::new_unchecked(&self.raw[..IPV6_HLEN]))
    }

    pub fn ipv6_hdr_mut(&mut self) -> Option<Ipv6Header<&mut [u8]>> {
        if !self.is_ipv6() {
            return None;
        }
        Some(Ipv6Header::new_unchecked(&mut self.raw[..IPV6_HLEN]))
    }

    pub fn tcp_hdr(&self) -> Option<TcpHeader<&[u8]>> {
        self.transport(Protocol::Tcp).map(TcpHeader::new_unchecked)
    }

    pub fn tcp_hdr_mut(&mut self) -> Option<TcpHeader<&mut [u8]>> {
        self.transport_mut(Protocol::Tcp)
            .map(TcpHeader::new_unchecked)
    }

    pub fn udp_hdr(&self) -> Option<UdpHeader<&[u8]>> {
        self.transport(Protocol::Udp).map(UdpHeader::new_unchecked)
    }

    pub fn udp_hdr_mut(&mut self) -> Option<UdpHeader<&mut [u8]>> {
        self.transport_mut(Protocol::Udp)
            .map(UdpHeader::new_unchecked)
    }

    pub fn icmp_hdr(&self) -> Option<IcmpHeader<&[u8]>> {
        self.transport(Protocol::Icmp).map(IcmpHeader::new_unchecked)
    }

    pub fn icmp_hdr_mut(&mut self) -> Option<IcmpHeader<&mut [u8]>> {
        self.transport_mut(Protocol::Icmp)
            .map(IcmpHeader::new_unchecked)
    }

    pub fn icmpv6_hdr(&self) -> Option<IcmpHeader<&[u8]>> {
        self.transport(Protocol::Icmpv6)
            .map(IcmpHeader::new_unchecked)
    }

    pub fn icmpv6_hdr_mut(&mut self) -> Option<IcmpHeader<&mut [u8]>> {
        self.transport_mut(Protocol::Icmpv6)
            .map(IcmpHeader::new_unchecked)
    }

    fn transport(&self, protocol: Protocol) -> Option<&[u8]> {
        let len = self.transport_hdr_len?;
        (self.protocol == protocol).then(|| &self.raw[self.ip_hdr_len..self.ip_hdr_len + len])
    }

    fn transport_mut(&mut self, protocol: Protocol) -> Option<&mut [u8]> {
        let len = self.transport_hdr_len?;
        if self.protocol != protocol {
            return None;
        }
        let start = self.ip_hdr_len;
        Some(&mut self.raw[start..start + len])
    }

    // -----------------------------------------------------------------------
    // Payload
    // -----------------------------------------------------------------------

    /// Bytes after the transport header (or after the IP header when no
    /// transport header is recognized).
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.payload_offset()..]
    }

    /// Same-length in-place payload edits.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_offset();
        &mut self.raw[start..]
    }

    /// Replace the payload, growing or shrinking the buffer, and rewrite the
    /// IP length field (and the UDP length field) to match.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let start = self.payload_offset();
        let new_len = start + payload.len();
        let declared = match self.version {
            IpVersion::V4 => new_len,
            IpVersion::V6 => new_len - IPV6_HLEN,
        };
        if declared > u16::MAX as usize {
            return Err(DivertError::InvalidArgument(format!(
                "payload of {} bytes does not fit in a single {:?} packet",
                payload.len(),
                self.version
            )));
        }

        self.raw.truncate(start);
        self.raw.extend_from_slice(payload);
        self.sync_lengths();
        Ok(())
    }

    fn sync_lengths(&mut self) {
        let total = self.raw.len();
        let ip_hdr_len = self.ip_hdr_len;
        if let Some(mut ip) = self.ipv4_hdr_mut() {
            ip.set_total_len(total as u16);
        }
        if let Some(mut ip) = self.ipv6_hdr_mut() {
            ip.set_payload_len((total - IPV6_HLEN) as u16);
        }
        if let Some(mut udp) = self.udp_hdr_mut() {
            udp.set_length((total - ip_hdr_len) as u16);
        }
    }

    // -----------------------------------------------------------------------
    // Address / port convenience
    // -----------------------------------------------------------------------

    pub fn src_addr(&self) -> IpAddr {
        match (self.ipv4_hdr(), self.ipv6_hdr()) {
            (Some(v4), _) => IpAddr::V4(v4.src_addr()),
            (_, Some(v6)) => IpAddr::V6(v6.src_addr()),
            (None, None) => unreachable!("packet is always IPv4 or IPv6"),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match (self.ipv4_hdr(), self.ipv6_hdr()) {
            (Some(v4), _) => IpAddr::V4(v4.dst_addr()),
            (_, Some(v6)) => IpAddr::V6(v6.dst_addr()),
            (None, None) => unreachable!("packet is always IPv4 or IPv6"),
        }
    }

    /// Fails with `InvalidArgument` when `addr` is of the other IP family.
    pub fn set_src_addr(&mut self, addr: IpAddr) -> Result<()> {
        match addr {
            IpAddr::V4(a) => self.ipv4_hdr_mut().map(|mut h| h.set_src_addr(a)),
            IpAddr::V6(a) => self.ipv6_hdr_mut().map(|mut h| h.set_src_addr(a)),
        }
        .ok_or_else(|| self.family_mismatch(addr))
    }

    pub fn set_dst_addr(&mut self, addr: IpAddr) -> Result<()> {
        match addr {
            IpAddr::V4(a) => self.ipv4_hdr_mut().map(|mut h| h.set_dst_addr(a)),
            IpAddr::V6(a) => self.ipv6_hdr_mut().map(|mut h| h.set_dst_addr(a)),
        }
        .ok_or_else(|| self.family_mismatch(addr))
    }

    /// Source port of the TCP or UDP header; `UnsupportedProtocol` otherwise.
    pub fn src_port(&self) -> Result<u16> {
        if let Some(tcp) = self.tcp_hdr() {
            return Ok(tcp.src_port());
        }
        if let Some(udp) = self.udp_hdr() {
            return Ok(udp.src_port());
        }
        Err(self.no_ports())
    }

    pub fn dst_port(&self) -> Result<u16> {
        if let Some(tcp) = self.tcp_hdr() {
            return Ok(tcp.dst_port());
        }
        if let Some(udp) = self.udp_hdr() {
            return Ok(udp.dst_port());
        }
        Err(self.no_ports())
    }

    pub fn set_src_port(&mut self, port: u16) -> Result<()> {
        if let Some(mut tcp) = self.tcp_hdr_mut() {
            tcp.set_src_port(port);
            return Ok(());
        }
        if let Some(mut udp) = self.udp_hdr_mut() {
            udp.set_src_port(port);
            return Ok(());
        }
        Err(self.no_ports())
    }

    pub fn set_dst_port(&mut self, port: u16) -> Result<()> {
        if let Some(mut tcp) = self.tcp_hdr_mut() {
            tcp.set_dst_port(port);
            return Ok(());
        }
        if let Some(mut udp) = self.udp_hdr_mut() {
            udp.set_dst_port(port);
            return Ok(());
        }
        Err(self.no_ports())
    }

    fn no_ports(&self) -> DivertError {
        let found = match self.transport_hdr_len {
            Some(_) => self.protocol.to_string(),
            None if self.is_ipv6() => {
                let next = self.protocol.number();
                if header::is_ipv6_extension(next) {
                    format!("IPv6 extension header {next}")
                } else {
                    format!("unrecognized next header {next}")
                }
            }
            None => format!("{} without a readable header", self.protocol),
        };
        DivertError::UnsupportedProtocol {
            requested: "TCP or UDP",
            found,
        }
    }

    fn family_mismatch(&self, addr: IpAddr) -> DivertError {
        DivertError::InvalidArgument(format!(
            "cannot assign {addr} to an {:?} packet",
            self.version
        ))
    }

    // -----------------------------------------------------------------------
    // Checksums and rendering
    // -----------------------------------------------------------------------

    /// Recompute every checksum in place.
    pub fn update_checksums(&mut self) -> &mut Self {
        checksum::apply(self, ChecksumOptions::default());
        self
    }

    pub fn update_checksums_with(&mut self, options: ChecksumOptions) -> &mut Self {
        checksum::apply(self, options);
        self
    }

    /// Lowercase hex dump of the raw buffer.
    pub fn hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

/// Validate and measure the transport header at the start of `segment`.
fn transport_header_len(
    version: IpVersion,
    protocol: Protocol,
    segment: &[u8],
) -> Result<Option<usize>> {
    match (version, protocol) {
        (_, Protocol::Tcp) => TcpHeader::new_checked(segment).map(|h| Some(h.header_len())),
        (_, Protocol::Udp) => UdpHeader::new_checked(segment).map(|_| Some(UDP_HLEN)),
        (IpVersion::V4, Protocol::Icmp) | (IpVersion::V6, Protocol::Icmpv6) => {
            IcmpHeader::new_checked(segment).map(|_| Some(ICMP_HLEN))
        }
        _ => Ok(None),
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.meta {
            Some(m) if m.is_outbound() => "outbound",
            Some(_) => "inbound",
            None => "no metadata",
        };
        writeln!(f, "Packet len={} ({direction})", self.raw.len())?;
        if let Some(ip) = self.ipv4_hdr() {
            writeln!(f, "  {ip}")?;
        }
        if let Some(ip) = self.ipv6_hdr() {
            writeln!(f, "  {ip}")?;
        }
        if let Some(tcp) = self.tcp_hdr() {
            writeln!(f, "  {tcp}")?;
        }
        if let Some(udp) = self.udp_hdr() {
            writeln!(f, "  {udp}")?;
        }
        if let Some(icmp) = self.icmp_hdr().or_else(|| self.icmpv6_hdr()) {
            writeln!(f, "  {icmp}")?;
        }
        write!(f, "  payload {} bytes", self.payload().len())
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================
