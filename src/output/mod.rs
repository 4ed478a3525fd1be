pub mod json;
pub mod text;

use std::io::Write;

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::DivertError;
use crate::header::Protocol;
use crate::metadata::Direction;
use crate::packet::{IpVersion, Packet};

/// What the capture loop did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Sent back into the stack (possibly rewritten).
    Reinjected,
    /// Copied by a sniffing session; the original continued on its own.
    Sniffed,
    /// Withheld from the stack.
    Dropped,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Reinjected => "reinjected",
            Verdict::Sniffed => "sniffed",
            Verdict::Dropped => "dropped",
        }
    }
}

/// One line of capture output.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub seq: u64,
    pub verdict: Verdict,
    pub direction: Option<Direction>,
    pub if_idx: u32,
    pub loopback: bool,
    pub impostor: bool,
    pub version: IpVersion,
    pub protocol: Protocol,
    pub src: String,
    pub dst: String,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub len: usize,
    pub payload_len: usize,
    pub rewritten: bool,
}

impl PacketRecord {
    /// Summarize `packet` as it stands after any rewrite.
    pub fn from_packet(seq: u64, packet: &Packet, verdict: Verdict, rewritten: bool) -> Self {
        let meta = packet.meta();
        Self {
            seq,
            verdict,
            direction: meta.map(|m| m.direction()),
            if_idx: meta.map_or(0, |m| m.if_idx()),
            loopback: packet.is_loopback(),
            impostor: meta.is_some_and(|m| m.is_impostor()),
            version: packet.ip_version(),
            protocol: packet.protocol(),
            src: packet.src_addr().to_string(),
            dst: packet.dst_addr().to_string(),
            src_port: packet.src_port().ok(),
            dst_port: packet.dst_port().ok(),
            len: packet.len(),
            payload_len: packet.payload().len(),
            rewritten,
        }
    }
}

/// Write one record in the specified format, followed by a newline.
pub fn write_record(
    record: &PacketRecord,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), DivertError> {
    match format {
        OutputFormat::Text => text::write_text(record, writer),
        OutputFormat::Json => json::write_json(record, writer),
    }
}
