use std::io::Write;

use super::PacketRecord;
use crate::error::DivertError;
use crate::metadata::Direction;

/// Write a record as one human-readable line:
///
/// `#12 out TCP 10.0.0.2:50000 > 93.184.216.34:443 len=60 payload=0 reinjected`
pub fn write_text(record: &PacketRecord, writer: &mut impl Write) -> Result<(), DivertError> {
    let direction = match record.direction {
        Some(Direction::Outbound) => "out",
        Some(Direction::Inbound) => "in",
        None => "-",
    };
    let mut flags = String::new();
    if record.loopback {
        flags.push_str(" loopback");
    }
    if record.impostor {
        flags.push_str(" impostor");
    }
    if record.rewritten {
        flags.push_str(" rewritten");
    }
    writeln!(
        writer,
        "#{} {} {} {} > {} len={} payload={} {}{}",
        record.seq,
        direction,
        record.protocol,
        endpoint(&record.src, record.src_port),
        endpoint(&record.dst, record.dst_port),
        record.len,
        record.payload_len,
        record.verdict.as_str(),
        flags,
    )
    .map_err(DivertError::Output)
}

fn endpoint(addr: &str, port: Option<u16>) -> String {
    match port {
        Some(port) if addr.contains(':') => format!("[{addr}]:{port}"),
        Some(port) => format!("{addr}:{port}"),
        None => addr.to_string(),
    }
}
