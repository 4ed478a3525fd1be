use std::io::Write;

use super::PacketRecord;
use crate::error::DivertError;

/// Write a record as a single line of JSON (JSON Lines framing).
pub fn write_json(record: &PacketRecord, writer: &mut impl Write) -> Result<(), DivertError> {
    serde_json::to_writer(&mut *writer, record)
        .map_err(|e| DivertError::Output(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(DivertError::Output)
}
