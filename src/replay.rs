// Replay files: recorded packets fed through the in-process backend.
//
// One packet per line as hex, optionally prefixed with its direction:
//
//     # comment
//     out 450000341c46...
//     in  6000000000141140...
//     450000341c47...        (outbound)

use std::path::Path;

use crate::error::{DivertError, Result};
use crate::metadata::Metadata;

pub fn parse_replay(text: &str) -> Result<Vec<(Vec<u8>, Metadata)>> {
    let mut packets = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (meta, data) = match line.split_once(char::is_whitespace) {
            Some(("in", rest)) => (Metadata::inbound(), rest.trim()),
            Some(("out", rest)) => (Metadata::outbound(), rest.trim()),
            _ => (Metadata::outbound(), line),
        };
        let raw = hex::decode(data).map_err(|e| {
            DivertError::InvalidArgument(format!("replay line {}: {e}", idx + 1))
        })?;
        if raw.is_empty() {
            return Err(DivertError::InvalidArgument(format!(
                "replay line {}: empty packet",
                idx + 1
            )));
        }
        packets.push((raw, meta));
    }
    Ok(packets)
}

pub fn load_replay(path: &Path) -> Result<Vec<(Vec<u8>, Metadata)>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DivertError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_replay(&text)
}
