// Packet rewriting applied between receive and reinject.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{DivertError, Result};
use crate::packet::Packet;

/// Transparent port redirect: traffic to `from` is sent to `to`, and replies
/// from `to` are rewritten to look like they came from `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRedirect {
    pub from: u16,
    pub to: u16,
}

impl PortRedirect {
    pub fn new(from: u16, to: u16) -> Self {
        Self { from, to }
    }

    /// Rewrite `packet` in place. Returns whether a port changed; packets
    /// without a TCP or UDP header are left alone. Checksums are not
    /// updated.
    pub fn apply(&self, packet: &mut Packet) -> Result<bool> {
        if packet.tcp_hdr().is_none() && packet.udp_hdr().is_none() {
            return Ok(false);
        }
        let mut changed = false;
        if packet.dst_port()? == self.from {
            packet.set_dst_port(self.to)?;
            changed = true;
        }
        if packet.src_port()? == self.to {
            packet.set_src_port(self.from)?;
            changed = true;
        }
        Ok(changed)
    }
}

/// Apply every redirect in order; true if any of them changed the packet.
pub fn apply_all(redirects: &[PortRedirect], packet: &mut Packet) -> Result<bool> {
    let mut changed = false;
    for r in redirects {
        changed |= r.apply(packet)?;
    }
    Ok(changed)
}

impl fmt::Display for PortRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.from, self.to)
    }
}

impl FromStr for PortRedirect {
    type Err = DivertError;

    /// Parses `FROM=TO`, e.g. `8080=80`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DivertError::InvalidArgument(format!("expected FROM=TO ports, got '{s}'"));
        let (from, to) = s.split_once('=').ok_or_else(invalid)?;
        let from: u16 = from.trim().parse().map_err(|_| invalid())?;
        let to: u16 = to.trim().parse().map_err(|_| invalid())?;
        if from == 0 || to == 0 {
            return Err(DivertError::InvalidArgument(
                "port 0 cannot be redirected".to_string(),
            ));
        }
        Ok(Self { from, to })
    }
}
