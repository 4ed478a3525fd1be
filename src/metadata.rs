// Per-packet capture context produced by a receive and consumed by a send.

use serde::Serialize;

#[derive(Clone, Copy, Serialize, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
}

/// Capture-time context of a packet.
///
/// Values are immutable: the `with_*` methods return an altered copy, which
/// is how a caller deliberately changes the routing of a reinjected packet
/// (for example flipping an outbound packet to inbound).
#[derive(Clone, Copy, Serialize, Debug, Default, PartialEq, Eq, Hash)]
pub struct Metadata {
    direction: Direction,
    /// Interface index the packet arrived on or leaves through.
    if_idx: u32,
    /// Sub-interface index paired with `if_idx`.
    sub_if_idx: u32,
    loopback: bool,
    fragment: bool,
    /// Set on packets that were themselves injected by a send.
    impostor: bool,
}

impl Metadata {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            ..Self::default()
        }
    }

    pub fn outbound() -> Self {
        Self::new(Direction::Outbound)
    }

    pub fn inbound() -> Self {
        Self::new(Direction::Inbound)
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_interface(mut self, if_idx: u32, sub_if_idx: u32) -> Self {
        self.if_idx = if_idx;
        self.sub_if_idx = sub_if_idx;
        self
    }

    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn with_fragment(mut self, fragment: bool) -> Self {
        self.fragment = fragment;
        self
    }

    pub fn with_impostor(mut self, impostor: bool) -> Self {
        self.impostor = impostor;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn if_idx(&self) -> u32 {
        self.if_idx
    }

    pub fn sub_if_idx(&self) -> u32 {
        self.sub_if_idx
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    pub fn is_impostor(&self) -> bool {
        self.impostor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_return_altered_copies() {
        let base = Metadata::outbound().with_interface(7, 1);
        let flipped = base.with_direction(Direction::Inbound).with_loopback(true);

        assert!(base.is_outbound());
        assert!(!base.is_loopback());
        assert!(flipped.is_inbound());
        assert!(flipped.is_loopback());
        assert_eq!(flipped.if_idx(), 7);
        assert_eq!(flipped.sub_if_idx(), 1);
    }

    #[test]
    fn default_is_outbound_without_flags() {
        let meta = Metadata::default();
        assert_eq!(meta.direction(), Direction::Outbound);
        assert!(!meta.is_fragment());
        assert!(!meta.is_impostor());
    }

    #[test]
    fn serializes_lowercase_direction() {
        let meta = Metadata::inbound().with_fragment(true);
        let json = serde_json::to_value(meta).unwrap();
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["fragment"], true);
        assert_eq!(json["if_idx"], 0);
    }
}
