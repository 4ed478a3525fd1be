// Session configuration: filter, priority, layer, open flags and the tunable
// queue parameters.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use bitflags::bitflags;
use serde::Serialize;

use crate::error::{DivertError, ERROR_INVALID_PARAMETER};

/// Priority bounds accepted by the capture driver.
pub const PRIORITY_MIN: i16 = -30000;
pub const PRIORITY_MAX: i16 = 30000;

/// Where in the network stack a session intercepts packets.
#[derive(Clone, Copy, Serialize, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Packets to or from the local machine.
    #[default]
    Network,
    /// Packets passing through the local machine.
    NetworkForward,
}

impl Layer {
    pub fn as_raw(self) -> i32 {
        match self {
            Layer::Network => 0,
            Layer::NetworkForward => 1,
        }
    }
}

bitflags! {
    /// Flags passed to the capture driver when a session is opened.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u64 {
        /// Copy matching packets instead of diverting them.
        const SNIFF = 0x0001;
        /// Silently drop matching packets.
        const DROP = 0x0002;
        const RECV_ONLY = 0x0004;
        const SEND_ONLY = 0x0008;
        /// Fail instead of installing the driver when it is not loaded.
        const NO_INSTALL = 0x0010;
        /// Also capture IP fragments.
        const FRAGMENTS = 0x0020;
    }
}

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags::empty();
}

/// Tunable session parameters.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    /// Maximum number of packets queued for a receive.
    QueueLength,
    /// Maximum time in milliseconds a packet may wait in the queue.
    QueueTime,
    /// Maximum number of bytes queued.
    QueueSize,
}

impl Param {
    pub const ALL: [Param; 3] = [Param::QueueLength, Param::QueueTime, Param::QueueSize];

    pub fn as_raw(self) -> u32 {
        match self {
            Param::QueueLength => 0,
            Param::QueueTime => 1,
            Param::QueueSize => 2,
        }
    }

    /// Range of values the driver accepts for this parameter.
    pub fn valid_range(self) -> RangeInclusive<u64> {
        match self {
            Param::QueueLength => 32..=16_384,
            Param::QueueTime => 100..=16_000,
            Param::QueueSize => 65_535..=33_554_432,
        }
    }

    /// Value a freshly opened session starts with.
    pub fn default_value(self) -> u64 {
        match self {
            Param::QueueLength => 4_096,
            Param::QueueTime => 2_000,
            Param::QueueSize => 4_194_304,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Param::QueueLength => "queue_len",
            Param::QueueTime => "queue_time",
            Param::QueueSize => "queue_size",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Param {
    type Err = DivertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "queue_len" | "queue_length" => Ok(Param::QueueLength),
            "queue_time" => Ok(Param::QueueTime),
            "queue_size" => Ok(Param::QueueSize),
            _ => Err(DivertError::Resource {
                op: "param",
                code: ERROR_INVALID_PARAMETER,
                message: format!("unknown parameter '{s}'"),
            }),
        }
    }
}

/// Everything needed to open a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    filter: String,
    priority: i16,
    layer: Layer,
    flags: OpenFlags,
}

impl SessionConfig {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Self::default()
        }
    }

    /// Higher priorities see packets first.
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filter: "true".to_string(),
            priority: 0,
            layer: Layer::Network,
            flags: OpenFlags::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names_parse() {
        assert_eq!("queue_len".parse::<Param>().unwrap(), Param::QueueLength);
        assert_eq!("QUEUE-LENGTH".parse::<Param>().unwrap(), Param::QueueLength);
        assert_eq!("queue_time".parse::<Param>().unwrap(), Param::QueueTime);
        assert_eq!("queue_size".parse::<Param>().unwrap(), Param::QueueSize);
    }

    #[test]
    fn unknown_param_is_resource_error() {
        let err = "queue_depth".parse::<Param>().unwrap_err();
        assert!(err.is_resource());
        assert_eq!(err.native_code(), Some(ERROR_INVALID_PARAMETER));
    }

    #[test]
    fn defaults_sit_inside_valid_ranges() {
        for p in Param::ALL {
            assert!(p.valid_range().contains(&p.default_value()), "{p}");
            assert_eq!(p.name().parse::<Param>().unwrap(), p);
        }
    }

    #[test]
    fn flags_combine() {
        let flags = OpenFlags::SNIFF | OpenFlags::FRAGMENTS;
        assert!(flags.contains(OpenFlags::SNIFF));
        assert!(flags.contains(OpenFlags::FRAGMENTS));
        assert!(!flags.contains(OpenFlags::DROP));
        assert_eq!(flags.bits(), 0x21);
        assert!(OpenFlags::NONE.is_empty());

        let mut f = OpenFlags::NONE;
        f |= OpenFlags::DROP;
        assert_eq!(f, OpenFlags::DROP);

        // Bits the driver does not define are not representable.
        assert!(OpenFlags::from_bits(0x40).is_none());
        assert_eq!(OpenFlags::from_bits_truncate(0x41), OpenFlags::SNIFF);
    }

    #[test]
    fn session_config_builder() {
        let cfg = SessionConfig::new("tcp.DstPort == 23")
            .with_priority(1000)
            .with_layer(Layer::NetworkForward)
            .with_flags(OpenFlags::SNIFF);
        assert_eq!(cfg.filter(), "tcp.DstPort == 23");
        assert_eq!(cfg.priority(), 1000);
        assert_eq!(cfg.layer(), Layer::NetworkForward);
        assert_eq!(cfg.flags(), OpenFlags::SNIFF);

        let def = SessionConfig::default();
        assert_eq!(def.filter(), "true");
        assert_eq!(def.layer().as_raw(), 0);
    }
}
