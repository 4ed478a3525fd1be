use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{Layer, OpenFlags, PRIORITY_MAX, PRIORITY_MIN, Param, SessionConfig};
use crate::rewrite::PortRedirect;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netdivert",
    version,
    about = "Capture, rewrite and reinject packets through a filtered divert session"
)]
pub struct Cli {
    /// Packet filter expression evaluated by the capture driver
    #[arg(long, default_value = "true")]
    pub filter: String,

    /// Session priority; higher priorities see packets first [default: 0]
    #[arg(long, default_value_t = 0, value_parser = validate_priority, allow_hyphen_values = true)]
    pub priority: i16,

    /// Capture layer
    #[arg(long, default_value = "network")]
    pub layer: LayerArg,

    /// Copy matching packets instead of diverting them
    #[arg(long, conflicts_with = "drop")]
    pub sniff: bool,

    /// Receive matching packets without reinjecting them
    #[arg(long)]
    pub drop: bool,

    /// Maximum packets queued by the driver (32-16384)
    #[arg(long, value_parser = validate_queue_len)]
    pub queue_len: Option<u64>,

    /// Maximum milliseconds a packet may stay queued (100-16000)
    #[arg(long, value_parser = validate_queue_time)]
    pub queue_time: Option<u64>,

    /// Maximum bytes queued by the driver (65535-33554432)
    #[arg(long, value_parser = validate_queue_size)]
    pub queue_size: Option<u64>,

    /// Redirect a port, FROM=TO (repeatable); replies are mapped back
    #[arg(long, value_name = "FROM=TO", value_parser = parse_redirect)]
    pub redirect: Vec<PortRedirect>,

    /// Stop after this many packets
    #[arg(long)]
    pub count: Option<u64>,

    /// Output format [default: text]
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Path to WinDivert.dll (Windows only)
    #[arg(long)]
    pub dll: Option<PathBuf>,

    /// Replay hex-encoded packets from a file through the in-process backend
    #[arg(long, conflicts_with = "dll")]
    pub replay: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerArg {
    Network,
    NetworkForward,
}

impl From<LayerArg> for Layer {
    fn from(arg: LayerArg) -> Self {
        match arg {
            LayerArg::Network => Layer::Network,
            LayerArg::NetworkForward => Layer::NetworkForward,
        }
    }
}

impl Cli {
    pub fn session_config(&self) -> SessionConfig {
        let mut flags = OpenFlags::NONE;
        if self.sniff {
            flags |= OpenFlags::SNIFF;
        }
        SessionConfig::new(self.filter.clone())
            .with_priority(self.priority)
            .with_layer(self.layer.into())
            .with_flags(flags)
    }

    /// Queue parameters given on the command line.
    pub fn params(&self) -> Vec<(Param, u64)> {
        [
            (Param::QueueLength, self.queue_len),
            (Param::QueueTime, self.queue_time),
            (Param::QueueSize, self.queue_size),
        ]
        .into_iter()
        .filter_map(|(p, v)| v.map(|v| (p, v)))
        .collect()
    }
}

fn validate_priority(s: &str) -> Result<i16, String> {
    let val: i16 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid priority"))?;
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&val) {
        Err(format!(
            "priority must be between {PRIORITY_MIN} and {PRIORITY_MAX}"
        ))
    } else {
        Ok(val)
    }
}

fn validate_param(param: Param, s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    let range = param.valid_range();
    if !range.contains(&val) {
        Err(format!(
            "{} must be between {} and {}",
            param.name().replace('_', "-"),
            range.start(),
            range.end()
        ))
    } else {
        Ok(val)
    }
}

fn validate_queue_len(s: &str) -> Result<u64, String> {
    validate_param(Param::QueueLength, s)
}

fn validate_queue_time(s: &str) -> Result<u64, String> {
    validate_param(Param::QueueTime, s)
}

fn validate_queue_size(s: &str) -> Result<u64, String> {
    validate_param(Param::QueueSize, s)
}

fn parse_redirect(s: &str) -> Result<PortRedirect, String> {
    s.parse().map_err(|e: crate::error::DivertError| e.to_string())
}
