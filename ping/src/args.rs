use std::{net::IpAddr, time::Duration};

use clap::Parser;
use common::Family;
use ping::PingConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "ICMP echo client")]
pub struct Opts {
    /// Hosts to ping, or a single YAML config file (.yaml/.yml)
    #[arg(required = true)]
    pub targets: Vec<String>,
    /// Number of replies to wait for per target
    #[arg(long, short = 'n', default_value = "5")]
    pub count: u64,
    /// Keep pinging until interrupted
    #[arg(long, short = 'c', conflicts_with = "count")]
    pub continuous: bool,
    /// Interval between packets in milliseconds
    #[arg(long, short, default_value = "1000")]
    pub interval: u64,
    /// Overall timeout in milliseconds (0 disables it)
    #[arg(long, short, default_value = "5000")]
    pub timeout: u64,
    /// Payload length in bytes (minimum 16)
    #[arg(long, short = 's', default_value = "16")]
    pub size: usize,
    /// Send privileged raw ICMP instead of unprivileged datagrams
    #[arg(long)]
    pub privileged: bool,
    /// Do not keep per-packet rtt samples
    #[arg(long)]
    pub no_record: bool,
    /// Resolve to IPv4 only
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    pub ipv4: bool,
    /// Resolve to IPv6 only
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,
    /// Source address to bind
    #[arg(long)]
    pub source: Option<IpAddr>,
    /// Interface to bind to
    #[arg(long, short = 'I')]
    pub iface: Option<String>,
}

impl Opts {
    pub fn family(&self) -> Option<Family> {
        if self.ipv4 {
            Some(Family::V4)
        } else if self.ipv6 {
            Some(Family::V6)
        } else {
            None
        }
    }

    pub fn ping_config(&self) -> PingConfig {
        PingConfig {
            interval: Duration::from_millis(self.interval),
            timeout: Duration::from_millis(self.timeout),
            count: if self.continuous {
                None
            } else {
                Some(self.count)
            },
            size: self.size,
            privileged: self.privileged,
            record_rtts: !self.no_record,
            family: self.family(),
            source: self.source,
            bind_interface: self.iface.clone(),
        }
    }
}
