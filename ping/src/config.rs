use std::{net::IpAddr, path::Path, time::Duration};

use anyhow::Context;
use common::Family;
use serde::Deserialize;

use crate::{error::PingError, packet::MIN_PAYLOAD_LEN};

/// Engine parameters for one session. Consumed, never produced, by the
/// engine; the CLI and the YAML loader below are the usual producers.
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Wait between packet sends.
    pub interval: Duration,
    /// Overall deadline for the run; `Duration::ZERO` disables it.
    pub timeout: Duration,
    /// Stop after receiving this many replies; `None` runs until the
    /// timeout or an explicit stop.
    pub count: Option<u64>,
    /// Payload length in bytes, at least 16.
    pub size: usize,
    /// Raw ICMP (needs privileges) instead of datagram ICMP.
    pub privileged: bool,
    /// Keep per-packet rtt samples for the final statistics. Turn off to
    /// bound memory on long-running sessions.
    pub record_rtts: bool,
    /// Restrict resolution to one address family.
    pub family: Option<Family>,
    /// Explicit source address to bind.
    pub source: Option<IpAddr>,
    /// Network interface to bind.
    pub bind_interface: Option<String>,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            count: None,
            size: MIN_PAYLOAD_LEN,
            privileged: false,
            record_rtts: true,
            family: None,
            source: None,
            bind_interface: None,
        }
    }
}

impl PingConfig {
    /// The codec assumes the payload fits the timestamp and tracker; that
    /// minimum is enforced here, not in the codec.
    pub fn validate(&self) -> Result<(), PingError> {
        if self.size < MIN_PAYLOAD_LEN {
            return Err(PingError::InvalidConfig(format!(
                "payload size {} is below the {} byte minimum",
                self.size, MIN_PAYLOAD_LEN
            )));
        }
        Ok(())
    }
}

/// One resolved entry of a multi-target run.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub host: String,
    pub config: PingConfig,
}

// File-level defaults with a list of targets, each of which may override
// the scheduling knobs.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    interval_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    size: Option<usize>,
    #[serde(default)]
    privileged: Option<bool>,
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Host(String),
    Detailed {
        host: String,
        #[serde(default)]
        interval_ms: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        count: Option<u64>,
    },
}

/// Loads a YAML multi-target configuration file.
pub fn load_file(path: &Path) -> anyhow::Result<Vec<TargetSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse(raw: &str) -> anyhow::Result<Vec<TargetSpec>> {
    let file: FileConfig = serde_yaml::from_str(raw)?;
    let base = PingConfig {
        interval: file
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1)),
        timeout: file
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5)),
        count: file.count,
        size: file.size.unwrap_or(MIN_PAYLOAD_LEN),
        privileged: file.privileged.unwrap_or(false),
        ..PingConfig::default()
    };
    base.validate()?;

    let mut specs = Vec::with_capacity(file.targets.len());
    for entry in file.targets {
        let spec = match entry {
            TargetEntry::Host(host) => TargetSpec {
                host,
                config: base.clone(),
            },
            TargetEntry::Detailed {
                host,
                interval_ms,
                timeout_ms,
                count,
            } => {
                let mut config = base.clone();
                if let Some(ms) = interval_ms {
                    config.interval = Duration::from_millis(ms);
                }
                if let Some(ms) = timeout_ms {
                    config.timeout = Duration::from_millis(ms);
                }
                if let Some(n) = count {
                    config.count = Some(n);
                }
                TargetSpec { host, config }
            }
        };
        specs.push(spec);
    }
    Ok(specs)
}
