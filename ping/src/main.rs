use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;
use ping::{
    Observer, Packet, PingError, Pinger, Statistics, TargetSpec,
};
use tokio::signal;

mod args;

// Classic console presentation of a session.
struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn on_recv(&mut self, packet: &Packet) {
        println!(
            "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
            packet.nbytes,
            packet.ip_addr,
            packet.seq,
            packet.hop_limit,
            packet.rtt.as_secs_f64() * 1e3,
        );
    }

    fn on_error(&mut self, error: &PingError) {
        warn!("{}", error);
    }

    fn on_finish(&mut self, stats: &Statistics) {
        println!("\n--- {} ping statistics ---", stats.addr);
        println!("{}", stats);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let opts = args::Opts::parse();

    let specs = targets(&opts)?;
    for spec in specs {
        let mut pinger = Pinger::new(
            spec.host.clone(),
            spec.config,
            Box::new(ConsoleObserver),
        )?;
        pinger
            .resolve()
            .await
            .with_context(|| format!("resolving {}", spec.host))?;
        if let Some(ip) = pinger.ip_addr() {
            println!("PING {} ({}):", spec.host, ip);
        }

        // Ctrl-C stops the active session cooperatively; the session then
        // drains and still prints its statistics.
        let stop = pinger.cancel_handle();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });

        pinger
            .run()
            .await
            .with_context(|| format!("pinging {}", spec.host))?;
    }
    Ok(())
}

fn targets(opts: &args::Opts) -> Result<Vec<TargetSpec>> {
    if opts.targets.len() == 1
        && (opts.targets[0].ends_with(".yaml")
            || opts.targets[0].ends_with(".yml"))
    {
        return ping::load_file(Path::new(&opts.targets[0]));
    }

    let mut config = opts.ping_config();
    // Binding to an interface without an explicit source address: use the
    // interface's own address for the requested family.
    if let (Some(iface), None) = (&opts.iface, opts.source) {
        let family = opts.family().unwrap_or(common::Family::V4);
        let src = common::interface_to_ipaddr(iface, family)
            .with_context(|| format!("looking up interface {}", iface))?;
        config.source = Some(src);
    }

    Ok(opts
        .targets
        .iter()
        .map(|host| TargetSpec {
            host: host.clone(),
            config: config.clone(),
        })
        .collect())
}
