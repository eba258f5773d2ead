use std::{
    io,
    net::IpAddr,
    time::Duration,
};

use common::{Datagram, Family, Mode};
use log::{debug, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PingConfig,
    error::PingError,
    packet::{self, Decoded},
    stats::{RttStats, Statistics},
    transport::{self, PingRx, PingTx},
};

/// How long the receiver blocks on the transport before re-checking for
/// cancellation.
const READ_DEADLINE: Duration = Duration::from_millis(100);

/// Depth of the receiver → scheduler hand-off queue.
const HANDOFF_DEPTH: usize = 32;

// Stand-in period for "no timeout configured".
const NO_TIMEOUT: Duration = Duration::from_secs(86400 * 365);

/// One sent or received echo packet, as handed to the observer. Per-send
/// packets carry a zero rtt and hop limit.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Round-trip time of the reply.
    pub rtt: Duration,
    /// Resolved address of the target.
    pub ip_addr: IpAddr,
    /// Nominal address string the session was created with.
    pub addr: String,
    /// Number of ICMP bytes in the message.
    pub nbytes: usize,
    /// Echo sequence number.
    pub seq: u16,
    /// Remaining TTL (v4) or hop limit (v6) of the reply.
    pub hop_limit: u8,
}

/// Callbacks invoked synchronously on the scheduler's task. All methods
/// default to no-ops; implement the ones you care about.
///
/// `on_error` is the channel for failures the engine absorbs without
/// aborting the run: isolated send failures and malformed packets.
pub trait Observer {
    fn on_send(&mut self, _packet: &Packet) {}
    fn on_recv(&mut self, _packet: &Packet) {}
    fn on_error(&mut self, _error: &PingError) {}
    fn on_finish(&mut self, _stats: &Statistics) {}
}

/// Observer that ignores everything.
pub struct NopObserver;

impl Observer for NopObserver {}

/// One ping session against one target.
///
/// ```no_run
/// # async fn run() -> Result<(), ping::PingError> {
/// use ping::{NopObserver, PingConfig, Pinger};
///
/// let config = PingConfig {
///     count: Some(3),
///     ..PingConfig::default()
/// };
/// let mut pinger =
///     Pinger::new("www.example.org", config, Box::new(NopObserver))?;
/// let stats = pinger.run().await?;
/// println!("{}", stats);
/// # Ok(())
/// # }
/// ```
pub struct Pinger {
    config: PingConfig,
    addr: String,
    ip: Option<IpAddr>,
    /// Fixed for the session; matched against replies in privileged mode.
    ident: u16,
    /// Random 63-bit value embedded in every payload. Disambiguates our
    /// probes from other processes sharing the identifier space, which is
    /// the only reliable match in unprivileged mode.
    tracker: u64,
    sequence: u16,
    stats: RttStats,
    cancel: CancellationToken,
    observer: Box<dyn Observer + Send>,
    finished: bool,
}

impl Pinger {
    pub fn new(
        addr: impl Into<String>,
        config: PingConfig,
        observer: Box<dyn Observer + Send>,
    ) -> Result<Self, PingError> {
        config.validate()?;
        let mut rng = StdRng::from_entropy();
        let tracker = rng.gen::<u64>() >> 1;
        let ident = rng.gen::<u16>();
        Ok(Self {
            stats: RttStats::new(config.record_rtts),
            config,
            addr: addr.into(),
            ip: None,
            ident,
            tracker,
            sequence: 0,
            cancel: CancellationToken::new(),
            observer,
            finished: false,
        })
    }

    /// Nominal address string the session was created with.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Resolved target address, once known.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn ident(&self) -> u16 {
        self.ident
    }

    pub fn tracker(&self) -> u64 {
        self.tracker
    }

    /// Skips resolution by supplying the target address directly.
    pub fn set_ip_addr(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
    }

    /// Handle for stopping the session from elsewhere (a Ctrl-C task, a
    /// supervisor). Cancelling twice is fine; the signal is idempotent.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Point-in-time statistics; also produced by `run` and handed to
    /// `on_finish` when the session completes.
    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot(self.ip, &self.addr)
    }

    /// Resolves the target through the system resolver, honoring the
    /// configured family preference.
    pub async fn resolve(&mut self) -> Result<(), PingError> {
        // Literal addresses skip the resolver entirely.
        if let Ok(ip) = self.addr.parse::<IpAddr>() {
            self.ip = Some(ip);
            return Ok(());
        }
        let addrs = tokio::net::lookup_host(format!("{}:0", self.addr))
            .await
            .map_err(|e| PingError::ResolutionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        let wanted = self.config.family;
        let ip = addrs
            .map(|sa| sa.ip())
            .find(|ip| match wanted {
                None => true,
                Some(Family::V4) => ip.is_ipv4(),
                Some(Family::V6) => ip.is_ipv6(),
            })
            .ok_or_else(|| PingError::ResolutionFailed {
                addr: self.addr.clone(),
                reason: "no address for the requested family".to_string(),
            })?;
        self.ip = Some(ip);
        Ok(())
    }

    /// Runs the session against the real ICMP endpoint. Blocks until the
    /// count is reached, the timeout fires, or the session is stopped.
    pub async fn run(&mut self) -> Result<Statistics, PingError> {
        if self.ip.is_none() {
            self.resolve().await?;
        }
        let Some(ip) = self.ip else {
            return Err(PingError::ResolutionFailed {
                addr: self.addr.clone(),
                reason: "no resolved address".to_string(),
            });
        };
        let mode = if self.config.privileged {
            Mode::Raw
        } else {
            Mode::Dgram
        };
        let (tx, rx) = transport::open_transport(
            Family::of(ip),
            mode,
            self.config.source,
            self.config.bind_interface.as_deref(),
        )
        .map_err(PingError::OpenFailed)?;
        self.run_with(tx, rx).await
    }

    /// Runs the session over a caller-supplied transport. This is the
    /// seam the integration tests use; `run` is a thin wrapper around it.
    pub async fn run_with<T, R>(
        &mut self,
        mut tx: T,
        rx: R,
    ) -> Result<Statistics, PingError>
    where
        T: PingTx,
        R: PingRx,
    {
        if self.finished {
            return Err(PingError::AlreadyFinished);
        }
        let Some(ip) = self.ip else {
            return Err(PingError::ResolutionFailed {
                addr: self.addr.clone(),
                reason: "no resolved address".to_string(),
            });
        };
        let family = Family::of(ip);

        let cancel = self.cancel.clone();
        let (handoff_tx, mut handoff_rx) =
            mpsc::channel::<Datagram>(HANDOFF_DEPTH);
        let receiver =
            tokio::spawn(recv_loop(rx, handoff_tx, cancel.clone()));

        // A zero interval means "as fast as possible", but the timer type
        // insists on a non-zero period.
        let period = if self.config.interval.is_zero() {
            Duration::from_micros(1)
        } else {
            self.config.interval
        };
        let mut send_timer = tokio::time::interval(period);
        let timeout = tokio::time::sleep(if self.config.timeout.is_zero() {
            NO_TIMEOUT
        } else {
            self.config.timeout
        });
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut timeout => break,
                _ = send_timer.tick() => {
                    if let Some(count) = self.config.count {
                        if self.stats.sent() >= count {
                            continue;
                        }
                    }
                    if let Err(err) = self.send_one(&mut tx, ip, family).await
                    {
                        warn!("send to {} failed: {}", ip, err);
                        self.observer.on_error(&err);
                    }
                }
                received = handoff_rx.recv() => {
                    let Some(datagram) = received else {
                        // Receiver exited on its own; its error surfaces
                        // below at the join.
                        break;
                    };
                    if let Err(err) = self.process(datagram, ip, family) {
                        debug!("discarding packet from {}: {}", ip, err);
                        self.observer.on_error(&err);
                    }
                    if let Some(count) = self.config.count {
                        if self.stats.received() >= count {
                            break;
                        }
                    }
                }
            }
        }

        // Draining: raise the done signal and wait for the receiver to
        // quiesce before the final snapshot, so no late reply mutates
        // state after it is taken.
        cancel.cancel();
        let receiver_result = receiver.await;
        self.finished = true;

        let snapshot = self.stats.snapshot(Some(ip), &self.addr);
        self.observer.on_finish(&snapshot);

        match receiver_result {
            Ok(Ok(())) => Ok(snapshot),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(PingError::ReceiveFatal(io::Error::new(
                io::ErrorKind::Other,
                join_err,
            ))),
        }
    }

    async fn send_one<T: PingTx>(
        &mut self,
        tx: &mut T,
        ip: IpAddr,
        family: Family,
    ) -> Result<(), PingError> {
        let bytes = packet::encode_echo_request(
            family,
            self.ident,
            self.sequence,
            self.tracker,
            self.config.size,
        );
        loop {
            match tx.send(&bytes, ip).await {
                Ok(_) => break,
                // Kernel send buffer momentarily full: retry right away
                // without counting the attempt.
                Err(err)
                    if err.raw_os_error() == Some(libc::ENOBUFS) =>
                {
                    continue
                }
                Err(err) => return Err(PingError::SendFailed(err)),
            }
        }
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.stats.on_sent();
        let outgoing = Packet {
            rtt: Duration::ZERO,
            ip_addr: ip,
            addr: self.addr.clone(),
            nbytes: bytes.len(),
            seq,
            hop_limit: 0,
        };
        self.observer.on_send(&outgoing);
        Ok(())
    }

    // Decode, match and record one received datagram. Traffic that is
    // valid but not ours is dropped without error; unprivileged sockets
    // routinely see replies meant for other processes.
    fn process(
        &mut self,
        datagram: Datagram,
        ip: IpAddr,
        family: Family,
    ) -> Result<(), PingError> {
        let received_at = packet::now_nanos();
        let Decoded::EchoReply {
            ident,
            seq,
            payload,
        } = packet::decode(&datagram.bytes, family)?
        else {
            return Ok(());
        };

        // Only raw sockets carry a trustworthy identifier; on dgram
        // sockets the kernel rewrites it.
        if self.config.privileged && ident != self.ident {
            return Ok(());
        }
        let Some((send_nanos, tracker)) = packet::read_payload(&payload)
        else {
            return Err(PingError::MalformedPacket(format!(
                "echo payload too short: {} bytes",
                payload.len()
            )));
        };
        if tracker != self.tracker {
            return Ok(());
        }

        // The send time travels inside the reply itself, which makes the
        // rtt immune to reordering and sequence wraparound.
        let rtt =
            Duration::from_nanos(received_at.saturating_sub(send_nanos));
        self.stats.on_received(rtt);
        let incoming = Packet {
            rtt,
            ip_addr: ip,
            addr: self.addr.clone(),
            nbytes: datagram.bytes.len(),
            seq,
            hop_limit: datagram.hop_limit,
        };
        self.observer.on_recv(&incoming);
        Ok(())
    }
}

// Receive loop: blocks on the transport with a short renewable deadline so
// cancellation is observed promptly, and hands raw datagrams to the
// scheduler. No decoding or counter mutation happens here.
async fn recv_loop<R: PingRx>(
    mut rx: R,
    handoff: mpsc::Sender<Datagram>,
    cancel: CancellationToken,
) -> Result<(), PingError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
            // Deadline lapsed; go around and look at the flag again.
            Err(_elapsed) => continue,
            Ok(Ok(datagram)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = handoff.send(datagram) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Ok(Err(err)) => {
                cancel.cancel();
                return Err(PingError::ReceiveFatal(err));
            }
        }
    }
}
