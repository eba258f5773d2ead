use std::{
    io,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use common::Datagram;
use etherparse::{IcmpEchoHeader, Icmpv4Header, Icmpv4Type};
use ping::{
    packet, Observer, Packet, PingConfig, PingError, PingRx, PingTx, Pinger,
    Statistics,
};
use tokio::sync::mpsc;

const LOCALHOST: &str = "127.0.0.1";

fn localhost() -> IpAddr {
    LOCALHOST.parse().unwrap()
}

// ---------------------------------------------------------------------------
// Observer that records everything it sees.

#[derive(Default)]
struct Record {
    sends: usize,
    recvs: usize,
    errors: usize,
    finishes: Vec<Statistics>,
}

struct Recorder(Arc<Mutex<Record>>);

impl Recorder {
    fn new() -> (Self, Arc<Mutex<Record>>) {
        let record = Arc::new(Mutex::new(Record::default()));
        (Recorder(Arc::clone(&record)), record)
    }
}

impl Observer for Recorder {
    fn on_send(&mut self, _packet: &Packet) {
        self.0.lock().unwrap().sends += 1;
    }
    fn on_recv(&mut self, _packet: &Packet) {
        self.0.lock().unwrap().recvs += 1;
    }
    fn on_error(&mut self, _error: &PingError) {
        self.0.lock().unwrap().errors += 1;
    }
    fn on_finish(&mut self, stats: &Statistics) {
        self.0.lock().unwrap().finishes.push(stats.clone());
    }
}

// ---------------------------------------------------------------------------
// In-memory transports.

fn echo_header(request: &[u8]) -> (IcmpEchoHeader, Vec<u8>) {
    let (header, payload) = Icmpv4Header::from_slice(request).unwrap();
    match header.icmp_type {
        Icmpv4Type::EchoRequest(echo) => (echo, payload.to_vec()),
        other => panic!("expected echo request, got {:?}", other),
    }
}

fn reply_bytes(echo: IcmpEchoHeader, payload: &[u8]) -> Vec<u8> {
    [
        Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(echo), payload)
            .to_bytes()
            .as_slice(),
        payload,
    ]
    .concat()
}

/// Reflects every request back as a well-formed reply, like a loopback
/// responder would.
struct EchoTx {
    out: mpsc::Sender<Datagram>,
}

impl PingTx for EchoTx {
    async fn send(&mut self, request: &[u8], _dst: IpAddr) -> io::Result<usize> {
        let (echo, payload) = echo_header(request);
        let _ = self
            .out
            .send(Datagram {
                bytes: reply_bytes(echo, &payload),
                hop_limit: 64,
            })
            .await;
        Ok(request.len())
    }
}

/// Reflects every request back twice, like a duplicating network path.
struct DuplicatingTx {
    out: mpsc::Sender<Datagram>,
}

impl PingTx for DuplicatingTx {
    async fn send(&mut self, request: &[u8], _dst: IpAddr) -> io::Result<usize> {
        let (echo, payload) = echo_header(request);
        let reply = reply_bytes(echo, &payload);
        for _ in 0..2 {
            let _ = self
                .out
                .send(Datagram {
                    bytes: reply.clone(),
                    hop_limit: 64,
                })
                .await;
        }
        Ok(request.len())
    }
}

/// Reflects replies whose tracker belongs to somebody else.
struct ForeignTrackerTx {
    out: mpsc::Sender<Datagram>,
}

impl PingTx for ForeignTrackerTx {
    async fn send(&mut self, request: &[u8], _dst: IpAddr) -> io::Result<usize> {
        let (echo, mut payload) = echo_header(request);
        for b in &mut payload[8..16] {
            *b ^= 0xff;
        }
        let _ = self
            .out
            .send(Datagram {
                bytes: reply_bytes(echo, &payload),
                hop_limit: 64,
            })
            .await;
        Ok(request.len())
    }
}

/// Answers every request with bytes that parse as no ICMP message at all.
struct GarbageTx {
    out: mpsc::Sender<Datagram>,
}

impl PingTx for GarbageTx {
    async fn send(&mut self, request: &[u8], _dst: IpAddr) -> io::Result<usize> {
        let _ = self
            .out
            .send(Datagram {
                bytes: vec![0xff, 0x00],
                hop_limit: 0,
            })
            .await;
        Ok(request.len())
    }
}

/// Swallows every request without answering.
struct SilentTx;

impl PingTx for SilentTx {
    async fn send(&mut self, request: &[u8], _dst: IpAddr) -> io::Result<usize> {
        Ok(request.len())
    }
}

/// Fails the first attempt of every send with ENOBUFS, then reflects.
struct FlakyTx {
    inner: EchoTx,
    failed_once: AtomicBool,
}

impl PingTx for FlakyTx {
    async fn send(&mut self, request: &[u8], dst: IpAddr) -> io::Result<usize> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
        }
        self.inner.send(request, dst).await
    }
}

/// Receive half fed from a channel. When the feeding side hangs up it
/// behaves like a silent wire rather than reporting an error.
struct QueueRx {
    rx: mpsc::Receiver<Datagram>,
}

impl PingRx for QueueRx {
    async fn recv(&mut self) -> io::Result<Datagram> {
        match self.rx.recv().await {
            Some(datagram) => Ok(datagram),
            None => std::future::pending().await,
        }
    }
}

/// Receive half that fails fatally on the first read.
struct BrokenRx;

impl PingRx for BrokenRx {
    async fn recv(&mut self) -> io::Result<Datagram> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "wire cut"))
    }
}

fn pinger(config: PingConfig) -> (Pinger, Arc<Mutex<Record>>) {
    let (recorder, record) = Recorder::new();
    let mut pinger =
        Pinger::new(LOCALHOST, config, Box::new(recorder)).unwrap();
    pinger.set_ip_addr(localhost());
    (pinger, record)
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn bounded_run_against_echo_responder() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: Some(3),
        interval: Duration::ZERO,
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    });

    let stats = pinger
        .run_with(EchoTx { out }, QueueRx { rx })
        .await
        .unwrap();

    assert_eq!(stats.packets_sent, 3);
    assert_eq!(stats.packets_recv, 3);
    assert_eq!(stats.packet_loss, 0.0);
    assert_eq!(stats.rtts.len(), 3);
    assert!(stats.min_rtt <= stats.avg_rtt && stats.avg_rtt <= stats.max_rtt);

    let record = record.lock().unwrap();
    assert_eq!(record.sends, 3);
    assert_eq!(record.recvs, 3);
    assert_eq!(record.errors, 0);
    assert_eq!(record.finishes.len(), 1);
    assert_eq!(record.finishes[0].packets_sent, 3);
    assert_eq!(record.finishes[0].packets_recv, 3);
}

#[tokio::test]
async fn unbounded_run_times_out_with_full_loss() {
    let (_keep_open, rx) = mpsc::channel(1);
    let (mut pinger, record) = pinger(PingConfig {
        count: None,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(200),
        ..PingConfig::default()
    });

    let started = Instant::now();
    let stats = pinger.run_with(SilentTx, QueueRx { rx }).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(3));
    assert!(stats.packets_sent >= 1);
    assert_eq!(stats.packets_recv, 0);
    assert_eq!(stats.packet_loss, 100.0);
    assert_eq!(record.lock().unwrap().finishes.len(), 1);
}

#[tokio::test]
async fn duplicated_replies_do_not_break_the_run() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: Some(2),
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    });

    let stats = pinger
        .run_with(DuplicatingTx { out }, QueueRx { rx })
        .await
        .unwrap();

    // Both copies of the first reply match the tracker and are counted;
    // the loss figure stays clamped instead of going negative.
    assert!(stats.packets_recv >= 2);
    assert!(stats.packets_recv >= stats.packets_sent);
    assert!((0.0..=100.0).contains(&stats.packet_loss));
    let record = record.lock().unwrap();
    assert_eq!(record.errors, 0);
    assert_eq!(record.finishes.len(), 1);
}

#[tokio::test]
async fn foreign_tracker_is_never_counted() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: Some(2),
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
        ..PingConfig::default()
    });

    let stats = pinger
        .run_with(ForeignTrackerTx { out }, QueueRx { rx })
        .await
        .unwrap();

    // Replies arrive with matching id/seq but a foreign tracker; the run
    // only ends through the timeout and nothing is recorded.
    assert_eq!(stats.packets_recv, 0);
    assert_eq!(stats.packet_loss, 100.0);
    let record = record.lock().unwrap();
    assert_eq!(record.recvs, 0);
    // Tracker mismatches are silent discards, not errors.
    assert_eq!(record.errors, 0);
}

#[tokio::test]
async fn malformed_replies_are_absorbed_and_reported() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: None,
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(150),
        ..PingConfig::default()
    });

    let stats = pinger
        .run_with(GarbageTx { out }, QueueRx { rx })
        .await
        .unwrap();

    assert_eq!(stats.packets_recv, 0);
    let record = record.lock().unwrap();
    assert!(record.errors >= 1);
    assert_eq!(record.finishes.len(), 1);
}

#[tokio::test]
async fn enobufs_is_retried_without_failing_the_send() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: Some(1),
        interval: Duration::ZERO,
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    });

    let tx = FlakyTx {
        inner: EchoTx { out },
        failed_once: AtomicBool::new(false),
    };
    let stats = pinger.run_with(tx, QueueRx { rx }).await.unwrap();

    assert_eq!(stats.packets_sent, 1);
    assert_eq!(stats.packets_recv, 1);
    assert_eq!(record.lock().unwrap().errors, 0);
}

#[tokio::test]
async fn late_reply_does_not_mutate_state() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, record) = pinger(PingConfig {
        count: None,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(150),
        ..PingConfig::default()
    });

    // A perfectly matching reply, delivered long after the done signal.
    let ident = pinger.ident();
    let tracker = pinger.tracker();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let payload = packet::build_payload(packet::now_nanos(), tracker, 16);
        let _ = out
            .send(Datagram {
                bytes: reply_bytes(
                    IcmpEchoHeader { id: ident, seq: 0 },
                    &payload,
                ),
                hop_limit: 64,
            })
            .await;
    });

    let stats = pinger.run_with(SilentTx, QueueRx { rx }).await.unwrap();
    assert_eq!(stats.packets_recv, 0);
    assert!(stats.rtts.is_empty());

    // Give the late reply time to land, then confirm nothing changed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pinger.statistics().packets_recv, 0);
    assert_eq!(record.lock().unwrap().recvs, 0);
}

#[tokio::test]
async fn fatal_read_error_terminates_the_run() {
    let (mut pinger, record) = pinger(PingConfig {
        count: None,
        interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    });

    let err = pinger.run_with(SilentTx, BrokenRx).await.unwrap_err();
    assert!(matches!(err, PingError::ReceiveFatal(_)));
    // The completion callback still fires with a valid snapshot.
    assert_eq!(record.lock().unwrap().finishes.len(), 1);
}

#[tokio::test]
async fn finished_session_refuses_to_restart() {
    let (out, rx) = mpsc::channel(64);
    let (mut pinger, _record) = pinger(PingConfig {
        count: Some(1),
        interval: Duration::ZERO,
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    });

    pinger
        .run_with(EchoTx { out }, QueueRx { rx })
        .await
        .unwrap();

    let (out, rx) = mpsc::channel(64);
    let err = pinger
        .run_with(EchoTx { out }, QueueRx { rx })
        .await
        .unwrap_err();
    assert!(matches!(err, PingError::AlreadyFinished));
}
