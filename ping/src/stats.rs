use std::{fmt, net::IpAddr, time::Duration};

/// Running counters for one session. Mutated only from the scheduler's
/// task, so no locking is needed. RTT samples are kept only while
/// recording is on, to bound memory on long-running sessions.
#[derive(Debug)]
pub struct RttStats {
    sent: u64,
    received: u64,
    record: bool,
    rtts: Vec<Duration>,
}

impl RttStats {
    pub fn new(record: bool) -> Self {
        Self {
            sent: 0,
            received: 0,
            record,
            rtts: Vec::new(),
        }
    }

    pub fn on_sent(&mut self) {
        self.sent += 1;
    }

    pub fn on_received(&mut self, rtt: Duration) {
        self.received += 1;
        if self.record {
            self.rtts.push(rtt);
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Point-in-time derived view; can be taken at any moment during or
    /// after a run.
    pub fn snapshot(
        &self,
        ip_addr: Option<IpAddr>,
        addr: &str,
    ) -> Statistics {
        // A session that never sent anything has no loss to speak of.
        // Duplicated replies can push received past sent; loss is clamped
        // at zero instead of going negative.
        let packet_loss = if self.sent == 0 {
            0.0
        } else {
            let lost = self.sent as f64 - self.received as f64;
            (lost / self.sent as f64 * 100.0).max(0.0)
        };

        let mut min = Duration::ZERO;
        let mut max = Duration::ZERO;
        let mut avg = Duration::ZERO;
        let mut stddev = Duration::ZERO;
        if let Some(first) = self.rtts.first() {
            min = *first;
            max = *first;
            let mut total = 0.0f64;
            for rtt in &self.rtts {
                min = min.min(*rtt);
                max = max.max(*rtt);
                total += rtt.as_secs_f64();
            }
            let mean = total / self.rtts.len() as f64;
            avg = Duration::from_secs_f64(mean);
            // Population formula, all in floating point so sub-microsecond
            // differences are not truncated away before the square root.
            let sumsquares: f64 = self
                .rtts
                .iter()
                .map(|rtt| {
                    let d = rtt.as_secs_f64() - mean;
                    d * d
                })
                .sum();
            stddev = Duration::from_secs_f64(
                (sumsquares / self.rtts.len() as f64).sqrt(),
            );
        }

        Statistics {
            packets_sent: self.sent,
            packets_recv: self.received,
            packet_loss,
            ip_addr,
            addr: addr.to_string(),
            rtts: self.rtts.clone(),
            min_rtt: min,
            avg_rtt: avg,
            max_rtt: max,
            stddev_rtt: stddev,
        }
    }
}

/// Statistics of a running or finished ping session.
#[derive(Debug, Clone)]
pub struct Statistics {
    /// Number of echo requests sent.
    pub packets_sent: u64,
    /// Number of accepted echo replies.
    pub packets_recv: u64,
    /// Loss percentage; 0 when nothing was sent.
    pub packet_loss: f64,
    /// Resolved address of the target, if resolution happened.
    pub ip_addr: Option<IpAddr>,
    /// Nominal address string the session was created with.
    pub addr: String,
    /// Recorded round-trip times, in arrival order. Empty when recording
    /// was disabled.
    pub rtts: Vec<Duration>,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub stddev_rtt: Duration,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} packets transmitted, {} packets received, {:.1}% packet \
             loss",
            self.packets_sent, self.packets_recv, self.packet_loss
        )?;
        write!(
            f,
            "round-trip min/avg/max/stddev = \
             {:.3}/{:.3}/{:.3}/{:.3} ms",
            self.min_rtt.as_secs_f64() * 1e3,
            self.avg_rtt.as_secs_f64() * 1e3,
            self.max_rtt.as_secs_f64() * 1e3,
            self.stddev_rtt.as_secs_f64() * 1e3,
        )
    }
}
