//! ICMP echo ("ping") client library.
//!
//! A [`Pinger`] drives one session against one target: it schedules echo
//! requests on a fixed interval, matches replies back to the session via
//! the tracker embedded in every payload, and aggregates round-trip
//! statistics. Callers get per-packet events through an [`Observer`] and a
//! final [`Statistics`] snapshot.
//!
//! Unprivileged processes use datagram ICMP sockets; pass
//! `privileged: true` in [`PingConfig`] to use raw sockets instead.

pub mod config;
pub mod error;
pub mod packet;
pub mod session;
pub mod stats;
pub mod transport;

pub use common::{Datagram, Family, Mode};
pub use config::{load_file, PingConfig, TargetSpec};
pub use error::PingError;
pub use session::{NopObserver, Observer, Packet, Pinger};
pub use stats::Statistics;
pub use transport::{PingRx, PingTx};
