use std::io;

use thiserror::Error;

/// Everything that can go wrong inside a ping session.
///
/// Only `ResolutionFailed`, `OpenFailed` and `ReceiveFatal` terminate a
/// run. `MalformedPacket` and `SendFailed` are absorbed by the engine and
/// forwarded to [`Observer::on_error`](crate::Observer::on_error); read
/// timeouts are part of normal operation and never show up here.
/// `InvalidConfig` and `AlreadyFinished` reject a run before it starts.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("failed to resolve `{addr}`: {reason}")]
    ResolutionFailed { addr: String, reason: String },

    #[error("failed to open icmp endpoint: {0}")]
    OpenFailed(#[source] io::Error),

    #[error("malformed icmp packet: {0}")]
    MalformedPacket(String),

    #[error("failed to send echo request: {0}")]
    SendFailed(#[source] io::Error),

    #[error("fatal receive error: {0}")]
    ReceiveFatal(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session already finished; create a new pinger to run again")]
    AlreadyFinished,
}
