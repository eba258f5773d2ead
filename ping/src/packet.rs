use std::time::{SystemTime, UNIX_EPOCH};

use common::Family;
use etherparse::{
    IcmpEchoHeader, Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type,
};

use crate::error::PingError;

/// First 8 payload bytes: big-endian nanosecond send timestamp.
pub const TIMESTAMP_LEN: usize = 8;
/// Next 8 payload bytes: big-endian session tracker.
pub const TRACKER_LEN: usize = 8;
/// Smallest payload that can carry both fields.
pub const MIN_PAYLOAD_LEN: usize = TIMESTAMP_LEN + TRACKER_LEN;

const PAD_BYTE: u8 = 0x01;

/// Outcome of decoding bytes read off the wire. Messages that parse fine
/// but are not echo replies (router chatter, our own requests looped back
/// on dgram sockets) are `Ignored`, which is not an error.
#[derive(Debug)]
pub enum Decoded {
    EchoReply {
        ident: u16,
        seq: u16,
        payload: Vec<u8>,
    },
    Ignored,
}

/// Wall clock in nanoseconds since the epoch, the unit embedded in every
/// outbound payload.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Builds the echo payload: timestamp, tracker, then filler up to `size`.
pub fn build_payload(
    timestamp_nanos: u64,
    tracker: u64,
    size: usize,
) -> Vec<u8> {
    let len = size.max(MIN_PAYLOAD_LEN);
    let mut payload = vec![PAD_BYTE; len];
    payload[..TIMESTAMP_LEN].copy_from_slice(&timestamp_nanos.to_be_bytes());
    payload[TIMESTAMP_LEN..MIN_PAYLOAD_LEN]
        .copy_from_slice(&tracker.to_be_bytes());
    payload
}

/// Reads the timestamp and tracker back out of a reply payload. Returns
/// `None` when the payload is too short to carry them.
pub fn read_payload(payload: &[u8]) -> Option<(u64, u64)> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return None;
    }
    let timestamp =
        u64::from_be_bytes(payload[..TIMESTAMP_LEN].try_into().ok()?);
    let tracker = u64::from_be_bytes(
        payload[TIMESTAMP_LEN..MIN_PAYLOAD_LEN].try_into().ok()?,
    );
    Some((timestamp, tracker))
}

/// Encodes a ready-to-send echo request for the given family.
///
/// The ICMPv4 checksum is computed here; for ICMPv6 the kernel fills it in
/// on send, so the header goes out with a zero checksum.
pub fn encode_echo_request(
    family: Family,
    ident: u16,
    seq: u16,
    tracker: u64,
    size: usize,
) -> Vec<u8> {
    let payload = build_payload(now_nanos(), tracker, size);
    let echo = IcmpEchoHeader { id: ident, seq };
    match family {
        Family::V4 => [
            Icmpv4Header::with_checksum(
                Icmpv4Type::EchoRequest(echo),
                payload.as_slice(),
            )
            .to_bytes()
            .as_slice(),
            payload.as_slice(),
        ]
        .concat(),
        Family::V6 => [
            Icmpv6Header::new(Icmpv6Type::EchoRequest(echo))
                .to_bytes()
                .as_slice(),
            payload.as_slice(),
        ]
        .concat(),
    }
}

/// Decodes received bytes into a typed message.
///
/// Fails with [`PingError::MalformedPacket`] only when the bytes cannot be
/// parsed as any ICMP message for the session's family.
pub fn decode(bytes: &[u8], family: Family) -> Result<Decoded, PingError> {
    match family {
        Family::V4 => {
            let (header, rest) = Icmpv4Header::from_slice(bytes)
                .map_err(|e| PingError::MalformedPacket(e.to_string()))?;
            match header.icmp_type {
                Icmpv4Type::EchoReply(echo) => Ok(Decoded::EchoReply {
                    ident: echo.id,
                    seq: echo.seq,
                    payload: rest.to_vec(),
                }),
                _ => Ok(Decoded::Ignored),
            }
        }
        Family::V6 => {
            let (header, rest) = Icmpv6Header::from_slice(bytes)
                .map_err(|e| PingError::MalformedPacket(e.to_string()))?;
            match header.icmp_type {
                Icmpv6Type::EchoReply(echo) => Ok(Decoded::EchoReply {
                    ident: echo.id,
                    seq: echo.seq,
                    payload: rest.to_vec(),
                }),
                _ => Ok(Decoded::Ignored),
            }
        }
    }
}
