//! Transport layer implementations for the proxy.
//!
//! Provides the UDP and TCP listeners that receive DNS queries from
//! clients, run them through the dispatcher, and send back any reply it
//! produces. Each transport runs as one task; a stopped transport
//! retires its socket with the task, so running again means binding a
//! fresh transport value.

pub mod tcp;
pub mod udp;

use std::io;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Per-packet and per-connection errors that must not take a listener
/// down. On some platforms an ICMP unreachable from a previous send
/// surfaces as a reset on the next recv, and an accept can fail with an
/// abort when the peer hangs up mid-handshake. Anything outside this
/// list means the socket itself is unusable and the listener terminates.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
