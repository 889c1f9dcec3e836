//! UDP transport for DNS queries.
//!
//! Handles connectionless DNS queries over UDP. Each datagram is parsed
//! and dispatched inline; a reply, when the dispatcher produces one, goes
//! back to the datagram's source address. Queries the dispatcher drops
//! (blocked, malformed, failed forward) get no packet at all.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;

use super::{MAX_DNS_PACKET_SIZE, is_transient};

/// UDP listener for the proxy.
///
/// Bound once; [`start`](Self::start) consumes the transport and hands
/// the socket to the listener task, which owns it until shutdown.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// The actually bound address (distinct from the requested one when
    /// binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts the receive loop. The task runs until `shutdown` is
    /// cancelled or the socket becomes unusable.
    pub fn start(self, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, dispatcher, shutdown))
    }
}

/// Main event loop for the UDP transport.
async fn run(socket: UdpSocket, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("UDP listener stopping");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "transient UDP recv error");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "fatal UDP socket error, listener terminating");
                        break;
                    }
                };

                if let Some(reply) = dispatcher.handle(&buf[..len]).await {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        warn!(error = %e, peer = %src, "UDP send error");
                    }
                }
            }
        }
    }
    // Socket dropped here; the retired listener cannot be restarted.
}
