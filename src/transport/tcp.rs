//! TCP transport for DNS queries.
//!
//! TCP DNS messages are prefixed with a 2-byte big-endian length. The
//! accept loop serves one connection at a time, start to finish, before
//! accepting the next: one query read, one dispatch, one reply written,
//! connection closed. The serial loop is a deliberate, known limitation
//! of this proxy, not an oversight; a per-connection deadline keeps a
//! stalled client from wedging shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;

use super::{MAX_DNS_PACKET_SIZE, is_transient};

/// Deadline for one complete client exchange.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP listener for the proxy.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the serial accept loop.
    pub fn start(self, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run(self.listener, dispatcher, shutdown))
    }
}

async fn run(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("TCP listener stopping");
                break;
            }
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "transient TCP accept error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "fatal TCP socket error, listener terminating");
                    break;
                }
            }
        };

        match tokio::time::timeout(CONNECTION_TIMEOUT, serve_connection(stream, &dispatcher)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "TCP connection error"),
            Err(_) => debug!(peer = %peer, "TCP connection timed out"),
        }
    }
}

/// Handle a single connection: read one query, dispatch, write back any
/// reply, done.
async fn serve_connection(mut stream: TcpStream, dispatcher: &Dispatcher) -> io::Result<()> {
    let Some(query) = read_query(&mut stream).await? else {
        return Ok(());
    };

    if let Some(reply) = dispatcher.handle(&query).await {
        write_reply(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Read one length-prefixed DNS message and return its payload without
/// the prefix. `None` on early EOF, zero-length frames, or oversized
/// messages.
async fn read_query(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let mut total_read = 0;

    loop {
        let n = stream.read(&mut buf[total_read..]).await?;
        if n == 0 {
            return Ok(None);
        }
        total_read += n;

        if total_read >= 2 {
            let msg_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if msg_len == 0 || 2 + msg_len > buf.len() {
                return Ok(None);
            }
            if total_read >= 2 + msg_len {
                buf.truncate(2 + msg_len);
                buf.drain(..2);
                return Ok(Some(buf));
            }
        }

        if total_read == buf.len() {
            return Ok(None);
        }
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &[u8]) -> io::Result<()> {
    stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
    stream.write_all(reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{LogLevel, Rule, RuleSet, Strategy};
    use crate::upstream::{Upstream, UpstreamError};
    use arc_swap::ArcSwap;
    use async_trait::async_trait;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RData, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    struct NoUpstream;

    #[async_trait]
    impl Upstream for NoUpstream {
        async fn lookup_a(&self, _name: &Name) -> Result<Vec<Ipv4Addr>, UpstreamError> {
            Err(UpstreamError::Lookup("unused".to_string()))
        }
    }

    fn respond_dispatcher(answer: Ipv4Addr) -> Arc<Dispatcher> {
        let mut set = RuleSet::default();
        set.push_rule(
            Rule::new(".*", Strategy::Respond, Some(answer), LogLevel::default()).unwrap(),
        );
        Arc::new(Dispatcher::new(
            Arc::new(ArcSwap::from_pointee(set)),
            Arc::new(NoUpstream),
        ))
    }

    fn framed_query(name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x7777);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(Query::query(
            Name::from_str(name).unwrap(),
            RecordType::A,
        ));
        let payload = message.to_bytes().unwrap();
        let mut framed = (payload.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&payload);
        framed
    }

    #[tokio::test]
    async fn serves_length_prefixed_exchange() {
        let answer = Ipv4Addr::new(198, 51, 100, 4);
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = transport.start(respond_dispatcher(answer), shutdown.clone());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&framed_query("a.test")).await.unwrap();

        let mut prefix = [0u8; 2];
        client.read_exact(&mut prefix).await.unwrap();
        let len = u16::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();

        let reply = Message::from_bytes(&payload).unwrap();
        assert_eq!(reply.id(), 0x7777);
        let ips: Vec<_> = reply
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                RData::A(a) => Some(a.0),
                _ => None,
            })
            .collect();
        assert_eq!(ips, [answer]);

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn connections_are_served_one_after_another() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = transport.start(respond_dispatcher(Ipv4Addr::LOCALHOST), shutdown.clone());

        // Two sequential exchanges must both succeed on a fresh
        // connection each.
        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&framed_query("b.test")).await.unwrap();
            let mut prefix = [0u8; 2];
            client.read_exact(&mut prefix).await.unwrap();
            let mut payload = vec![0u8; u16::from_be_bytes(prefix) as usize];
            client.read_exact(&mut payload).await.unwrap();
            assert!(Message::from_bytes(&payload).is_ok());
        }

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn truncated_frame_closes_without_reply() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = transport.start(respond_dispatcher(Ipv4Addr::LOCALHOST), shutdown.clone());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Length prefix promising more bytes than we send.
        client.write_all(&[0x00, 0x40, 0x01, 0x02]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        shutdown.cancel();
        let _ = task.await;
    }
}
