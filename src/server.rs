use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, warn};

use crate::dispatch;
use crate::registry::Registry;
use crate::request::{ClientProto, QueryContext};

const MAX_UDP_DATAGRAM: usize = 4096;

/// Binds and serves one UDP listener, decoding each inbound datagram,
/// spawning one task per query (spec.md §5: "each query handled on its
/// own task"), and writing the reply back to the sender's address.
pub async fn serve_udp(addr: &str, registry: Arc<Registry>, try_duration: Duration) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    loop {
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "udp recv_from failed");
                continue;
            }
        };
        buf.truncate(n);

        let registry = registry.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let request = match Message::from_vec(&buf) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, peer = %peer, "dropping malformed udp query");
                    return;
                }
            };

            let ctx = QueryContext::new(ClientProto::Udp, &request);
            let reply = dispatch::serve_query(&registry, ctx, &request, try_duration).await;

            match reply.to_vec() {
                Ok(wire) => {
                    if let Err(err) = socket.send_to(&wire, peer).await {
                        warn!(error = %err, peer = %peer, "udp send_to failed");
                    }
                }
                Err(err) => error!(error = %err, "failed to encode udp reply"),
            }
        });
    }
}

/// Binds and serves one TCP listener using RFC 1035's 2-byte
/// length-prefixed framing, one spawned task per accepted connection and
/// one further spawned task per query on that connection (a TCP client
/// may pipeline several queries over one connection).
pub async fn serve_tcp(addr: &str, registry: Arc<Registry>, try_duration: Duration) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "tcp accept failed");
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_connection(stream, registry, try_duration).await {
                warn!(error = %err, peer = %peer, "tcp connection closed with error");
            }
        });
    }
}

async fn handle_tcp_connection(mut stream: TcpStream, registry: Arc<Registry>, try_duration: Duration) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut request_buf = vec![0u8; len];
        stream.read_exact(&mut request_buf).await?;

        let request = match Message::from_vec(&request_buf) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed tcp query");
                continue;
            }
        };

        let ctx = QueryContext::new(ClientProto::Tcp, &request);
        let reply = dispatch::serve_query(&registry, ctx, &request, try_duration).await;

        let wire = reply.to_vec()?;
        let len = wire.len() as u16;
        let mut framed = Vec::with_capacity(wire.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&wire);
        stream.write_all(&framed).await?;
    }
}
