use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::DEFAULT_TIMEOUT;
use crate::error::ExchangeError;
use crate::request::{ClientProto, QueryContext};
use crate::singleflight::SingleflightGroup;

use super::Exchanger;

const MIN_MSG_SIZE: u16 = 512;

/// Plain DNS over UDP/TCP, matching the client's own protocol
/// (spec.md §4.5 "Plain DNS exchanger"). Concurrent identical queries are
/// coalesced through a single-flight group keyed on (name, type, class).
pub struct DnsExchanger {
    group: SingleflightGroup<crate::request::RequestFingerprint, Message, ExchangeError>,
}

impl DnsExchanger {
    pub fn new() -> Self {
        Self {
            group: SingleflightGroup::new(),
        }
    }
}

impl Default for DnsExchanger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchanger for DnsExchanger {
    async fn exchange(
        &self,
        ctx: &QueryContext,
        host: &str,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let wire = request.to_vec()?;
        let udp_size = request
            .edns()
            .map(|edns| edns.max_payload())
            .filter(|&size| size >= MIN_MSG_SIZE)
            .unwrap_or(MIN_MSG_SIZE);
        let client_proto = ctx.client_proto;
        let host_owned = host.to_string();

        let shared = match &ctx.fingerprint {
            Some(fingerprint) => self
                .group
                .do_call(fingerprint.clone(), move || {
                    exchange_wire(host_owned, client_proto, wire, udp_size)
                })
                .await
                .map_err(|shared_err| ExchangeError::Shared(shared_err.to_string()))?,
            // A question-less message (e.g. a malformed packet) cannot be
            // coalesced meaningfully; exchange it directly.
            None => std::sync::Arc::new(exchange_wire(host_owned, client_proto, wire, udp_size).await?),
        };

        // The shared reply must be deep-copied before mutation since other
        // callers may be observing the same Arc (spec.md §9 "Shared-by-
        // reference reply from single-flight").
        let mut reply = (*shared).clone();
        reply.set_id(request.id());
        Ok(reply)
    }

    fn protocol(&self) -> &'static str {
        "dns"
    }
}

async fn exchange_wire(
    addr: String,
    proto: ClientProto,
    wire: Vec<u8>,
    udp_size: u16,
) -> Result<Message, ExchangeError> {
    let socket_addr: SocketAddr = addr.parse().map_err(|_| ExchangeError::Dial {
        addr: addr.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid upstream address"),
    })?;

    let bytes = tokio::time::timeout(DEFAULT_TIMEOUT, async {
        match proto {
            ClientProto::Udp => exchange_udp(socket_addr, &wire, udp_size).await,
            ClientProto::Tcp => exchange_tcp(socket_addr, &wire).await,
        }
    })
    .await
    .map_err(|_| ExchangeError::Cancelled)??;

    Message::from_vec(&bytes).map_err(ExchangeError::from)
}

async fn exchange_udp(addr: SocketAddr, wire: &[u8], udp_size: u16) -> Result<Vec<u8>, ExchangeError> {
    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|source| ExchangeError::Dial {
        addr: addr.to_string(),
        source,
    })?;
    socket.connect(addr).await.map_err(|source| ExchangeError::Dial {
        addr: addr.to_string(),
        source,
    })?;
    socket.send(wire).await.map_err(|source| ExchangeError::Write {
        addr: addr.to_string(),
        source,
    })?;

    let mut buf = vec![0u8; udp_size.max(MIN_MSG_SIZE) as usize];
    let n = socket.recv(&mut buf).await.map_err(|source| ExchangeError::Read {
        addr: addr.to_string(),
        source,
    })?;
    buf.truncate(n);
    Ok(buf)
}

async fn exchange_tcp(addr: SocketAddr, wire: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    let mut stream = TcpStream::connect(addr).await.map_err(|source| ExchangeError::Dial {
        addr: addr.to_string(),
        source,
    })?;

    let len = wire.len() as u16;
    let mut framed = Vec::with_capacity(wire.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(wire);
    stream.write_all(&framed).await.map_err(|source| ExchangeError::Write {
        addr: addr.to_string(),
        source,
    })?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(|source| ExchangeError::Read {
        addr: addr.to_string(),
        source,
    })?;
    let reply_len = u16::from_be_bytes(len_buf) as usize;

    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await.map_err(|source| ExchangeError::Read {
        addr: addr.to_string(),
        source,
    })?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::net::UdpSocket as TokioUdpSocket;

    fn request_for(name: &str, id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    #[tokio::test]
    async fn exchange_overwrites_reply_id_with_caller_request_id() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut reply = query.clone();
            reply.set_id(0xBEEF);
            reply.set_message_type(MessageType::Response);
            let wire = reply.to_vec().unwrap();
            server.send_to(&wire, peer).await.unwrap();
        });

        let exchanger = DnsExchanger::new();
        let request = request_for("example.com.", 0x1234);
        let ctx = QueryContext::new(ClientProto::Udp, &request);

        let reply = exchanger
            .exchange(&ctx, &server_addr.to_string(), &request)
            .await
            .expect("exchange should succeed");

        assert_eq!(reply.id(), 0x1234);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_identical_queries_issue_one_wire_exchange() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_responder = hits.clone();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (n, peer) = match server.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                hits_responder.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                let query = Message::from_vec(&buf[..n]).unwrap();
                let mut reply = query.clone();
                reply.set_message_type(MessageType::Response);
                let wire = reply.to_vec().unwrap();
                let _ = server.send_to(&wire, peer).await;
            }
        });

        let exchanger = std::sync::Arc::new(DnsExchanger::new());
        let mut handles = Vec::new();
        for i in 0..20u16 {
            let exchanger = exchanger.clone();
            let addr = server_addr.to_string();
            handles.push(tokio::spawn(async move {
                let request = request_for("coalesced.example.", i);
                let ctx = QueryContext::new(ClientProto::Udp, &request);
                let reply = exchanger.exchange(&ctx, &addr, &request).await.unwrap();
                assert_eq!(reply.id(), i);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        responder.abort();
    }
}
