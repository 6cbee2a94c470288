use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::{Instrument, warn};

use crate::error::ProxyError;
use crate::metrics;
use crate::registry::{self, Registry};
use crate::request::QueryContext;

/// Drives one query through `Matching -> Selecting -> Exchanging ->
/// (Success | Retrying | Exhausted)` (spec.md §4.7), bounded by
/// `try_duration`. Returns a reply message in every case; a SERVFAIL (no
/// matching upstream or retry budget exhausted) is represented the same
/// way a successful exchange is — as an owned `Message` — since there is
/// no further middleware in this core to delegate to.
pub async fn serve_query(registry: &Registry, ctx: QueryContext, request: &Message, try_duration: Duration) -> Message {
    let span = ctx.span.clone();
    async move {
        let Some(fingerprint) = ctx.fingerprint.as_ref() else {
            return refuse(request);
        };
        let name = fingerprint.name().to_string();

        let dispatch_started = Instant::now();
        let deadline = dispatch_started + try_duration;
        loop {
            let snapshot = registry.snapshot();
            let Some(upstream) = registry::match_upstream(&snapshot, &name) else {
                return refuse(request);
            };

            let Some(host) = upstream.select() else {
                warn!(zone = %upstream.from, error = %ProxyError::Unreachable, "no healthy host available");
                observe_exhausted(&ctx, upstream.exchanger.protocol(), &upstream.from, dispatch_started);
                break;
            };

            host.inc_conns();
            let started = Instant::now();
            let outcome = upstream.exchanger.exchange(&ctx, host.name(), request).await;
            host.dec_conns();

            match outcome {
                Ok(reply) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    metrics::observe_request_duration(
                        ctx.client_proto.as_label(),
                        upstream.exchanger.protocol(),
                        &upstream.from,
                        elapsed_ms,
                    );
                    return reply;
                }
                Err(err) => {
                    warn!(host = host.name(), zone = %upstream.from, error = %err, "exchange failed, counting as a failure");
                    host.record_failure();
                    metrics::inc_upstream_error(&upstream.from, host.name(), "exchange");
                    metrics::set_upstream_down(&upstream.from, host.name(), host.is_down());
                }
            }

            if Instant::now() >= deadline {
                warn!(zone = %upstream.from, error = %ProxyError::Unreachable, "retry budget exhausted");
                observe_exhausted(&ctx, upstream.exchanger.protocol(), &upstream.from, dispatch_started);
                break;
            }
        }

        servfail(request)
    }
    .instrument(span)
    .await
}

/// Emits the `request_duration_milliseconds` observation for a terminal
/// `Exhausted` transition (spec.md §4.7: "Terminal state Exhausted always
/// emits the duration metric before returning"), covering both the
/// `Select()` returning nil and the retry budget elapsing.
fn observe_exhausted(ctx: &QueryContext, upstream_proto: &str, upstream_from: &str, dispatch_started: Instant) {
    let elapsed_ms = dispatch_started.elapsed().as_secs_f64() * 1000.0;
    metrics::observe_request_duration(ctx.client_proto.as_label(), upstream_proto, upstream_from, elapsed_ms);
}

fn refuse(request: &Message) -> Message {
    terminal_reply(request, ResponseCode::Refused)
}

fn servfail(request: &Message) -> Message {
    terminal_reply(request, ResponseCode::ServFail)
}

fn terminal_reply(request: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_response_code(rcode);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyKind, PrxDnsConfig, ProtocolConfig, UpstreamConfig};
    use crate::request::ClientProto;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::net::UdpSocket;

    fn request_for(name: &str) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    fn config_with(to: Vec<String>) -> PrxDnsConfig {
        config_with_from(".", to)
    }

    fn config_with_from(from: &str, to: Vec<String>) -> PrxDnsConfig {
        PrxDnsConfig {
            server: Default::default(),
            observability: Default::default(),
            upstreams: vec![UpstreamConfig {
                from: from.to_string(),
                to,
                policy: PolicyKind::Random,
                fail_timeout: Duration::from_secs(10),
                max_fails: 1,
                spray: false,
                without: String::new(),
                except: Vec::new(),
                protocol: ProtocolConfig::Dns,
                health_check: None,
            }],
        }
    }

    #[tokio::test]
    async fn no_match_returns_refused() {
        let config = PrxDnsConfig {
            server: Default::default(),
            observability: Default::default(),
            upstreams: vec![UpstreamConfig {
                from: "internal.example.".to_string(),
                to: vec!["127.0.0.1:1".to_string()],
                policy: PolicyKind::Random,
                fail_timeout: Duration::from_secs(10),
                max_fails: 1,
                spray: false,
                without: String::new(),
                except: Vec::new(),
                protocol: ProtocolConfig::Dns,
                health_check: None,
            }],
        };
        let registry = Registry::from_config(&config).unwrap();
        let request = request_for("example.com.");
        let ctx = QueryContext::new(ClientProto::Udp, &request);

        let reply = serve_query(&registry, ctx, &request, Duration::from_millis(50)).await;
        assert_eq!(reply.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn happy_path_returns_upstream_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut reply = query.clone();
            reply.set_message_type(MessageType::Response);
            let wire = reply.to_vec().unwrap();
            server.send_to(&wire, peer).await.unwrap();
        });

        let config = config_with(vec![server_addr.to_string()]);
        let registry = Registry::from_config(&config).unwrap();
        let request = request_for("example.com.");
        let ctx = QueryContext::new(ClientProto::Udp, &request);

        let reply = serve_query(&registry, ctx, &request, Duration::from_secs(1)).await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn all_hosts_down_returns_servfail() {
        let config = config_with(vec!["127.0.0.1:1".to_string()]);
        let registry = Registry::from_config(&config).unwrap();
        let request = request_for("example.com.");
        let ctx = QueryContext::new(ClientProto::Udp, &request);

        let reply = serve_query(&registry, ctx, &request, Duration::from_millis(200)).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn exhausted_terminal_states_emit_a_duration_observation() {
        // A distinct zone per test keeps the assertion below immune to the
        // process-wide prometheus registry accumulating samples from other
        // tests in this module.
        let down_zone = "exhausted-metrics-down.example.";
        let config = config_with_from(down_zone, vec!["127.0.0.1:1".to_string()]);
        let registry = Registry::from_config(&config).unwrap();

        // First query: one failed exchange crosses max_fails, driving the
        // `Retrying -> Exhausted` budget-expiry path on the next iteration.
        let request = request_for("one.exhausted-metrics-down.example.");
        let ctx = QueryContext::new(ClientProto::Udp, &request);
        let reply = serve_query(&registry, ctx, &request, Duration::from_millis(200)).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);

        // Second query: the host is already down, so Select() returns nil on
        // the very first iteration (`Selecting -> Exhausted`).
        let request = request_for("two.exhausted-metrics-down.example.");
        let ctx = QueryContext::new(ClientProto::Udp, &request);
        let reply = serve_query(&registry, ctx, &request, Duration::from_millis(200)).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);

        let metrics_text = crate::metrics::gather_text().unwrap();
        let label = format!("upstream_from=\"{down_zone}\"");
        assert!(
            metrics_text.contains(&label),
            "expected a request_duration_milliseconds observation labelled with {down_zone}, got:\n{metrics_text}"
        );
    }
}
