use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::Deserialize;
use tracing::warn;

use super::DEFAULT_TIMEOUT;
use super::dns::DnsExchanger;
use super::Exchanger;
use crate::error::ExchangeError;
use crate::request::{ClientProto, QueryContext};

const REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const DOH_HOST: &str = "dns.google";

/// DNS-over-HTTPS to Google's JSON API, bootstrapping and periodically
/// re-resolving its own endpoint addresses through a configurable list of
/// plain-DNS bootstrap nameservers (spec.md §4.5 "HTTPS-to-Google
/// exchanger"). The resolved address list is published through an
/// `ArcSwap`, matching the hot-swap pattern spec.md §4.2/§9 describes.
pub struct GoogleExchanger {
    http: reqwest::Client,
    endpoints: Arc<ArcSwap<Vec<String>>>,
    cursor: AtomicUsize,
    _refresh_task: tokio::task::JoinHandle<()>,
}

impl GoogleExchanger {
    pub fn new(bootstrap: Vec<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        let endpoints: Arc<ArcSwap<Vec<String>>> = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let refresh_endpoints = endpoints.clone();
        let refresh_bootstrap = bootstrap.clone();
        let refresh_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                match resolve_endpoints(&refresh_bootstrap).await {
                    Ok(resolved) if !resolved.is_empty() => {
                        refresh_endpoints.store(Arc::new(resolved));
                    }
                    Ok(_) => warn!("google DoH bootstrap resolved zero endpoints"),
                    Err(err) => warn!(error = %err, "failed to refresh google DoH endpoints"),
                }
            }
        });

        Ok(Self {
            http,
            endpoints,
            cursor: AtomicUsize::new(0),
            _refresh_task: refresh_task,
        })
    }

    fn pick_endpoint(&self) -> Option<String> {
        let snapshot = self.endpoints.load_full();
        if snapshot.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        Some(snapshot[idx].clone())
    }
}

/// Resolves `dns.google.`'s A records against the first reachable
/// bootstrap nameserver, matching the original's default
/// `8.8.8.8:53`, `8.8.4.4:53` bootstrap list.
async fn resolve_endpoints(bootstrap: &[String]) -> Result<Vec<String>, ExchangeError> {
    let exchanger = DnsExchanger::new();
    let mut request = Message::new();
    request.set_message_type(MessageType::Query);
    request.add_query(hickory_proto::op::Query::query(
        Name::from_str(DOH_HOST).expect("dns.google. is a valid name"),
        RecordType::A,
    ));

    let mut last_err = None;
    for host in bootstrap {
        let ctx = QueryContext::new(ClientProto::Udp, &request);
        match exchanger.exchange(&ctx, host, &request).await {
            Ok(reply) => {
                let ips: Vec<String> = reply
                    .answers()
                    .iter()
                    .filter_map(|record| match record.data() {
                        Some(RData::A(a)) => Some(a.0.to_string()),
                        _ => None,
                    })
                    .collect();
                if !ips.is_empty() {
                    return Ok(ips);
                }
            }
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl Exchanger for GoogleExchanger {
    async fn exchange(
        &self,
        _ctx: &QueryContext,
        _host: &str,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let query = request.queries().first().ok_or_else(|| {
            ExchangeError::Shared("request has no question to forward".to_string())
        })?;

        // Before the bootstrap refresh task has resolved its first endpoint
        // there is nothing to pin `dns.google` to; fall back to the HTTP
        // client's normal hostname resolution rather than forcing a
        // hostname through `SocketAddr::parse` (which can never succeed).
        let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(endpoint) = self.pick_endpoint() {
            let addr = format!("{endpoint}:443")
                .parse()
                .map_err(|_| ExchangeError::Shared(format!("invalid google endpoint {endpoint}")))?;
            builder = builder.resolve(DOH_HOST, addr);
        }
        let client = builder.build()?;

        let name = query.name().to_ascii();
        let qtype = u16::from(query.query_type());
        let response = client
            .get(format!("https://{DOH_HOST}/resolve"))
            .query(&[("name", name.as_str()), ("type", &qtype.to_string())])
            .send()
            .await?;

        let body: GoogleDohResponse = response.json().await?;
        body.into_message(request)
    }

    fn protocol(&self) -> &'static str {
        "https_google"
    }
}

#[derive(Debug, Deserialize)]
struct GoogleDohResponse {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "TC", default)]
    truncated: bool,
    #[serde(rename = "Answer", default)]
    answer: Vec<GoogleDohAnswer>,
}

#[derive(Debug, Deserialize)]
struct GoogleDohAnswer {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

impl GoogleDohResponse {
    fn into_message(self, request: &Message) -> Result<Message, ExchangeError> {
        let mut reply = Message::new();
        reply.set_id(request.id());
        reply.set_message_type(MessageType::Response);
        reply.set_truncated(self.truncated);
        reply.set_response_code(ResponseCode::from(0, self.status as u16));
        for query in request.queries() {
            reply.add_query(query.clone());
        }

        for answer in self.answer {
            match build_record(&answer) {
                Ok(record) => reply.add_answer(record),
                Err(()) => warn!(rtype = answer.rtype, "unsupported google DoH record type dropped"),
            }
        }

        Ok(reply)
    }
}

fn build_record(answer: &GoogleDohAnswer) -> Result<Record, ()> {
    let name = Name::from_str(&answer.name).map_err(|_| ())?;
    let rtype = RecordType::from(answer.rtype);
    let rdata = match rtype {
        RecordType::A => RData::A(A(Ipv4Addr::from_str(&answer.data).map_err(|_| ())?)),
        RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::from_str(&answer.data).map_err(|_| ())?)),
        RecordType::CNAME => RData::CNAME(CNAME(Name::from_str(&answer.data).map_err(|_| ())?)),
        RecordType::NS => RData::NS(NS(Name::from_str(&answer.data).map_err(|_| ())?)),
        RecordType::TXT => RData::TXT(TXT::new(vec![answer.data.clone()])),
        RecordType::MX => {
            let mut parts = answer.data.splitn(2, ' ');
            let preference: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
            let exchange = Name::from_str(parts.next().ok_or(())?).map_err(|_| ())?;
            RData::MX(MX::new(preference, exchange))
        }
        _ => return Err(()),
    };
    Ok(Record::from_rdata(name, answer.ttl, rdata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_an_a_answer_into_a_record() {
        let answer = GoogleDohAnswer {
            name: "example.com.".to_string(),
            rtype: 1,
            ttl: 300,
            data: "93.184.216.34".to_string(),
        };
        let record = build_record(&answer).unwrap();
        assert_eq!(record.record_type(), RecordType::A);
    }

    #[test]
    fn unsupported_type_is_dropped_not_fatal() {
        let answer = GoogleDohAnswer {
            name: "example.com.".to_string(),
            rtype: 99,
            ttl: 300,
            data: "unused".to_string(),
        };
        assert!(build_record(&answer).is_err());
    }

    #[tokio::test]
    async fn pick_endpoint_is_none_before_the_bootstrap_refresh_completes() {
        // `bootstrap` is unreachable, so the background refresh task never
        // populates `endpoints`; a query arriving in this window must not
        // get stuck trying to pin a hostname as if it were a resolved IP.
        let exchanger = GoogleExchanger::new(vec!["127.0.0.1:1".to_string()]).unwrap();
        assert!(exchanger.pick_endpoint().is_none());
    }

    #[tokio::test]
    async fn pick_endpoint_round_robins_once_populated() {
        let exchanger = GoogleExchanger::new(Vec::new()).unwrap();
        exchanger
            .endpoints
            .store(Arc::new(vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]));

        let picks: Vec<_> = (0..4).map(|_| exchanger.pick_endpoint().unwrap()).collect();
        assert_eq!(picks, vec!["8.8.8.8", "8.8.4.4", "8.8.8.8", "8.8.4.4"]);
    }
}
