use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RecordType};

/// The L4 protocol the inbound client used, carried through only as a
/// metric label (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProto {
    Udp,
    Tcp,
}

impl ClientProto {
    pub fn as_label(self) -> &'static str {
        match self {
            ClientProto::Udp => "udp",
            ClientProto::Tcp => "tcp",
        }
    }
}

/// The coalescing key for single-flight: normalized query name, type, and
/// class (spec.md §3 "Request fingerprint").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl RequestFingerprint {
    pub fn from_message(message: &Message) -> Option<Self> {
        let query = message.queries().first()?;
        Some(Self {
            name: query.name().to_ascii().to_ascii_lowercase(),
            qtype: u16::from(query.query_type()),
            qclass: u16::from(query.query_class()),
        })
    }

    pub fn query_type(&self) -> RecordType {
        RecordType::from(self.qtype)
    }

    pub fn query_class(&self) -> DNSClass {
        DNSClass::from(self.qclass)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-query context threaded through the dispatcher and every exchanger.
pub struct QueryContext {
    pub client_proto: ClientProto,
    pub fingerprint: Option<RequestFingerprint>,
    pub span: tracing::Span,
}

impl QueryContext {
    pub fn new(client_proto: ClientProto, request: &Message) -> Self {
        let fingerprint = RequestFingerprint::from_message(request);
        let span = tracing::info_span!(
            "query",
            proto = client_proto.as_label(),
            name = fingerprint.as_ref().map(RequestFingerprint::name).unwrap_or("?"),
        );
        Self {
            client_proto,
            fingerprint,
            span,
        }
    }
}
