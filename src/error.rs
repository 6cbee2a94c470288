use thiserror::Error;

/// Errors surfaced across a single transport exchange.
///
/// Per the retry-loop design, only [`ExchangeError::Cancelled`] and the
/// dial/write/read variants ever reach the dispatcher; the dispatcher folds
/// all of them into a per-host failure count and never returns them to the
/// caller directly.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write to {addr} failed: {source}")]
    Write {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read from {addr} failed: {source}")]
    Read {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed DNS message: {0}")]
    Codec(#[from] hickory_proto::ProtoError),
    #[error("https transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("grpc transport error: {0}")]
    Grpc(#[from] tonic::Status),
    #[error("exchange cancelled")]
    Cancelled,
    #[error("{0}")]
    Shared(String),
}

/// Errors the dispatcher itself can return.
///
/// [`ProxyError::NoMatch`] is never constructed: a missing match is
/// represented as `Option::None` from `match_upstream`, exactly as spec.md
/// describes it ("Not an error; delegate to next middleware"). `Unreachable`
/// is constructed by the dispatch loop when it reaches a terminal
/// `Exhausted` state, and logged there — `serve_query` still returns an
/// owned SERVFAIL `Message` rather than propagating the error, since there
/// is no further middleware in this core to hand a `Result` to.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no upstream matches this query")]
    NoMatch,
    #[error("unreachable backend")]
    Unreachable,
}

/// Config-time errors, surfaced to the parser/validator rather than the
/// runtime dispatcher.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
}
