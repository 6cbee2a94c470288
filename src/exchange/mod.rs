mod dns;
mod google;
mod grpc;

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::config::ProtocolConfig;
use crate::error::ExchangeError;
use crate::request::QueryContext;

pub use dns::DnsExchanger;
pub use google::GoogleExchanger;
pub use grpc::GrpcExchanger;

/// Wire-level request/reply capability, adopted as `(ctx, addr, request)`
/// per spec.md §9's Open Question resolution (see DESIGN.md).
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(
        &self,
        ctx: &QueryContext,
        host: &str,
        request: &Message,
    ) -> Result<Message, ExchangeError>;

    fn protocol(&self) -> &'static str;
}

/// Builds the exchanger bound to an upstream's configured `protocol`
/// directive (spec.md §6 table).
pub fn build_exchanger(protocol: &ProtocolConfig) -> anyhow::Result<Arc<dyn Exchanger>> {
    Ok(match protocol {
        ProtocolConfig::Dns => Arc::new(DnsExchanger::new()),
        ProtocolConfig::HttpsGoogle { bootstrap } => Arc::new(GoogleExchanger::new(bootstrap.clone())?),
        ProtocolConfig::Grpc { tls } => Arc::new(GrpcExchanger::new(tls.clone())?),
    })
}

pub(crate) const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
