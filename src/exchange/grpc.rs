use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use crate::config::GrpcTlsConfig;
use crate::error::ExchangeError;
use crate::request::QueryContext;

use super::Exchanger;

pub mod pb {
    tonic::include_proto!("prx_dns");
}

use pb::dns_exchange_client::DnsExchangeClient;
use pb::DnsExchangeRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC unary exchanger, dialing a fresh channel per exchange rather than
/// pooling (spec.md §4.5 Non-goals: "no persistent upstream connection
/// pooling"). TLS is optional per upstream, matching the Corefile's
/// `grpc://` vs `grpcs://` scheme distinction.
pub struct GrpcExchanger {
    tls: Option<ClientTlsConfig>,
}

impl GrpcExchanger {
    pub fn new(tls: Option<GrpcTlsConfig>) -> anyhow::Result<Self> {
        let tls = tls.map(build_tls_config).transpose()?;
        Ok(Self { tls })
    }
}

fn build_tls_config(cfg: GrpcTlsConfig) -> anyhow::Result<ClientTlsConfig> {
    let cert = std::fs::read(&cfg.cert)?;
    let key = std::fs::read(&cfg.key)?;
    let mut tls = ClientTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca_path) = &cfg.ca {
        let ca = std::fs::read(ca_path)?;
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }

    Ok(tls)
}

#[async_trait]
impl Exchanger for GrpcExchanger {
    async fn exchange(
        &self,
        _ctx: &QueryContext,
        host: &str,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let endpoint = Channel::from_shared(format!("{scheme}://{host}"))
            .map_err(|err| ExchangeError::Shared(err.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(super::DEFAULT_TIMEOUT);

        let endpoint = match &self.tls {
            Some(tls) => endpoint
                .tls_config(tls.clone())
                .map_err(|err| ExchangeError::Shared(err.to_string()))?,
            None => endpoint,
        };

        let channel = endpoint
            .connect()
            .await
            .map_err(|err| ExchangeError::Dial {
                addr: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, err.to_string()),
            })?;

        let mut client = DnsExchangeClient::new(channel);
        let wire_message = request.to_vec()?;
        let response = client
            .exchange(DnsExchangeRequest { wire_message })
            .await?
            .into_inner();

        Message::from_vec(&response.wire_message).map_err(ExchangeError::from)
    }

    fn protocol(&self) -> &'static str {
        "grpc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_exchanger_has_no_tls_config() {
        let exchanger = GrpcExchanger::new(None).unwrap();
        assert!(exchanger.tls.is_none());
    }
}
