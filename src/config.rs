use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, bail};
use hickory_proto::rr::Name;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct PrxDnsConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(rename = "upstream", default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl PrxDnsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse TOML config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upstreams.is_empty() {
            bail!("config must include at least one [[upstream]] block");
        }

        for upstream in &self.upstreams {
            if upstream.to.is_empty() {
                bail!("upstream '{}' must list at least one host in `to`", upstream.from);
            }
            if upstream.from.trim().is_empty() || Name::from_str(&upstream.from).is_err() {
                return Err(ConfigError::InvalidDomain(upstream.from.clone()).into());
            }
            if upstream.max_fails < 0 {
                bail!("upstream '{}' max_fails must be >= 0", upstream.from);
            }
            if let ProtocolConfig::Grpc { tls: Some(tls) } = &upstream.protocol {
                if tls.cert.is_empty() || tls.key.is_empty() {
                    return Err(ConfigError::InvalidProtocol(format!(
                        "upstream '{}' grpc tls requires both cert and key",
                        upstream.from
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_udp")]
    pub listen_udp: Vec<String>,
    #[serde(default)]
    pub listen_tcp: Vec<String>,
    #[serde(default = "default_try_duration", with = "humantime_serde")]
    pub try_duration: Duration,
    #[serde(default = "default_reload_debounce_ms")]
    pub config_reload_debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_udp: default_listen_udp(),
            listen_tcp: Vec::new(),
            try_duration: default_try_duration(),
            config_reload_debounce_ms: default_reload_debounce_ms(),
        }
    }
}

fn default_listen_udp() -> Vec<String> {
    vec!["0.0.0.0:5300".to_string()]
}

fn default_try_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_reload_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub prometheus_listen: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_listen: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_from")]
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_fail_timeout", with = "humantime_serde")]
    pub fail_timeout: Duration,
    #[serde(default = "default_max_fails")]
    pub max_fails: i32,
    #[serde(default)]
    pub spray: bool,
    #[serde(default)]
    pub without: String,
    #[serde(default)]
    pub except: Vec<String>,
    #[serde(default, flatten)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_from() -> String {
    ".".to_string()
}

fn default_fail_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_fails() -> i32 {
    1
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Random,
    RoundRobin,
    LeastConn,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolConfig {
    Dns,
    HttpsGoogle {
        #[serde(default = "default_google_bootstrap")]
        bootstrap: Vec<String>,
    },
    Grpc {
        #[serde(default)]
        tls: Option<GrpcTlsConfig>,
    },
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig::Dns
    }
}

fn default_google_bootstrap() -> Vec<String> {
    vec!["8.8.8.8:53".to_string(), "8.8.4.4:53".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcTlsConfig {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default = "default_health_check_port")]
    pub port: u16,
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_health_check_port() -> u16 {
    80
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

/// Expands `to` entries, substituting in line-delimited nameservers for any
/// entry that names an existing file, matching `dnsutil.ParseHostPortOrFile`.
pub fn resolve_hosts(to: &[String]) -> anyhow::Result<Vec<String>> {
    let mut hosts = Vec::new();
    for entry in to {
        if Path::new(entry).is_file() {
            let content = fs::read_to_string(entry)
                .with_context(|| format!("failed to read nameserver file {entry}"))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    hosts.push(line.to_string());
                }
            }
        } else {
            hosts.push(entry.clone());
        }
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_upstream() -> UpstreamConfig {
        UpstreamConfig {
            from: ".".to_string(),
            to: vec!["127.0.0.1:53".to_string()],
            policy: PolicyKind::Random,
            fail_timeout: default_fail_timeout(),
            max_fails: 1,
            spray: false,
            without: String::new(),
            except: Vec::new(),
            protocol: ProtocolConfig::Dns,
            health_check: None,
        }
    }

    #[test]
    fn validate_rejects_empty_upstream_list() {
        let cfg = PrxDnsConfig {
            server: ServerConfig::default(),
            observability: ObservabilityConfig::default(),
            upstreams: Vec::new(),
        };
        let err = cfg.validate().expect_err("empty upstream list should fail");
        assert!(err.to_string().contains("[[upstream]]"));
    }

    #[test]
    fn validate_rejects_upstream_without_hosts() {
        let mut upstream = valid_upstream();
        upstream.to.clear();
        let cfg = PrxDnsConfig {
            server: ServerConfig::default(),
            observability: ObservabilityConfig::default(),
            upstreams: vec![upstream],
        };
        let err = cfg.validate().expect_err("empty `to` should fail");
        assert!(err.to_string().contains("`to`"));
    }

    #[test]
    fn validate_rejects_an_unparseable_domain() {
        let mut upstream = valid_upstream();
        upstream.from = "not a domain".to_string();
        let cfg = PrxDnsConfig {
            server: ServerConfig::default(),
            observability: ObservabilityConfig::default(),
            upstreams: vec![upstream],
        };
        let err = cfg.validate().expect_err("malformed `from` should fail");
        assert!(err.downcast_ref::<ConfigError>().is_some());
        assert!(matches!(
            err.downcast_ref::<ConfigError>().unwrap(),
            ConfigError::InvalidDomain(_)
        ));
    }

    #[test]
    fn validate_rejects_grpc_tls_missing_cert_or_key() {
        let mut upstream = valid_upstream();
        upstream.protocol = ProtocolConfig::Grpc {
            tls: Some(GrpcTlsConfig {
                cert: String::new(),
                key: String::new(),
                ca: None,
            }),
        };
        let cfg = PrxDnsConfig {
            server: ServerConfig::default(),
            observability: ObservabilityConfig::default(),
            upstreams: vec![upstream],
        };
        let err = cfg.validate().expect_err("missing grpc tls cert/key should fail");
        assert!(matches!(
            err.downcast_ref::<ConfigError>().unwrap(),
            ConfigError::InvalidProtocol(_)
        ));
    }

    #[test]
    fn resolve_hosts_passes_through_literal_addresses() {
        let hosts = resolve_hosts(&["127.0.0.1:53".to_string()]).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:53".to_string()]);
    }

    #[test]
    fn resolve_hosts_expands_nameserver_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ns.list");
        fs::write(&path, "127.0.0.1:53\n127.0.0.2:53\n").unwrap();
        let hosts = resolve_hosts(&[path.to_string_lossy().to_string()]).unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:53".to_string(), "127.0.0.2:53".to_string()]);
    }
}
