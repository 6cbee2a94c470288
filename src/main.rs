mod config;
mod dispatch;
mod error;
mod exchange;
mod health;
mod metrics;
mod policy;
mod registry;
mod reload;
mod request;
mod server;
mod singleflight;
mod upstream;

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Router, routing::get};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{config::PrxDnsConfig, reload::spawn_config_watcher, registry::Registry};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<()> {
    let config_path = env::var("PRX_DNS_CONFIG").unwrap_or_else(|_| "PrxDns.toml".to_string());
    let config_path = PathBuf::from(config_path);
    let app_config = PrxDnsConfig::from_file(&config_path)?;
    init_tracing(&app_config.observability.log_level);

    let registry = Arc::new(Registry::from_config(&app_config)?);
    let try_duration = app_config.server.try_duration;

    let mut listeners = Vec::new();
    for addr in &app_config.server.listen_udp {
        let registry = registry.clone();
        let addr = addr.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(err) = server::serve_udp(&addr, registry, try_duration).await {
                tracing::error!(error = %err, addr, "udp listener exited");
            }
        }));
    }
    for addr in &app_config.server.listen_tcp {
        let registry = registry.clone();
        let addr = addr.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(err) = server::serve_tcp(&addr, registry, try_duration).await {
                tracing::error!(error = %err, addr, "tcp listener exited");
            }
        }));
    }

    spawn_config_watcher(
        config_path.clone(),
        Duration::from_millis(app_config.server.config_reload_debounce_ms.max(50)),
        registry.clone(),
    )
    .with_context(|| {
        format!(
            "failed to start config watcher for {}",
            config_path.to_string_lossy()
        )
    })?;

    if let Some(metrics_addr) = app_config.observability.prometheus_listen.clone() {
        listeners.push(tokio::spawn(async move {
            if let Err(err) = serve_metrics(&metrics_addr).await {
                tracing::error!(error = %err, addr = metrics_addr, "metrics listener exited");
            }
        }));
        info!(listen = %app_config.observability.prometheus_listen.as_deref().unwrap_or(""), "prometheus metrics endpoint is enabled");
    }

    info!(
        config = %config_path.to_string_lossy(),
        "prx-dns is starting"
    );

    for listener in listeners {
        let _ = listener.await;
    }

    Ok(())
}

async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_text().unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to gather metrics");
        String::new()
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
