use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::HealthCheckConfig;
use crate::upstream::UpstreamHost;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns the single active-probing task for one upstream's host pool
/// (spec.md §4.3). Every `interval` it issues an HTTP GET to
/// `http://{host}:{port}{path}` for each host, marking `unhealthy` true iff
/// the request errors or the status falls outside `[200, 400)`.
pub fn spawn_health_check_worker(hosts: &[UpstreamHost], config: HealthCheckConfig) -> JoinHandle<()> {
    let probes: Vec<(String, Arc<AtomicBool>)> = hosts
        .iter()
        .map(|host| (strip_port(host.name()), host.unhealthy_handle()))
        .collect();

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("failed to build health-check http client");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        loop {
            interval.tick().await;
            for (host_ip, unhealthy) in &probes {
                let url = format!("http://{host_ip}:{}{}", config.port, config.path);
                let healthy = probe_once(&client, &url).await;
                unhealthy.store(!healthy, Ordering::Relaxed);
            }
        }
    })
}

async fn probe_once(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            // Drain and discard the body before the connection is returned.
            if let Err(err) = response.bytes().await {
                warn!(url, error = %err, "health check body drain failed");
            }
            (200..400).contains(&status)
        }
        Err(err) => {
            warn!(url, error = %err, "health check request failed");
            false
        }
    }
}

fn strip_port(addr: &str) -> String {
    if let Some(idx) = addr.rfind(':') {
        if addr[..idx].contains(':') {
            // looks like a bare IPv6 literal without brackets; leave as-is
            return addr.to_string();
        }
        return addr[..idx].to_string();
    }
    addr.to_string()
}
