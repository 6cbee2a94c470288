use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::config::{self, PrxDnsConfig, UpstreamConfig};
use crate::exchange;
use crate::health;
use crate::policy::Policy;
use crate::upstream::{Upstream, UpstreamHost, name_matches_suffix};

/// Holds the live upstream pool behind an `ArcSwap` so readers take a
/// snapshot at the start of each dispatch and replacement is always a full
/// pointer swap (spec.md §4.2) — never in-place mutation.
pub struct Registry {
    upstreams: ArcSwap<Vec<Upstream>>,
}

impl Registry {
    pub fn from_config(config: &PrxDnsConfig) -> anyhow::Result<Self> {
        let upstreams = build_upstreams(config)?;
        Ok(Self {
            upstreams: ArcSwap::from_pointee(upstreams),
        })
    }

    pub fn snapshot(&self) -> Arc<Vec<Upstream>> {
        self.upstreams.load_full()
    }

    /// Builds a fresh upstream pool from `config` and swaps it in, aborting
    /// the previous generation's health-check workers so a reload never
    /// leaves orphaned probers running.
    pub fn reload(&self, config: &PrxDnsConfig) -> anyhow::Result<()> {
        let next = build_upstreams(config)?;
        let previous = self.upstreams.swap(Arc::new(next));
        for upstream in previous.iter() {
            if let Some(task) = &upstream.health_task {
                task.abort();
            }
        }
        info!(upstreams = self.upstreams.load().len(), "registry reloaded");
        Ok(())
    }
}

fn build_upstreams(config: &PrxDnsConfig) -> anyhow::Result<Vec<Upstream>> {
    config
        .upstreams
        .iter()
        .map(build_upstream)
        .collect::<anyhow::Result<Vec<_>>>()
}

fn build_upstream(config: &UpstreamConfig) -> anyhow::Result<Upstream> {
    let resolved = config::resolve_hosts(&config.to)?;
    let hosts: Vec<UpstreamHost> = resolved
        .into_iter()
        .map(|name| UpstreamHost::new(name, config.fail_timeout, config.max_fails))
        .collect();

    let exchanger = exchange::build_exchanger(&config.protocol)?;

    let except: Vec<String> = config
        .except
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();

    let health_task = config
        .health_check
        .as_ref()
        .map(|hc| health::spawn_health_check_worker(&hosts, hc.clone()));

    Ok(Upstream {
        from: config.from.to_ascii_lowercase(),
        hosts,
        policy: Policy::from_kind(config.policy),
        spray: config.spray,
        ignored_sub_domains: except,
        without: config.without.clone(),
        exchanger,
        health_task,
    })
}

/// Scans all upstreams for the one whose `from` is the longest suffix
/// match of `name` that also allows routing this name (spec.md §4.1
/// `match(name)`). Ties are broken by first-configured because only a
/// strictly longer match replaces the current winner.
pub fn match_upstream<'a>(upstreams: &'a [Upstream], name: &str) -> Option<&'a Upstream> {
    let mut best: Option<&Upstream> = None;
    let mut best_len = 0usize;

    for upstream in upstreams {
        if !name_matches_suffix(name, &upstream.from) {
            continue;
        }
        if !upstream.is_allowed_domain(name) {
            continue;
        }
        if upstream.from.len() > best_len {
            best_len = upstream.from.len();
            best = Some(upstream);
        }
    }

    best
}
