use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::exchange::Exchanger;
use crate::policy::Policy;

/// A single backend endpoint with health state (spec.md §3 "UpstreamHost").
///
/// `fails` and `unhealthy` are `Arc`-wrapped so a spawned decrement task or
/// the health-check worker can hold a cheap clone without needing a
/// reference back into the owning `Upstream`.
pub struct UpstreamHost {
    name: String,
    conns: AtomicI64,
    fails: Arc<AtomicI32>,
    unhealthy: Arc<AtomicBool>,
    fail_timeout: Duration,
    max_fails: i32,
}

impl UpstreamHost {
    pub fn new(name: String, fail_timeout: Duration, max_fails: i32) -> Self {
        Self {
            name,
            conns: AtomicI64::new(0),
            fails: Arc::new(AtomicI32::new(0)),
            unhealthy: Arc::new(AtomicBool::new(false)),
            fail_timeout,
            max_fails,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conns(&self) -> i64 {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn inc_conns(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conns(&self) {
        self.conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    pub fn set_unhealthy(&self, value: bool) {
        self.unhealthy.store(value, Ordering::Relaxed);
    }

    /// A cheap clone of the `unhealthy` flag for the active health-check
    /// worker to write into without holding a reference back into this host.
    pub fn unhealthy_handle(&self) -> Arc<AtomicBool> {
        self.unhealthy.clone()
    }

    /// `Down()` predicate: `unhealthy || fails >= max_fails`, with
    /// `max_fails == 0` disabling the passive check entirely.
    pub fn is_down(&self) -> bool {
        if self.unhealthy.load(Ordering::Relaxed) {
            return true;
        }
        if self.max_fails == 0 {
            return false;
        }
        self.fails.load(Ordering::Relaxed) >= self.max_fails
    }

    /// Increments the failure counter and schedules exactly one matching
    /// decrement after `fail_timeout`, per spec.md's invariant.
    pub fn record_failure(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
        let fails = self.fails.clone();
        let timeout = self.fail_timeout;
        let name = self.name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            fails.fetch_sub(1, Ordering::Relaxed);
            trace!(host = %name, "failure record decayed");
        });
    }
}

/// A logical routing target: one zone suffix, one pool of hosts, one
/// exchanger (spec.md §3 "Upstream"). Immutable after construction; the
/// registry replaces the whole `Vec<Upstream>` by pointer swap rather than
/// mutating one in place.
pub struct Upstream {
    pub from: String,
    pub hosts: Vec<UpstreamHost>,
    pub policy: Policy,
    pub spray: bool,
    pub ignored_sub_domains: Vec<String>,
    pub without: String,
    pub exchanger: Arc<dyn Exchanger>,
    pub health_task: Option<JoinHandle<()>>,
}

impl Upstream {
    /// Selection algorithm over `self.hosts` (spec.md §4.4):
    /// 1. a pool of one returns it unless down-and-no-spray,
    /// 2. all-down falls back to spray if enabled, else `None`,
    /// 3. otherwise the configured policy picks among non-down hosts,
    ///    falling back to spray if the policy itself comes up empty.
    pub fn select(&self) -> Option<&UpstreamHost> {
        if self.hosts.is_empty() {
            return None;
        }

        if self.hosts.len() == 1 {
            let only = &self.hosts[0];
            if only.is_down() && !self.spray {
                return None;
            }
            return Some(only);
        }

        let non_down: Vec<usize> = (0..self.hosts.len())
            .filter(|&idx| !self.hosts[idx].is_down())
            .collect();

        if non_down.is_empty() {
            if !self.spray {
                return None;
            }
            let all: Vec<usize> = (0..self.hosts.len()).collect();
            return Policy::Spray.select(&self.hosts, &all);
        }

        if let Some(picked) = self.policy.select(&self.hosts, &non_down) {
            return Some(picked);
        }

        if !self.spray {
            return None;
        }
        let all: Vec<usize> = (0..self.hosts.len()).collect();
        Policy::Spray.select(&self.hosts, &all)
    }

    /// `IsAllowedDomain`: an exact match on `from` is always allowed;
    /// otherwise any configured `except` suffix bypasses this upstream.
    pub fn is_allowed_domain(&self, name: &str) -> bool {
        if name.eq_ignore_ascii_case(&self.from) {
            return true;
        }
        !self
            .ignored_sub_domains
            .iter()
            .any(|suffix| name_matches_suffix(name, suffix))
    }
}

/// Suffix match used both for upstream routing (`from`) and `except`
/// bypass lists: `name` matches `suffix` if equal or `name` ends with
/// `.suffix` (after accounting for the root zone `.`).
pub fn name_matches_suffix(name: &str, suffix: &str) -> bool {
    if suffix == "." {
        return true;
    }
    let name = name.trim_end_matches('.');
    let suffix = suffix.trim_end_matches('.');
    name.eq_ignore_ascii_case(suffix) || name.to_ascii_lowercase().ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
}
