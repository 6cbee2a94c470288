use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::PolicyKind;
use crate::upstream::UpstreamHost;

/// A selection strategy over a fixed pool of hosts (spec.md §4.4).
///
/// `select` is only ever asked to pick among the indices the caller has
/// already filtered for `!Down()`, except [`Policy::Spray`] which ignores
/// down state entirely and is only ever invoked as a last resort.
pub enum Policy {
    Random,
    RoundRobin { cursor: AtomicUsize },
    LeastConn,
    Spray,
}

impl Policy {
    pub fn from_kind(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Random => Policy::Random,
            PolicyKind::RoundRobin => Policy::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            PolicyKind::LeastConn => Policy::LeastConn,
        }
    }

    /// Selects among `candidates`, a slice of indices into `hosts` that the
    /// caller has already restricted to whatever eligibility this policy
    /// should respect (non-down for the primary policies, the full pool for
    /// spray).
    pub fn select<'a>(
        &self,
        hosts: &'a [UpstreamHost],
        candidates: &[usize],
    ) -> Option<&'a UpstreamHost> {
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self {
            Policy::Random | Policy::Spray => {
                let idx = rand::rng().random_range(0..candidates.len());
                candidates[idx]
            }
            Policy::RoundRobin { cursor } => {
                let start = cursor.fetch_add(1, Ordering::Relaxed);
                candidates[start % candidates.len()]
            }
            Policy::LeastConn => *candidates
                .iter()
                .min_by_key(|&&idx| hosts[idx].conns())
                .expect("candidates is non-empty"),
        };

        hosts.get(chosen)
    }
}
