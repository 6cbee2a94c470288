use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

/// A keyed deduplicator: `do_call(key, fn)` guarantees that concurrent
/// callers presenting the same key observe exactly one invocation of `fn`
/// and share its result by reference (spec.md §4.6).
///
/// Only this map is lock-protected; everything else in the core uses
/// atomics, per spec.md §5's locking discipline.
pub struct SingleflightGroup<K, V, E> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<Result<Arc<V>, Arc<E>>>>>>,
}

impl<K, V, E> Default for SingleflightGroup<K, V, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> SingleflightGroup<K, V, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` at most once per key among overlapping callers. Followers
    /// that arrive while a call for `key` is in flight await the same
    /// result; the entry is retired once the leader resolves so the next
    /// non-overlapping call starts a fresh exchange.
    pub async fn do_call<F, Fut>(&self, key: K, f: F) -> Result<Arc<V>, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async move {
                match f().await {
                    Ok(value) => Ok(Arc::new(value)),
                    Err(err) => Err(Arc::new(err)),
                }
            })
            .await
            .clone();

        self.inflight.lock().await.remove(&key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_identical_keys_share_one_call() {
        let group: Arc<SingleflightGroup<&'static str, u32, String>> =
            Arc::new(SingleflightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .do_call("example.com A IN", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<u32, String>(42)
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(*result, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_each_invoke_independently() {
        let group: SingleflightGroup<&'static str, u32, String> = SingleflightGroup::new();
        let a = group.do_call("a", || async { Ok::<u32, String>(1) }).await;
        let b = group.do_call("b", || async { Ok::<u32, String>(2) }).await;
        assert_eq!(*a.unwrap(), 1);
        assert_eq!(*b.unwrap(), 2);
    }

    #[tokio::test]
    async fn sequential_calls_with_the_same_key_each_run_again() {
        let group: SingleflightGroup<&'static str, u32, String> = SingleflightGroup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            group
                .do_call("k", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, String>(7)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
