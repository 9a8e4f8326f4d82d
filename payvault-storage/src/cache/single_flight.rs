//! Per-key single-flight coordination.
//!
//! The first caller for a key becomes the leader and runs the work; every
//! caller arriving while that flight is open subscribes to a `watch`
//! channel and receives the leader's result, success or error.
//!
//! A flight is only shared between callers that observed the same
//! generations. A caller arriving after an invalidation carries a newer
//! snapshot and starts its own flight instead of joining one whose result
//! predates the invalidation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use payvault_core::{CacheError, PayvaultResult, StorageError};
use tokio::sync::watch;

use super::tag_index::GenerationSnapshot;

type Outcome = Option<PayvaultResult<Arc<[u8]>>>;

#[derive(Debug)]
struct Flight {
    generation: GenerationSnapshot,
    rx: watch::Receiver<Outcome>,
}

/// In-flight computations keyed by cache key.
///
/// The map lock is only held to look up or insert a channel, never across
/// an await point.
#[derive(Debug, Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, Flight>>,
}

enum Role {
    Leader(watch::Sender<Outcome>, watch::Receiver<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

/// Removes the leader's flight entry when it finishes or is cancelled.
struct FlightGuard<'a> {
    group: &'a SingleFlight,
    key: &'a str,
    own: watch::Receiver<Outcome>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = match self.group.inflight.lock() {
            Ok(inflight) => inflight,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A newer flight may have replaced ours; leave it alone.
        let ours = inflight
            .get(self.key)
            .is_some_and(|flight| flight.rx.same_channel(&self.own));
        if ours {
            inflight.remove(self.key);
        }
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a flight for it at the same `generation`
    /// is already open, in which case wait for that flight's result instead.
    ///
    /// If the leader is dropped before publishing (its task was cancelled),
    /// followers receive `CacheError::LeaderAborted`.
    pub async fn run<F, Fut>(
        &self,
        key: &str,
        generation: GenerationSnapshot,
        work: F,
    ) -> PayvaultResult<Arc<[u8]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PayvaultResult<Arc<[u8]>>>,
    {
        match self.join(key, generation)? {
            Role::Leader(tx, own) => {
                let _guard = FlightGuard {
                    group: self,
                    key,
                    own,
                };
                let result = work().await;
                // Publish before the guard removes the entry so nobody who
                // subscribed in between misses the result.
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Follower(mut rx) => {
                tracing::trace!(key, "Waiting on in-flight compute");
                let outcome = rx.wait_for(Option::is_some).await;
                match outcome {
                    Ok(published) => match &*published {
                        Some(result) => result.clone(),
                        None => Err(leader_aborted(key)),
                    },
                    Err(_) => Err(leader_aborted(key)),
                }
            }
        }
    }

    /// Number of keys with an open flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|inflight| inflight.len()).unwrap_or(0)
    }

    fn join(&self, key: &str, generation: GenerationSnapshot) -> PayvaultResult<Role> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        if let Some(flight) = inflight.get(key) {
            if flight.generation == generation {
                return Ok(Role::Follower(flight.rx.clone()));
            }
            tracing::debug!(key, "Open flight predates an invalidation, starting a new one");
        }
        let (tx, rx) = watch::channel(None);
        let own = rx.clone();
        inflight.insert(key.to_string(), Flight { generation, rx });
        Ok(Role::Leader(tx, own))
    }
}

fn leader_aborted(key: &str) -> payvault_core::PayvaultError {
    CacheError::LeaderAborted {
        key: key.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tag_index::TagIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn bytes(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    fn current() -> GenerationSnapshot {
        TagIndex::new().snapshot::<&str>("k", &[])
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let group = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                group
                    .run("salary_overview", current(), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(bytes("42"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.expect("join").expect("result");
            assert_eq!(&*value, b"42");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_reach_followers() {
        let group = Arc::new(SingleFlight::new());
        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("k", current(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(CacheError::ComputeFailed {
                            key: "k".to_string(),
                            reason: "boom".to_string(),
                        }
                        .into())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = group.run("k", current(), || async { Ok(bytes("unused")) }).await;

        let expected: payvault_core::PayvaultError = CacheError::ComputeFailed {
            key: "k".to_string(),
            reason: "boom".to_string(),
        }
        .into();
        assert_eq!(follower, Err(expected.clone()));
        assert_eq!(leader.await.expect("join"), Err(expected));
    }

    #[tokio::test]
    async fn test_cancelled_leader_aborts_followers() {
        let group = Arc::new(SingleFlight::new());
        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("k", current(), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(bytes("never"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run("k", current(), || async { Ok(bytes("x")) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let result = follower.await.expect("join");
        assert!(matches!(
            result,
            Err(payvault_core::PayvaultError::Cache(CacheError::LeaderAborted { .. }))
        ));

        // The key is free again for a new leader.
        let fresh = group.run("k", current(), || async { Ok(bytes("fresh")) }).await;
        assert_eq!(&*fresh.expect("fresh"), b"fresh");
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_wait_on_each_other() {
        let group = SingleFlight::new();
        let (a, b) = tokio::join!(
            group.run("a", current(), || async { Ok(bytes("a")) }),
            group.run("b", current(), || async { Ok(bytes("b")) }),
        );
        assert_eq!(&*a.expect("a"), b"a");
        assert_eq!(&*b.expect("b"), b"b");
    }

    #[tokio::test]
    async fn test_newer_generation_starts_its_own_flight() {
        let group = Arc::new(SingleFlight::new());
        let index = TagIndex::new();
        let before = index.snapshot("k", &["salaries"]);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let stale = {
            let group = Arc::clone(&group);
            let before = before.clone();
            tokio::spawn(async move {
                group
                    .run("k", before, || async move {
                        let _ = release_rx.await;
                        Ok(bytes("before"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(group.in_flight(), 1);

        index.bump_tags(&["salaries"]);
        let after = index.snapshot("k", &["salaries"]);
        let (fresh_tx, fresh_rx) = tokio::sync::oneshot::channel::<()>();
        let fresh = {
            let group = Arc::clone(&group);
            let after = after.clone();
            tokio::spawn(async move {
                group
                    .run("k", after, || async move {
                        let _ = fresh_rx.await;
                        Ok(bytes("after"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The stale leader finishing must not drop the newer flight.
        release_tx.send(()).expect("stale leader waiting");
        assert_eq!(&*stale.await.expect("join").expect("stale"), b"before");
        assert_eq!(group.in_flight(), 1);

        // A caller at the new generation joins the newer flight.
        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run("k", after, || async { Ok(bytes("unused")) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fresh_tx.send(()).expect("fresh leader waiting");

        assert_eq!(&*fresh.await.expect("join").expect("fresh"), b"after");
        assert_eq!(&*follower.await.expect("join").expect("follower"), b"after");
        assert_eq!(group.in_flight(), 0);
    }
}
